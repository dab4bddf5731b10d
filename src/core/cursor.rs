//! Checked reader over a verb payload.
//!
//! Optional fields shift every field after them, so payload parsing walks the
//! bytes with an explicit position instead of fixed offsets. Every read is
//! bounds-checked and reports [`ProtocolError::Truncated`] rather than
//! panicking.

use crate::core::address::{Address, Mac};
use crate::error::{ProtocolError, Result};
use bytes::Buf;

#[derive(Debug, Clone)]
pub struct PayloadReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Current offset from the start of the payload.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Take the next `len` bytes, advancing past them.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or(ProtocolError::Truncated)?;
        let out = self.data.get(self.pos..end).ok_or(ProtocolError::Truncated)?;
        self.pos = end;
        Ok(out)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.read_bytes(len).map(|_| ())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?.get_u8())
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(self.read_bytes(2)?.get_u16())
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(self.read_bytes(4)?.get_u32())
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(self.read_bytes(8)?.get_u64())
    }

    pub fn read_address(&mut self) -> Result<Address> {
        Address::from_bytes(self.read_bytes(Address::LENGTH)?)
    }

    pub fn read_mac(&mut self) -> Result<Mac> {
        Mac::from_bytes(self.read_bytes(Mac::LENGTH)?)
    }

    /// Bytes preceded by a big-endian 16-bit length.
    pub fn read_length_prefixed(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u16()? as usize;
        self.read_bytes(len)
    }

    /// Everything not yet consumed.
    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.data[self.pos..];
        self.pos = self.data.len();
        out
    }

    /// Unconsumed bytes without advancing.
    pub fn peek_rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }
}
