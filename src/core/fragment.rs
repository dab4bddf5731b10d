//! Fragments of packets too large for one datagram.
//!
//! ```text
//! [0..8)   packet ID of the parent packet
//! [8..13)  destination address
//! [13]     0xff fragment indicator
//! [14]     total fragments (high nibble) | fragment number (low nibble)
//! [15]     hops
//! [16..)   fragment payload
//! ```
//!
//! Byte 13 of a normal packet is the first byte of its source address, which
//! can never be `0xff`, so the indicator is unambiguous. Fragments carry no
//! MAC of their own; the reassembled packet is authenticated as a whole.
//! The head of the series is the packet itself, truncated, with
//! [`FLAG_FRAGMENTED`](crate::core::packet::FLAG_FRAGMENTED) set before armor.

use crate::config::{MAX_FRAGMENTS, MAX_HOPS};
use crate::core::address::Address;
use crate::core::packet::{Packet, MIN_PACKET_LENGTH};
use crate::error::{ProtocolError, Result};
use bytes::BufMut;

pub const IDX_PACKET_ID: usize = 0;
pub const IDX_DEST: usize = 8;
pub const IDX_INDICATOR: usize = 13;
pub const IDX_FRAGMENT_NO: usize = 14;
pub const IDX_HOPS: usize = 15;
pub const IDX_PAYLOAD: usize = 16;

pub const FRAGMENT_INDICATOR: u8 = 0xff;
pub const MIN_FRAGMENT_LENGTH: usize = IDX_PAYLOAD;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    data: Vec<u8>,
}

impl Fragment {
    /// Cut `len` bytes of `packet` starting at `offset` into fragment
    /// `number` of `total`.
    pub fn new(packet: &Packet, offset: usize, len: usize, number: u8, total: u8) -> Result<Self> {
        if number == 0 || number >= total || usize::from(total) > MAX_FRAGMENTS {
            return Err(ProtocolError::MalformedField("fragment number"));
        }
        let bytes = packet.as_bytes();
        let chunk = offset
            .checked_add(len)
            .and_then(|end| bytes.get(offset..end))
            .ok_or(ProtocolError::Truncated)?;

        let mut data = Vec::with_capacity(IDX_PAYLOAD + len);
        data.put_u64(packet.packet_id());
        data.put_slice(&packet.destination().to_bytes());
        data.put_u8(FRAGMENT_INDICATOR);
        data.put_u8(((total & 0x0f) << 4) | (number & 0x0f));
        data.put_u8(0);
        data.put_slice(chunk);
        Ok(Self { data })
    }

    /// Whether a raw datagram is a fragment rather than a packet head.
    pub fn is_fragment(bytes: &[u8]) -> bool {
        bytes.len() >= MIN_FRAGMENT_LENGTH && bytes[IDX_INDICATOR] == FRAGMENT_INDICATOR
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < MIN_FRAGMENT_LENGTH {
            return Err(ProtocolError::Truncated);
        }
        if bytes[IDX_INDICATOR] != FRAGMENT_INDICATOR {
            return Err(ProtocolError::InvalidHeader);
        }
        Ok(Self {
            data: bytes.to_vec(),
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn packet_id(&self) -> u64 {
        let mut id = [0u8; 8];
        id.copy_from_slice(&self.data[IDX_PACKET_ID..IDX_PACKET_ID + 8]);
        u64::from_be_bytes(id)
    }

    pub fn destination(&self) -> Result<Address> {
        Address::from_bytes(&self.data[IDX_DEST..IDX_DEST + Address::LENGTH])
    }

    pub fn total_fragments(&self) -> u8 {
        self.data[IDX_FRAGMENT_NO] >> 4
    }

    pub fn fragment_number(&self) -> u8 {
        self.data[IDX_FRAGMENT_NO] & 0x0f
    }

    pub fn hops(&self) -> u8 {
        self.data[IDX_HOPS]
    }

    pub fn increment_hops(&mut self) -> u8 {
        let hops = self.data[IDX_HOPS].saturating_add(1).min(MAX_HOPS);
        self.data[IDX_HOPS] = hops;
        hops
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[IDX_PAYLOAD..]
    }
}

/// Split an armored packet into a head datagram and trailing fragments so
/// that no datagram exceeds `mtu`. A packet that already fits comes back as
/// a single head with no fragments.
///
/// The caller sets the fragmented flag before armoring whenever
/// `packet.len() > mtu`; this function refuses otherwise, since the flag is
/// part of the authenticated header.
pub fn split(packet: &Packet, mtu: usize) -> Result<(Vec<u8>, Vec<Fragment>)> {
    if mtu < MIN_PACKET_LENGTH {
        return Err(ProtocolError::MalformedField("mtu"));
    }
    let bytes = packet.as_bytes();
    if bytes.len() <= mtu {
        return Ok((bytes.to_vec(), Vec::new()));
    }
    if !packet.fragmented() {
        return Err(ProtocolError::InvalidHeader);
    }

    let per_fragment = mtu - IDX_PAYLOAD;
    let remaining = bytes.len() - mtu;
    let tail_count = remaining.div_ceil(per_fragment);
    let total = tail_count + 1;
    if total > MAX_FRAGMENTS {
        return Err(ProtocolError::OversizedPacket(bytes.len()));
    }

    let mut fragments = Vec::with_capacity(tail_count);
    let mut offset = mtu;
    for number in 1..total {
        let len = per_fragment.min(bytes.len() - offset);
        fragments.push(Fragment::new(packet, offset, len, number as u8, total as u8)?);
        offset += len;
    }
    Ok((bytes[..mtu].to_vec(), fragments))
}
