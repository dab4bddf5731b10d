//! # Packet
//!
//! Wire representation of a protocol packet and its armor.
//!
//! ## Layout
//! ```text
//! [0..8)   IV / packet ID
//! [8..13)  destination address
//! [13..18) source address
//! [18]     flags: FFCCCHHH (F = flags, C = cipher suite, H = hops)
//! [19..27) truncated MAC
//! [27]     envelope flags (top 3 bits) + verb (low 5 bits)
//! [28..)   verb payload
//! ```
//!
//! Everything from byte 27 onward is the envelope: it is covered by the MAC
//! and optionally encrypted. The hop count is the only field relays may
//! modify, so it is masked out of the per-packet key.
//!
//! ## Armor
//! A per-packet key is derived by XORing the shared peer key with the IV,
//! both addresses, the flags byte (hops masked) and the little-endian packet
//! size. Salsa20/12 keyed with it produces a one-time Poly1305 key from its
//! first keystream block, then (optionally) encrypts the envelope. The first
//! 8 bytes of the Poly1305 tag over the envelope are stored in the header.

use crate::config::{ProtocolConfig, MAX_HOPS, MAX_PACKET_LENGTH};
use crate::core::address::Address;
use crate::error::{ProtocolError, Result};
use crate::protocol::verb::Verb;
use crate::utils::compression;
use bytes::BufMut;
use poly1305::universal_hash::KeyInit;
use poly1305::Poly1305;
use salsa20::cipher::{KeyIvInit, StreamCipher};
use salsa20::Salsa12;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

pub const IDX_IV: usize = 0;
pub const IDX_DEST: usize = 8;
pub const IDX_SOURCE: usize = 13;
pub const IDX_FLAGS: usize = 18;
pub const IDX_MAC: usize = 19;
pub const IDX_VERB: usize = 27;
pub const IDX_PAYLOAD: usize = 28;

/// A packet is never shorter than its header plus the verb byte.
pub const MIN_PACKET_LENGTH: usize = IDX_PAYLOAD;

/// Length of the shared secret two peers derive by key agreement.
pub const KEY_LENGTH: usize = 32;

pub const MAC_LENGTH: usize = 8;

/// Legacy "encrypted" flag, set alongside cipher suite 1 for older peers.
pub const FLAG_ENCRYPTED: u8 = 0x80;

/// Packet is the head of a fragmented series.
pub const FLAG_FRAGMENTED: u8 = 0x40;

/// Envelope flag: payload is LZ4 compressed.
pub const VERB_FLAG_COMPRESSED: u8 = 0x80;

const CIPHER_MASK: u8 = 0x38;
const HOPS_MASK: u8 = 0x07;
const VERB_MASK: u8 = 0x1f;

/// Cipher suite selector stored in the flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CipherSuite {
    /// Poly1305 MAC, payload in the clear
    Poly1305None = 0,
    /// Poly1305 MAC over a Salsa20/12 encrypted envelope
    Poly1305Salsa2012 = 1,
    /// Reserved; never accepted
    AesGcm = 2,
}

impl TryFrom<u8> for CipherSuite {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Poly1305None),
            1 => Ok(Self::Poly1305Salsa2012),
            2 => Ok(Self::AesGcm),
            other => Err(ProtocolError::UnsupportedCipher(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    data: Vec<u8>,
}

impl Packet {
    /// Start a packet with a fresh random IV and an empty payload.
    pub fn new(destination: Address, source: Address, verb: Verb) -> Self {
        Self::new_raw(destination, source, verb as u8)
    }

    /// Like [`Packet::new`] with an arbitrary 5-bit verb value.
    pub fn new_raw(destination: Address, source: Address, verb: u8) -> Self {
        let mut data = Vec::with_capacity(256);
        data.put_u64(rand::random::<u64>());
        data.put_slice(&destination.to_bytes());
        data.put_slice(&source.to_bytes());
        data.put_u8(0);
        data.put_slice(&[0u8; MAC_LENGTH]);
        data.put_u8(verb & VERB_MASK);
        Self { data }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::from_vec(bytes.to_vec())
    }

    pub fn from_vec(data: Vec<u8>) -> Result<Self> {
        if data.len() < MIN_PACKET_LENGTH {
            return Err(ProtocolError::Truncated);
        }
        if data.len() > MAX_PACKET_LENGTH {
            return Err(ProtocolError::OversizedPacket(data.len()));
        }
        Ok(Self { data })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The IV doubles as the packet ID.
    pub fn packet_id(&self) -> u64 {
        u64::from_be_bytes(self.iv())
    }

    fn iv(&self) -> [u8; 8] {
        let mut iv = [0u8; 8];
        iv.copy_from_slice(&self.data[IDX_IV..IDX_IV + 8]);
        iv
    }

    /// Replace the IV, giving the packet a new ID. Required before re-sending
    /// the same contents to a different destination.
    pub fn new_initialization_vector(&mut self) {
        self.data[IDX_IV..IDX_IV + 8].copy_from_slice(&rand::random::<u64>().to_be_bytes());
    }

    pub fn destination(&self) -> Address {
        Address::new(read_address(&self.data[IDX_DEST..IDX_DEST + Address::LENGTH]))
    }

    pub fn set_destination(&mut self, destination: Address) {
        self.data[IDX_DEST..IDX_DEST + Address::LENGTH].copy_from_slice(&destination.to_bytes());
    }

    pub fn source(&self) -> Address {
        Address::new(read_address(&self.data[IDX_SOURCE..IDX_SOURCE + Address::LENGTH]))
    }

    pub fn set_source(&mut self, source: Address) {
        self.data[IDX_SOURCE..IDX_SOURCE + Address::LENGTH].copy_from_slice(&source.to_bytes());
    }

    pub fn flags(&self) -> u8 {
        self.data[IDX_FLAGS]
    }

    pub fn hops(&self) -> u8 {
        self.data[IDX_FLAGS] & HOPS_MASK
    }

    /// Bump the hop count, saturating at [`MAX_HOPS`]. Does not invalidate
    /// the MAC.
    pub fn increment_hops(&mut self) -> u8 {
        let hops = (self.hops() + 1).min(MAX_HOPS);
        self.data[IDX_FLAGS] = (self.data[IDX_FLAGS] & !HOPS_MASK) | hops;
        hops
    }

    /// Raw cipher suite selector (3 bits).
    pub fn cipher(&self) -> u8 {
        (self.data[IDX_FLAGS] & CIPHER_MASK) >> 3
    }

    pub fn set_cipher(&mut self, suite: CipherSuite) {
        let mut flags = self.data[IDX_FLAGS] & !CIPHER_MASK;
        flags |= ((suite as u8) << 3) & CIPHER_MASK;
        if suite == CipherSuite::Poly1305Salsa2012 {
            flags |= FLAG_ENCRYPTED;
        } else {
            flags &= !FLAG_ENCRYPTED;
        }
        self.data[IDX_FLAGS] = flags;
    }

    pub fn fragmented(&self) -> bool {
        self.data[IDX_FLAGS] & FLAG_FRAGMENTED != 0
    }

    pub fn set_fragmented(&mut self, fragmented: bool) {
        if fragmented {
            self.data[IDX_FLAGS] |= FLAG_FRAGMENTED;
        } else {
            self.data[IDX_FLAGS] &= !FLAG_FRAGMENTED;
        }
    }

    /// Raw 5-bit verb value. Only meaningful after dearmor if encrypted.
    pub fn verb_raw(&self) -> u8 {
        self.data[IDX_VERB] & VERB_MASK
    }

    pub fn verb(&self) -> Result<Verb> {
        Verb::try_from(self.verb_raw())
    }

    pub fn compressed(&self) -> bool {
        self.data[IDX_VERB] & VERB_FLAG_COMPRESSED != 0
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[IDX_PAYLOAD..]
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.data.put_slice(bytes);
    }

    pub fn append_u8(&mut self, v: u8) {
        self.data.put_u8(v);
    }

    pub fn append_u16(&mut self, v: u16) {
        self.data.put_u16(v);
    }

    pub fn append_u32(&mut self, v: u32) {
        self.data.put_u32(v);
    }

    pub fn append_u64(&mut self, v: u64) {
        self.data.put_u64(v);
    }

    /// Overwrite a big-endian u16 at a payload-relative offset.
    pub fn set_payload_u16(&mut self, offset: usize, v: u16) -> Result<()> {
        let at = IDX_PAYLOAD + offset;
        let slot = self
            .data
            .get_mut(at..at + 2)
            .ok_or(ProtocolError::Truncated)?;
        slot.copy_from_slice(&v.to_be_bytes());
        Ok(())
    }

    /// Mutable payload-relative window, used to mark propagation state in
    /// place before re-sending.
    pub fn payload_window_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8]> {
        let at = IDX_PAYLOAD + offset;
        self.data
            .get_mut(at..at + len)
            .ok_or(ProtocolError::Truncated)
    }

    /// Per-packet key: the shared key with packet-specific bytes folded in.
    fn mangle_key(&self, key: &[u8; KEY_LENGTH]) -> Zeroizing<[u8; KEY_LENGTH]> {
        let mut out = Zeroizing::new(*key);
        for (o, b) in out.iter_mut().zip(&self.data[..IDX_FLAGS]) {
            *o ^= *b;
        }
        out[IDX_FLAGS] ^= self.data[IDX_FLAGS] & 0xf8;
        let size = self.data.len();
        out[19] ^= (size & 0xff) as u8;
        out[20] ^= ((size >> 8) & 0xff) as u8;
        out
    }

    /// Set up the stream cipher for this packet and derive the one-time MAC
    /// key from the first keystream block. The returned cipher is positioned
    /// at the start of the second block.
    fn keystream(&self, key: &[u8; KEY_LENGTH]) -> (Salsa12, Poly1305) {
        let mangled = self.mangle_key(key);
        let iv = self.iv();
        let mut cipher = Salsa12::new(
            salsa20::Key::from_slice(mangled.as_slice()),
            salsa20::Nonce::from_slice(&iv),
        );
        let mut block = Zeroizing::new([0u8; 64]);
        cipher.apply_keystream(block.as_mut_slice());
        let mac = Poly1305::new(poly1305::Key::from_slice(&block[..32]));
        (cipher, mac)
    }

    /// Encrypt (optionally) and MAC the envelope under `key`.
    ///
    /// Must run after [`Packet::compress`] and after any change to the
    /// header other than the hop count.
    pub fn armor(&mut self, key: &[u8; KEY_LENGTH], encrypt: bool) {
        self.set_cipher(if encrypt {
            CipherSuite::Poly1305Salsa2012
        } else {
            CipherSuite::Poly1305None
        });
        let (mut cipher, mac) = self.keystream(key);
        if encrypt {
            cipher.apply_keystream(&mut self.data[IDX_VERB..]);
        }
        let tag = mac.compute_unpadded(&self.data[IDX_VERB..]);
        self.data[IDX_MAC..IDX_MAC + MAC_LENGTH].copy_from_slice(&tag[..MAC_LENGTH]);
    }

    /// Verify and, if encrypted, decrypt the envelope under `key`.
    ///
    /// Nothing is decrypted unless the MAC verifies. Any cipher suite other
    /// than the two implemented ones fails outright.
    pub fn dearmor(&mut self, key: &[u8; KEY_LENGTH]) -> Result<()> {
        let suite = CipherSuite::try_from(self.cipher())?;
        if suite == CipherSuite::AesGcm {
            return Err(ProtocolError::UnsupportedCipher(suite as u8));
        }

        let (mut cipher, mac) = self.keystream(key);
        let tag = mac.compute_unpadded(&self.data[IDX_VERB..]);
        let authentic: bool = tag[..MAC_LENGTH]
            .ct_eq(&self.data[IDX_MAC..IDX_MAC + MAC_LENGTH])
            .into();
        if !authentic {
            return Err(ProtocolError::AuthenticationFailed);
        }

        if suite == CipherSuite::Poly1305Salsa2012 {
            cipher.apply_keystream(&mut self.data[IDX_VERB..]);
        }
        Ok(())
    }

    /// Compress the payload with the default policy.
    pub fn compress(&mut self) -> bool {
        self.compress_with(&ProtocolConfig::default())
    }

    /// Compress the payload if the policy allows it and it actually shrinks.
    /// Returns whether the payload is now compressed. When compression is not
    /// applied the compressed flag is cleared.
    pub fn compress_with(&mut self, policy: &ProtocolConfig) -> bool {
        if self.compressed() {
            return true;
        }

        let payload = self.payload();
        let eligible = policy.compression_enabled
            && payload.len() > policy.compression_min_payload
            && (!policy.adaptive_compression || compression::is_compressible(payload));

        if eligible {
            if let Ok(packed) = compression::compress_block(payload) {
                if packed.len() < payload.len() {
                    self.data.truncate(IDX_PAYLOAD);
                    self.data.extend_from_slice(&packed);
                    self.data[IDX_VERB] |= VERB_FLAG_COMPRESSED;
                    return true;
                }
            }
        }

        self.data[IDX_VERB] &= !VERB_FLAG_COMPRESSED;
        false
    }

    /// Undo [`Packet::compress`]. A packet without the compressed flag is
    /// left untouched. Must run after [`Packet::dearmor`].
    pub fn uncompress(&mut self) -> Result<()> {
        self.uncompress_within(MAX_PACKET_LENGTH)
    }

    /// [`Packet::uncompress`] with the whole packet, header included, capped
    /// at `max_len` bytes once expanded.
    pub fn uncompress_within(&mut self, max_len: usize) -> Result<()> {
        if !self.compressed() {
            return Ok(());
        }
        if self.data.len() > IDX_PAYLOAD {
            let limit = max_len.min(MAX_PACKET_LENGTH).saturating_sub(IDX_PAYLOAD);
            let unpacked = compression::decompress_block(self.payload(), limit)?;
            self.data.truncate(IDX_PAYLOAD);
            self.data.extend_from_slice(&unpacked);
        }
        self.data[IDX_VERB] &= !VERB_FLAG_COMPRESSED;
        Ok(())
    }
}

fn read_address(b: &[u8]) -> u64 {
    b.iter().fold(0u64, |acc, &x| (acc << 8) | u64::from(x))
}
