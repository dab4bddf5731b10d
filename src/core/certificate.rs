//! Certificate of membership (COM).
//!
//! A COM is a set of `(id, value, max_delta)` qualifiers signed by a network
//! controller. Two certificates agree when every qualifier of one is within
//! its max delta of the matching qualifier of the other, which lets the
//! timestamp qualifier express a sliding validity window.
//!
//! ```text
//! [1] version (1)
//! [2] qualifier count
//!     count x ([8] id, [8] value, [8] max delta)
//! [5] signer address
//! [64] Ed25519 signature (present only if signer is non-zero)
//! ```
//!
//! Parsing only checks structure. Whether the signature is trusted is the
//! owning network's decision.

use crate::core::address::Address;
use crate::core::cursor::PayloadReader;
use crate::core::identity::{Identity, LocalIdentity, SIGNATURE_LENGTH};
use crate::error::{ProtocolError, Result};
use bytes::BufMut;

pub const COM_VERSION: u8 = 1;
pub const MAX_QUALIFIERS: usize = 8;

pub const QUALIFIER_TIMESTAMP: u64 = 0;
pub const QUALIFIER_NETWORK_ID: u64 = 1;
pub const QUALIFIER_ISSUED_TO: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Qualifier {
    pub id: u64,
    pub value: u64,
    pub max_delta: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CertificateOfMembership {
    qualifiers: Vec<Qualifier>,
    signed_by: Address,
    signature: Option<[u8; SIGNATURE_LENGTH]>,
}

impl CertificateOfMembership {
    /// Unsigned certificate carrying the three required qualifiers.
    pub fn new(timestamp: u64, timestamp_max_delta: u64, network_id: u64, issued_to: Address) -> Self {
        let mut com = Self::default();
        com.set_qualifier(QUALIFIER_TIMESTAMP, timestamp, timestamp_max_delta);
        com.set_qualifier(QUALIFIER_NETWORK_ID, network_id, 0);
        com.set_qualifier(QUALIFIER_ISSUED_TO, issued_to.to_u64(), u64::MAX);
        com
    }

    /// Insert or replace a qualifier, keeping them ordered by id. Any
    /// existing signature is discarded.
    pub fn set_qualifier(&mut self, id: u64, value: u64, max_delta: u64) {
        self.signed_by = Address::default();
        self.signature = None;
        let q = Qualifier { id, value, max_delta };
        match self.qualifiers.binary_search_by_key(&id, |q| q.id) {
            Ok(i) => self.qualifiers[i] = q,
            Err(i) => self.qualifiers.insert(i, q),
        }
    }

    pub fn qualifiers(&self) -> &[Qualifier] {
        &self.qualifiers
    }

    fn value_of(&self, id: u64) -> Option<u64> {
        self.qualifiers.iter().find(|q| q.id == id).map(|q| q.value)
    }

    pub fn timestamp(&self) -> Option<u64> {
        self.value_of(QUALIFIER_TIMESTAMP)
    }

    pub fn network_id(&self) -> Option<u64> {
        self.value_of(QUALIFIER_NETWORK_ID)
    }

    pub fn issued_to(&self) -> Option<Address> {
        self.value_of(QUALIFIER_ISSUED_TO).map(Address::new)
    }

    pub fn signed_by(&self) -> Address {
        self.signed_by
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    /// The first three qualifiers must be timestamp, network ID and
    /// issued-to, in that order.
    pub fn has_required_fields(&self) -> bool {
        self.qualifiers.len() >= 3
            && self.qualifiers[0].id == QUALIFIER_TIMESTAMP
            && self.qualifiers[1].id == QUALIFIER_NETWORK_ID
            && self.qualifiers[2].id == QUALIFIER_ISSUED_TO
    }

    /// Whether every qualifier of `self` is matched by `other` within
    /// `self`'s max delta.
    pub fn agrees_with(&self, other: &CertificateOfMembership) -> bool {
        if !self.has_required_fields() || !other.has_required_fields() {
            return false;
        }
        self.qualifiers.iter().all(|mine| {
            other
                .qualifiers
                .iter()
                .find(|theirs| theirs.id == mine.id)
                .is_some_and(|theirs| mine.value.abs_diff(theirs.value) <= mine.max_delta)
        })
    }

    fn signed_portion(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.qualifiers.len() * 24);
        for q in &self.qualifiers {
            out.put_u64(q.id);
            out.put_u64(q.value);
            out.put_u64(q.max_delta);
        }
        out
    }

    pub fn sign(&mut self, signer: &LocalIdentity) {
        self.signature = Some(signer.sign(&self.signed_portion()));
        self.signed_by = signer.address();
    }

    /// Check the signature against the claimed signer's identity.
    pub fn verify(&self, signer: &Identity) -> bool {
        match self.signature {
            Some(ref sig) if signer.address() == self.signed_by => {
                signer.verify(&self.signed_portion(), sig)
            }
            _ => false,
        }
    }

    pub fn read(reader: &mut PayloadReader<'_>) -> Result<Self> {
        if reader.read_u8()? != COM_VERSION {
            return Err(ProtocolError::InvalidCertificate);
        }
        let count = reader.read_u16()? as usize;
        if count > MAX_QUALIFIERS {
            return Err(ProtocolError::InvalidCertificate);
        }
        let mut qualifiers = Vec::with_capacity(count);
        for _ in 0..count {
            qualifiers.push(Qualifier {
                id: reader.read_u64()?,
                value: reader.read_u64()?,
                max_delta: reader.read_u64()?,
            });
        }
        let signed_by = reader.read_address()?;
        let signature = if signed_by.is_zero() {
            None
        } else {
            Some(reader.read_array::<SIGNATURE_LENGTH>()?)
        };
        Ok(Self {
            qualifiers,
            signed_by,
            signature,
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::read(&mut PayloadReader::new(bytes))
    }

    pub fn write_to<B: BufMut>(&self, out: &mut B) {
        out.put_u8(COM_VERSION);
        out.put_u16(self.qualifiers.len() as u16);
        for q in &self.qualifiers {
            out.put_u64(q.id);
            out.put_u64(q.value);
            out.put_u64(q.max_delta);
        }
        match self.signature {
            Some(ref sig) => {
                out.put_slice(&self.signed_by.to_bytes());
                out.put_slice(sig);
            }
            None => out.put_slice(&Address::default().to_bytes()),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.serialized_len());
        self.write_to(&mut out);
        out
    }

    pub fn serialized_len(&self) -> usize {
        let sig = if self.signature.is_some() {
            SIGNATURE_LENGTH
        } else {
            0
        };
        3 + self.qualifiers.len() * 24 + Address::LENGTH + sig
    }
}
