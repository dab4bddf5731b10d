//! Node identities.
//!
//! A node is its key pair: an X25519 key for agreement and an Ed25519 key
//! for signatures. The 40-bit address is the first five bytes of the SHA-512
//! hash of both public keys, so anyone can check that an address and a
//! public key belong together without trusting the network.
//!
//! Wire form:
//! ```text
//! [5] address  [1] type (0)  [64] X25519 public || Ed25519 public
//! [1] private key length  [n] private key (only in local storage)
//! ```

use crate::core::address::Address;
use crate::core::cursor::PayloadReader;
use crate::core::packet::KEY_LENGTH;
use crate::error::{constants, ProtocolError, Result};
use bytes::BufMut;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha512};
use std::fmt;
use std::str::FromStr;
use tracing::warn;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

pub const IDENTITY_TYPE_C25519: u8 = 0;
pub const PUBLIC_KEY_LENGTH: usize = 64;
pub const SIGNATURE_LENGTH: usize = 64;

/// Upper bound on attempts to find a key pair with a usable address.
const MAX_GENERATE_ATTEMPTS: usize = 64;

/// Public identity of a node.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    address: Address,
    public: [u8; PUBLIC_KEY_LENGTH],
}

impl Identity {
    pub fn address(&self) -> Address {
        self.address
    }

    pub fn public_key(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        &self.public
    }

    fn dh_public(&self) -> [u8; 32] {
        let mut k = [0u8; 32];
        k.copy_from_slice(&self.public[..32]);
        k
    }

    fn signing_public(&self) -> [u8; 32] {
        let mut k = [0u8; 32];
        k.copy_from_slice(&self.public[32..]);
        k
    }

    /// Read an identity from a payload, skipping any private key material.
    pub fn read(reader: &mut PayloadReader<'_>) -> Result<Self> {
        let address = reader.read_address()?;
        if reader.read_u8()? != IDENTITY_TYPE_C25519 {
            return Err(ProtocolError::InvalidIdentity);
        }
        let public = reader.read_array::<PUBLIC_KEY_LENGTH>()?;
        let private_len = reader.read_u8()? as usize;
        reader.skip(private_len)?;
        Ok(Self { address, public })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::read(&mut PayloadReader::new(bytes))
    }

    /// Append the public wire form to `out`.
    pub fn write_to<B: BufMut>(&self, out: &mut B) {
        out.put_slice(&self.address.to_bytes());
        out.put_u8(IDENTITY_TYPE_C25519);
        out.put_slice(&self.public);
        out.put_u8(0);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Address::LENGTH + 2 + PUBLIC_KEY_LENGTH);
        self.write_to(&mut out);
        out
    }

    /// Check that the address is derived from the public key and is not
    /// reserved. Needs no network trust.
    pub fn locally_validate(&self) -> bool {
        if self.address.is_reserved() {
            return false;
        }
        if VerifyingKey::from_bytes(&self.signing_public()).is_err() {
            return false;
        }
        address_from_public(&self.public) == self.address
    }

    /// Verify an Ed25519 signature by this identity.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.signing_public()) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        key.verify(message, &signature).is_ok()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.address)
    }
}

/// `address:0:hex(public)`
impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.address,
            IDENTITY_TYPE_C25519,
            hex::encode(self.public)
        )
    }
}

impl FromStr for Identity {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split(':');
        let (Some(addr), Some(kind), Some(public)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(ProtocolError::InvalidIdentity);
        };
        if kind != "0" {
            return Err(ProtocolError::InvalidIdentity);
        }
        let addr = u64::from_str_radix(addr, 16).map_err(|_| ProtocolError::InvalidIdentity)?;
        let public = hex::decode(public).map_err(|_| ProtocolError::InvalidIdentity)?;
        let public: [u8; PUBLIC_KEY_LENGTH] = public
            .try_into()
            .map_err(|_| ProtocolError::InvalidIdentity)?;
        Ok(Self {
            address: Address::new(addr),
            public,
        })
    }
}

/// This node's identity, including secret keys.
pub struct LocalIdentity {
    identity: Identity,
    dh_secret: StaticSecret,
    signing_key: SigningKey,
}

impl LocalIdentity {
    /// Generate a fresh identity with a non-reserved address.
    pub fn generate() -> Result<Self> {
        for _ in 0..MAX_GENERATE_ATTEMPTS {
            let mut dh = Zeroizing::new([0u8; 32]);
            let mut sign = Zeroizing::new([0u8; 32]);
            getrandom::fill(dh.as_mut_slice()).map_err(|_| ProtocolError::RandomFailure)?;
            getrandom::fill(sign.as_mut_slice()).map_err(|_| ProtocolError::RandomFailure)?;

            let candidate = Self::from_secret_bytes(*dh, *sign);
            if !candidate.identity.address.is_reserved() {
                return Ok(candidate);
            }
        }
        Err(ProtocolError::InvalidIdentity)
    }

    /// Rebuild an identity from stored secret keys.
    pub fn from_secret_bytes(dh_secret: [u8; 32], signing_secret: [u8; 32]) -> Self {
        let dh_secret = StaticSecret::from(dh_secret);
        let signing_key = SigningKey::from_bytes(&signing_secret);

        let mut public = [0u8; PUBLIC_KEY_LENGTH];
        public[..32].copy_from_slice(PublicKey::from(&dh_secret).as_bytes());
        public[32..].copy_from_slice(signing_key.verifying_key().as_bytes());

        Self {
            identity: Identity {
                address: address_from_public(&public),
                public,
            },
            dh_secret,
            signing_key,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn address(&self) -> Address {
        self.identity.address
    }

    /// Derive the symmetric key shared with `other`.
    pub fn agree(&self, other: &Identity) -> Result<Zeroizing<[u8; KEY_LENGTH]>> {
        let shared = self.dh_secret.diffie_hellman(&PublicKey::from(other.dh_public()));
        if !shared.was_contributory() {
            warn!(peer = %other.address, "{}", constants::ERR_KEY_AGREEMENT);
            return Err(ProtocolError::KeyAgreementFailed);
        }
        let digest = Sha512::digest(shared.as_bytes());
        let mut key = Zeroizing::new([0u8; KEY_LENGTH]);
        key.copy_from_slice(&digest[..KEY_LENGTH]);
        Ok(key)
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LENGTH] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("address", &self.identity.address)
            .finish_non_exhaustive()
    }
}

fn address_from_public(public: &[u8; PUBLIC_KEY_LENGTH]) -> Address {
    let digest = Sha512::digest(public);
    // first five bytes of the digest; the slice is always long enough
    Address::from_bytes(&digest[..Address::LENGTH]).unwrap_or_default()
}
