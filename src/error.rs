//! # Error Types
//!
//! Error handling for the virtual network wire protocol.
//!
//! Every fallible step of packet processing (length checks, authentication,
//! decompression, field parsing, collaborator calls) reports through
//! [`ProtocolError`]. None of these ever cross the dispatch boundary: the
//! dispatcher turns them into a silent drop and keeps processing.
//!
//! ## Error Categories
//! - **Framing Errors**: truncated packets, oversized packets, bad headers
//! - **Cryptographic Errors**: MAC mismatch, unknown cipher suite, key agreement
//! - **Parse Errors**: malformed verb payloads, identities, certificates, dictionaries
//! - **Environment Errors**: I/O, configuration, transport, poisoned locks
//!
//! ## Example Usage
//! ```rust
//! use vnet_protocol::core::packet::Packet;
//! use vnet_protocol::error::{ProtocolError, Result};
//!
//! fn parse(bytes: &[u8]) -> Result<Packet> {
//!     Packet::from_bytes(bytes)
//! }
//!
//! match parse(&[0u8; 4]) {
//!     Err(ProtocolError::Truncated) => {}
//!     other => panic!("unexpected: {other:?}"),
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Collaborator state errors
    pub const ERR_PEER_LOCK: &str = "Failed to acquire lock on peer state";
    pub const ERR_TOPOLOGY_LOCK: &str = "Failed to acquire lock on peer table";
    pub const ERR_MULTICAST_LOCK: &str = "Failed to acquire lock on multicast directory";
    pub const ERR_HISTORY_LOCK: &str = "Failed to acquire lock on multicast history";

    /// Cryptographic errors
    pub const ERR_KEY_AGREEMENT: &str = "Key agreement failed";
}

// ProtocolError is the primary error type for all protocol operations
#[derive(Error, Debug, Serialize, Deserialize)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    #[serde(skip_serializing, skip_deserializing)]
    Io(#[from] io::Error),

    #[error("Packet truncated")]
    Truncated,

    #[error("Invalid packet header")]
    InvalidHeader,

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Packet failed authentication")]
    AuthenticationFailed,

    #[error("Unsupported cipher suite: {0}")]
    UnsupportedCipher(u8),

    #[error("Compression failed")]
    CompressionFailure,

    #[error("Decompression failed")]
    DecompressionFailure,

    #[error("Unknown verb: {0:#04x}")]
    UnknownVerb(u8),

    #[error("Malformed field: {0}")]
    MalformedField(&'static str),

    #[error("Invalid identity")]
    InvalidIdentity,

    #[error("Key agreement failed")]
    KeyAgreementFailed,

    #[error("Random number generation failed")]
    RandomFailure,

    #[error("Invalid certificate of membership")]
    InvalidCertificate,

    #[error("Invalid dictionary: {0}")]
    InvalidDictionary(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Synchronization primitive poisoned: {0}")]
    LockPoisoned(&'static str),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
