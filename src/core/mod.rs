//! # Core Protocol Components
//!
//! Wire-level value types and the packet codec.
//!
//! This module provides the foundation for the protocol: addressing, node
//! identities, membership certificates, the netconf dictionary and the
//! authenticated packet envelope.
//!
//! ## Components
//! - **Address / Mac / MulticastGroup**: 40-bit node addresses and Ethernet addressing
//! - **Cursor**: bounds-checked reader over verb payloads
//! - **Packet**: header accessors, armor/dearmor, compress/uncompress
//! - **Fragment**: continuation datagrams of packets larger than one MTU
//! - **Identity**: public and local node identities, key agreement
//! - **Certificate**: certificates of network membership
//! - **Dictionary**: netconf key/value text format
//!
//! ## Wire Format
//! ```text
//! [IV(8)] [Dest(5)] [Source(5)] [Flags(1)] [MAC(8)] [Verb(1)] [Payload(N)]
//! ```
//!
//! ## Security
//! - Maximum packet size: 16 fragments of 1444 bytes
//! - MAC verified in constant time before anything is decrypted
//! - Hop count is excluded from the MAC so relays may bump it

pub mod address;
pub mod certificate;
pub mod cursor;
pub mod dictionary;
pub mod fragment;
pub mod identity;
pub mod packet;
