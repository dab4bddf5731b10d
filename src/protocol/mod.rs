//! # Protocol Layer
//!
//! Verb payloads and the logic that acts on them.
//!
//! ## Components
//! - **Verb**: verb and error-code enumerations
//! - **Message**: one typed variant per verb, decoded from a payload with a
//!   checked cursor and encoded back into outbound packets
//! - **Dispatcher**: authenticates received packets and runs verb handlers
//! - **Legacy**: deduplication and relay of pre-1.0 (P5) multicast frames
//!
//! ## Trust
//! Only an unencrypted HELLO is ever read before its MAC is checked. Every
//! other verb is decoded after dearmor under the sending peer's key.

pub mod dispatcher;
pub mod legacy;
pub mod message;
pub mod verb;

#[cfg(test)]
mod tests;

pub use dispatcher::{DecodeOutcome, Dispatcher, DropReason};
pub use message::Message;
pub use verb::{ErrorCode, Verb};
