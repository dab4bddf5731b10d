//! # vnet-protocol
//!
//! Wire protocol engine for a peer-to-peer virtual Ethernet network.
//!
//! Nodes are identified by 40-bit addresses derived from their public keys.
//! Every packet between two nodes is authenticated (and usually encrypted)
//! under a key agreed from their identities. On top of that, verbs carry
//! identity exchange, Ethernet frames for virtual networks, membership
//! certificates, network configuration and multicast group management.
//!
//! ## Layout
//! - [`core`]: addresses, identities, certificates and the packet codec
//! - [`protocol`]: verb payloads, the dispatcher and the legacy multicast relay
//! - [`node`]: the collaborators the dispatcher acts on (peers, networks,
//!   topology, multicast directory) as traits with in-memory implementations
//! - [`transport`]: UDP datagram I/O
//! - [`config`], [`error`], [`utils`]: configuration, errors and support code
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use vnet_protocol::config::Config;
//! use vnet_protocol::core::identity::LocalIdentity;
//! use vnet_protocol::node::{MulticastDirectory, NetworkTable, PeerTable, RuntimeEnvironment};
//! # use vnet_protocol::node::Switch;
//! use vnet_protocol::protocol::Dispatcher;
//! use vnet_protocol::transport::UdpEndpoint;
//!
//! # async fn run(switch: Arc<dyn Switch>) -> vnet_protocol::error::Result<()> {
//! let identity = Arc::new(LocalIdentity::generate()?);
//! let endpoint = UdpEndpoint::bind("0.0.0.0:9993".parse().unwrap()).await?;
//! let env = RuntimeEnvironment {
//!     topology: Arc::new(PeerTable::new(identity.address(), [])),
//!     identity,
//!     switch,
//!     transport: Arc::new(endpoint.transport()),
//!     networks: Arc::new(NetworkTable::new()),
//!     multicaster: Arc::new(MulticastDirectory::new()),
//!     netconf: None,
//! };
//! let dispatcher = Arc::new(Dispatcher::new(env, &Config::default()));
//! let (_shutdown_tx, shutdown_rx) = tokio::sync::mpsc::channel(1);
//! endpoint.run(dispatcher, None, shutdown_rx).await
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod node;
pub mod protocol;
pub mod transport;
pub mod utils;

pub use config::Config;
pub use error::{ProtocolError, Result};
pub use protocol::{DecodeOutcome, Dispatcher, DropReason};
