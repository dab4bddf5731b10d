//! Wire constants and runtime configuration for a protocol node.
//!
//! The constants in this module are part of the wire format and must match
//! every other node on the network. [`Config`] holds the tunables a host
//! process may change: compression policy, legacy multicast relay behavior
//! and logging.
//!
//! A node usually reads its [`Config`] from TOML ([`Config::from_file`]);
//! [`Config::from_env`] applies `VNET_*` overrides on top of the defaults.

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use tracing::Level;

/// Current protocol version announced in HELLO
pub const PROTOCOL_VERSION: u8 = 4;

/// Oldest protocol version we will talk to
pub const PROTOCOL_VERSION_MIN: u8 = 4;

/// Software version announced in HELLO and OK(HELLO)
pub const VERSION_MAJOR: u8 = 1;
pub const VERSION_MINOR: u8 = 0;
pub const VERSION_REVISION: u16 = 0;

/// Maximum hop count representable in the 3-bit hops field
pub const MAX_HOPS: u8 = 7;

/// Maximum number of fragments a packet may be split into
pub const MAX_FRAGMENTS: usize = 16;

/// Default physical MTU a single fragment must fit in
pub const UDP_DEFAULT_PAYLOAD_MTU: usize = 1444;

/// Largest reassembled packet the protocol allows
pub const MAX_PACKET_LENGTH: usize = MAX_FRAGMENTS * UDP_DEFAULT_PAYLOAD_MTU;

/// MTU of the virtual Ethernet interface; bounds multicast frame payloads
pub const IF_MTU: usize = 2800;

/// Default number of GUIDs remembered for legacy multicast deduplication
pub const LEGACY_DEDUP_CAPACITY: usize = 1024;

/// Default maximum fan-out of a legacy multicast relay
pub const LEGACY_RELAY_LIMIT: usize = 128;

/// Node configuration: codec policy, multicast relay and logging
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    /// Packet codec settings
    #[serde(default)]
    pub protocol: ProtocolConfig,

    /// Multicast relay settings
    #[serde(default)]
    pub multicast: MulticastConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Read a node configuration from a TOML file.
    ///
    /// # Errors
    /// `ProtocolError::ConfigError` if the file cannot be read or parsed
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ProtocolError::ConfigError(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml(&text)
    }

    /// Parse a node configuration; missing sections take their defaults.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| ProtocolError::ConfigError(format!("invalid TOML: {e}")))
    }

    /// Defaults with any `VNET_*` overrides present in the environment.
    /// Values that do not parse are ignored.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        env_override("VNET_COMPRESSION_ENABLED", &mut config.protocol.compression_enabled);
        env_override("VNET_LEGACY_DEDUP_CAPACITY", &mut config.multicast.legacy_dedup_capacity);
        env_override("VNET_LEGACY_RELAY_LIMIT", &mut config.multicast.legacy_relay_limit);
        env_override("VNET_LEGACY_RELAY_ENABLED", &mut config.multicast.legacy_relay_enabled);
        env_override("VNET_LOG_LEVEL", &mut config.logging.log_level);
        Ok(config)
    }

    /// Defaults with `mutator` applied, handy in tests and embedders
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// The default configuration rendered as TOML
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }

    /// Every problem found in the configuration, one message each. An empty
    /// list means the configuration is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = self.protocol.validate();
        problems.extend(self.multicast.validate());
        problems.extend(self.logging.validate());
        problems
    }

    /// Like [`Config::validate`], folding all problems into one error.
    pub fn validate_strict(&self) -> Result<()> {
        let problems = self.validate();
        if problems.is_empty() {
            return Ok(());
        }
        Err(ProtocolError::ConfigError(format!(
            "{} configuration problem(s): {}",
            problems.len(),
            problems.join("; ")
        )))
    }
}

fn env_override<T: FromStr>(var: &str, slot: &mut T) {
    if let Some(value) = std::env::var(var).ok().and_then(|v| v.parse().ok()) {
        *slot = value;
    }
}

/// Packet codec configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Whether outbound payloads are compressed when it helps
    pub compression_enabled: bool,

    /// Payloads at or below this many bytes are never compressed
    pub compression_min_payload: usize,

    /// Skip compression of large high-entropy payloads
    pub adaptive_compression: bool,

    /// Upper bound on a reassembled packet
    pub max_packet_length: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            compression_enabled: true,
            compression_min_payload: 32,
            adaptive_compression: false,
            max_packet_length: MAX_PACKET_LENGTH,
        }
    }
}

impl ProtocolConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.max_packet_length > MAX_PACKET_LENGTH {
            problems.push(format!(
                "max_packet_length {} exceeds protocol limit {}",
                self.max_packet_length, MAX_PACKET_LENGTH
            ));
        }

        if self.max_packet_length < crate::core::packet::MIN_PACKET_LENGTH {
            problems.push(format!(
                "max_packet_length {} is smaller than a packet header",
                self.max_packet_length
            ));
        }

        if self.compression_min_payload >= self.max_packet_length {
            problems.push(format!(
                "compression_min_payload {} must be below max_packet_length {}",
                self.compression_min_payload, self.max_packet_length
            ));
        }

        problems
    }
}

/// Multicast and legacy relay configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MulticastConfig {
    /// GUIDs remembered to suppress duplicate legacy multicast frames
    pub legacy_dedup_capacity: usize,

    /// Maximum recipients of one legacy relay fan-out
    pub legacy_relay_limit: usize,

    /// Largest Ethernet payload accepted in a multicast frame
    pub max_frame_length: usize,

    /// Whether legacy multicast frames are relayed at all
    pub legacy_relay_enabled: bool,
}

impl Default for MulticastConfig {
    fn default() -> Self {
        Self {
            legacy_dedup_capacity: LEGACY_DEDUP_CAPACITY,
            legacy_relay_limit: LEGACY_RELAY_LIMIT,
            max_frame_length: IF_MTU,
            legacy_relay_enabled: true,
        }
    }
}

impl MulticastConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.legacy_dedup_capacity == 0 {
            problems.push("legacy_dedup_capacity must be greater than 0".to_string());
        }
        if self.legacy_relay_limit == 0 {
            problems.push("legacy_relay_limit must be greater than 0".to_string());
        }
        if !(1..=IF_MTU).contains(&self.max_frame_length) {
            problems.push(format!(
                "max_frame_length {} must be between 1 and {IF_MTU}",
                self.max_frame_length
            ));
        }
        problems
    }
}

/// Where and how the node logs. Consumed by
/// [`init_logging`](crate::utils::logging::init_logging).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Name attached to every log line
    pub app_name: String,

    /// Default verbosity; `RUST_LOG` still takes precedence
    #[serde(with = "level_name")]
    pub log_level: Level,

    pub log_to_console: bool,

    /// Append to `log_file_path` instead of (or as well as) the console
    pub log_to_file: bool,
    pub log_file_path: Option<String>,

    /// Emit JSON lines
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("vnet-protocol"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

const MAX_APP_NAME: usize = 64;

impl LoggingConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        match self.app_name.len() {
            0 => problems.push("app_name must not be empty".to_string()),
            n if n > MAX_APP_NAME => {
                problems.push(format!("app_name is {n} bytes, limit is {MAX_APP_NAME}"))
            }
            _ => {}
        }

        match (self.log_to_file, self.log_file_path.as_deref()) {
            (true, None) => problems.push("log_to_file is set but log_file_path is missing".to_string()),
            (true, Some(path)) => {
                let dir = Path::new(path).parent().filter(|d| !d.as_os_str().is_empty());
                if let Some(dir) = dir.filter(|d| !d.exists()) {
                    problems.push(format!("log directory {} does not exist", dir.display()));
                }
            }
            _ => {}
        }

        if !self.log_to_console && !self.log_to_file {
            problems.push("no log output enabled, set log_to_console or log_to_file".to_string());
        }

        problems
    }
}

/// `tracing::Level` as its lowercase name in TOML.
mod level_name {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use tracing::Level;

    pub fn serialize<S: Serializer>(level: &Level, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&level.as_str().to_ascii_lowercase())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Level, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse()
            .map_err(|_| D::Error::custom(format!("unknown log level {name:?}")))
    }
}
