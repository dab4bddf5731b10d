//! Virtual networks: configuration, membership and bridging state.
//!
//! A network ID is 64 bits; its top 40 bits are the address of the
//! controller that issues the configuration and membership certificates.
//! Configuration arrives as a netconf [`Dictionary`] and is held as an
//! immutable [`NetworkConfig`] that is swapped wholesale on refresh.

use crate::core::address::{Address, Mac, MulticastGroup};
use crate::core::certificate::CertificateOfMembership;
use crate::core::dictionary::Dictionary;
use crate::core::identity::Identity;
use crate::error::{ProtocolError, Result};
use crate::node::Switch;
use crate::protocol::message::{Message, NetworkConfigRequest};
use crate::utils::bandwidth::{MulticastRate, MulticastRateAccounts};
use crate::utils::time::now_ms;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Netconf dictionary keys.
pub mod keys {
    pub const NETWORK_ID: &str = "nwid";
    pub const ISSUED_TO: &str = "id";
    pub const TIMESTAMP: &str = "t";
    pub const NAME: &str = "n";
    pub const PRIVATE: &str = "p";
    pub const ETHER_TYPES: &str = "et";
    pub const ACTIVE_BRIDGES: &str = "ab";
    pub const PASSIVE_BRIDGING: &str = "pb";
    pub const ENABLE_BROADCAST: &str = "eb";
    pub const MULTICAST_LIMIT: &str = "ml";
    pub const MULTICAST_RATES: &str = "mr";
    pub const CERTIFICATE: &str = "com";
}

/// Key in the multicast rate table that applies to groups not listed.
pub const DEFAULT_RATE_KEY: &str = "*";

/// Immutable snapshot of a network's configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    pub network_id: u64,
    pub issued_to: Address,
    pub timestamp: u64,
    pub name: String,
    pub private: bool,
    pub enable_broadcast: bool,
    pub passive_bridging: bool,
    pub multicast_limit: u32,
    ether_types: BTreeSet<u16>,
    active_bridges: BTreeSet<Address>,
    multicast_rates: BTreeMap<MulticastGroup, MulticastRate>,
    default_multicast_rate: MulticastRate,
    com: Option<CertificateOfMembership>,
}

fn csv_hex(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_hex(field: &str, s: &str) -> Result<u64> {
    u64::from_str_radix(s, 16).map_err(|_| ProtocolError::InvalidDictionary(format!("{field}: bad hex {s:?}")))
}

fn parse_group(s: &str) -> Result<MulticastGroup> {
    let (mac, adi) = s.split_once('/').unwrap_or((s, "0"));
    let mac = parse_hex(keys::MULTICAST_RATES, &mac.replace(':', ""))?;
    let adi = parse_hex(keys::MULTICAST_RATES, adi)?;
    Ok(MulticastGroup::new(Mac::new(mac), adi as u32))
}

fn parse_rate(s: &str) -> Result<MulticastRate> {
    let mut parts = csv_hex(s).map(|p| parse_hex(keys::MULTICAST_RATES, p).map(|v| v as u32));
    match (parts.next(), parts.next(), parts.next()) {
        (Some(preload), Some(max), Some(accrual)) => Ok(MulticastRate::new(preload?, max?, accrual?)),
        _ => Err(ProtocolError::InvalidDictionary(format!("mr: bad rate {s:?}"))),
    }
}

impl NetworkConfig {
    pub fn from_dictionary(d: &Dictionary) -> Result<Self> {
        let network_id = d
            .get_hex_u64(keys::NETWORK_ID)?
            .ok_or_else(|| ProtocolError::InvalidDictionary("missing nwid".to_string()))?;
        let issued_to = d
            .get_hex_u64(keys::ISSUED_TO)?
            .map(Address::new)
            .ok_or_else(|| ProtocolError::InvalidDictionary("missing id".to_string()))?;

        let ether_types = match d.get(keys::ETHER_TYPES) {
            Some(v) => csv_hex(v)
                .map(|t| parse_hex(keys::ETHER_TYPES, t).map(|t| t as u16))
                .collect::<Result<_>>()?,
            None => BTreeSet::new(),
        };
        let active_bridges = match d.get(keys::ACTIVE_BRIDGES) {
            Some(v) => csv_hex(v)
                .map(|a| parse_hex(keys::ACTIVE_BRIDGES, a).map(Address::new))
                .collect::<Result<_>>()?,
            None => BTreeSet::new(),
        };

        let mut multicast_rates = BTreeMap::new();
        let mut default_multicast_rate = MulticastRate::default();
        if let Some(v) = d.get(keys::MULTICAST_RATES) {
            let table: Dictionary = v.parse()?;
            for (k, r) in table.iter() {
                if k == DEFAULT_RATE_KEY {
                    default_multicast_rate = parse_rate(r)?;
                } else {
                    multicast_rates.insert(parse_group(k)?, parse_rate(r)?);
                }
            }
        }

        let com = match d.get(keys::CERTIFICATE) {
            Some(h) if !h.is_empty() => {
                let bytes = hex::decode(h)
                    .map_err(|_| ProtocolError::InvalidDictionary("com: bad hex".to_string()))?;
                Some(CertificateOfMembership::from_bytes(&bytes)?)
            }
            _ => None,
        };

        Ok(Self {
            network_id,
            issued_to,
            timestamp: d.get_hex_u64(keys::TIMESTAMP)?.unwrap_or(0),
            name: d.get(keys::NAME).unwrap_or_default().to_string(),
            private: d.get_bool(keys::PRIVATE)?.unwrap_or(true),
            enable_broadcast: d.get_bool(keys::ENABLE_BROADCAST)?.unwrap_or(true),
            passive_bridging: d.get_bool(keys::PASSIVE_BRIDGING)?.unwrap_or(false),
            multicast_limit: d.get_hex_u64(keys::MULTICAST_LIMIT)?.unwrap_or(0) as u32,
            ether_types,
            active_bridges,
            multicast_rates,
            default_multicast_rate,
            com,
        })
    }

    /// Ether-type 0 in the allow-list admits everything.
    pub fn permits_ether_type(&self, ether_type: u16) -> bool {
        if ether_type == 0 {
            return false;
        }
        self.ether_types.contains(&0) || self.ether_types.contains(&ether_type)
    }

    pub fn permits_bridging(&self, address: Address) -> bool {
        self.passive_bridging || self.active_bridges.contains(&address)
    }

    pub fn multicast_rate(&self, group: &MulticastGroup) -> MulticastRate {
        self.multicast_rates
            .get(group)
            .copied()
            .unwrap_or(self.default_multicast_rate)
    }

    pub fn is_public(&self) -> bool {
        !self.private
    }

    /// Our own certificate, if the network is private.
    pub fn com(&self) -> Option<&CertificateOfMembership> {
        self.com.as_ref()
    }
}

/// Where delivered Ethernet frames go.
pub trait Tap: Send + Sync {
    fn put(&self, from: Mac, to: Mac, ether_type: u16, data: &[u8]);
}

/// A joined virtual network, as seen by the packet dispatcher.
pub trait Network: Send + Sync {
    fn id(&self) -> u64;

    fn controller(&self) -> Address {
        Address::new(self.id() >> 24)
    }

    /// Our MAC on this network.
    fn mac(&self) -> Mac;

    fn config(&self) -> Option<Arc<NetworkConfig>>;

    /// Whether `peer` may exchange frames with us here.
    fn is_allowed(&self, peer: Address) -> bool;

    fn permits_bridging(&self, peer: Address) -> bool {
        self.config().is_some_and(|c| c.permits_bridging(peer))
    }

    fn permits_ether_type(&self, ether_type: u16) -> bool {
        self.config().is_some_and(|c| c.permits_ether_type(ether_type))
    }

    /// Accept a peer's certificate. Without `force_accept` the controller's
    /// signature must check out.
    fn add_membership_certificate(&self, com: &CertificateOfMembership, force_accept: bool);

    fn learn_bridge_route(&self, mac: Mac, bridge: Address);

    fn tap_put(&self, from: Mac, to: Mac, ether_type: u16, data: &[u8]);

    fn set_not_found(&self);

    fn set_access_denied(&self);

    fn set_configuration(&self, dictionary: &Dictionary) -> Result<()>;

    fn request_configuration(&self);

    /// Charge `bytes` of multicast to `group`'s rate account.
    fn update_and_check_multicast_balance(&self, group: &MulticastGroup, bytes: usize) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    Requesting,
    Ok,
    AccessDenied,
    NotFound,
}

struct NetworkState {
    status: NetworkStatus,
    config: Option<Arc<NetworkConfig>>,
    controller_identity: Option<Identity>,
    certificates: HashMap<Address, CertificateOfMembership>,
    bridge_routes: HashMap<Mac, Address>,
    rate_accounts: MulticastRateAccounts,
    last_config_update_ms: u64,
}

/// In-process [`Network`] that delivers frames to a [`Tap`].
pub struct LocalNetwork {
    id: u64,
    local: Address,
    mac: Mac,
    tap: Arc<dyn Tap>,
    switch: Option<Arc<dyn Switch>>,
    state: Mutex<NetworkState>,
}

impl LocalNetwork {
    pub fn new(id: u64, local: Address, tap: Arc<dyn Tap>) -> Self {
        Self {
            id,
            local,
            mac: Mac::from_address(local, id),
            tap,
            switch: None,
            state: Mutex::new(NetworkState {
                status: NetworkStatus::Requesting,
                config: None,
                controller_identity: None,
                certificates: HashMap::new(),
                bridge_routes: HashMap::new(),
                rate_accounts: MulticastRateAccounts::new(),
                last_config_update_ms: 0,
            }),
        }
    }

    /// Route configuration requests through `switch`.
    pub fn with_switch(mut self, switch: Arc<dyn Switch>) -> Self {
        self.switch = Some(switch);
        self
    }

    fn state(&self) -> Option<MutexGuard<'_, NetworkState>> {
        match self.state.lock() {
            Ok(s) => Some(s),
            Err(_) => {
                warn!(nwid = format_args!("{:016x}", self.id), "network state lock poisoned");
                None
            }
        }
    }

    /// Identity used to check certificate signatures.
    pub fn set_controller_identity(&self, identity: Identity) {
        if let Some(mut s) = self.state() {
            s.controller_identity = Some(identity);
        }
    }

    pub fn status(&self) -> Option<NetworkStatus> {
        self.state().map(|s| s.status)
    }

    pub fn find_bridge_to(&self, mac: Mac) -> Option<Address> {
        self.state().and_then(|s| s.bridge_routes.get(&mac).copied())
    }

    pub fn certificate_of(&self, peer: Address) -> Option<CertificateOfMembership> {
        self.state().and_then(|s| s.certificates.get(&peer).cloned())
    }

    pub fn last_config_update(&self) -> u64 {
        self.state().map(|s| s.last_config_update_ms).unwrap_or(0)
    }
}

impl Network for LocalNetwork {
    fn id(&self) -> u64 {
        self.id
    }

    fn mac(&self) -> Mac {
        self.mac
    }

    fn config(&self) -> Option<Arc<NetworkConfig>> {
        self.state().and_then(|s| s.config.clone())
    }

    fn is_allowed(&self, peer: Address) -> bool {
        let Some(s) = self.state() else {
            return false;
        };
        let Some(ref config) = s.config else {
            return false;
        };
        if config.is_public() {
            return true;
        }
        match (config.com(), s.certificates.get(&peer)) {
            (Some(mine), Some(theirs)) => mine.agrees_with(theirs),
            _ => false,
        }
    }

    fn add_membership_certificate(&self, com: &CertificateOfMembership, force_accept: bool) {
        if com.network_id() != Some(self.id) || !com.has_required_fields() {
            debug!(nwid = format_args!("{:016x}", self.id), "ignoring certificate for another network");
            return;
        }
        let Some(issued_to) = com.issued_to() else {
            return;
        };
        let Some(mut s) = self.state() else {
            return;
        };

        if !force_accept {
            let controller = self.controller();
            let trusted = com.signed_by() == controller
                && s.controller_identity.as_ref().is_some_and(|c| com.verify(c));
            if !trusted {
                debug!(%issued_to, signer = %com.signed_by(), "certificate signature not accepted");
                return;
            }
        }

        let newer = s
            .certificates
            .get(&issued_to)
            .map_or(true, |old| old.timestamp() <= com.timestamp());
        if newer {
            s.certificates.insert(issued_to, com.clone());
        }
    }

    fn learn_bridge_route(&self, mac: Mac, bridge: Address) {
        if let Some(mut s) = self.state() {
            s.bridge_routes.insert(mac, bridge);
        }
    }

    fn tap_put(&self, from: Mac, to: Mac, ether_type: u16, data: &[u8]) {
        self.tap.put(from, to, ether_type, data);
    }

    fn set_not_found(&self) {
        if let Some(mut s) = self.state() {
            s.status = NetworkStatus::NotFound;
        }
        info!(nwid = format_args!("{:016x}", self.id), "controller reports network not found");
    }

    fn set_access_denied(&self) {
        if let Some(mut s) = self.state() {
            s.status = NetworkStatus::AccessDenied;
        }
        info!(nwid = format_args!("{:016x}", self.id), "controller denied access");
    }

    fn set_configuration(&self, dictionary: &Dictionary) -> Result<()> {
        let config = NetworkConfig::from_dictionary(dictionary)?;
        if config.network_id != self.id || config.issued_to != self.local {
            return Err(ProtocolError::InvalidDictionary(
                "configuration issued for another network or node".to_string(),
            ));
        }
        let mut s = self
            .state()
            .ok_or(ProtocolError::LockPoisoned("network state"))?;
        info!(
            nwid = format_args!("{:016x}", self.id),
            name = %config.name,
            private = config.private,
            "network configuration updated"
        );
        s.config = Some(Arc::new(config));
        s.status = NetworkStatus::Ok;
        s.rate_accounts.clear();
        s.last_config_update_ms = now_ms();
        Ok(())
    }

    fn request_configuration(&self) {
        let controller = self.controller();
        if controller == self.local {
            return;
        }
        let Some(ref switch) = self.switch else {
            debug!(nwid = format_args!("{:016x}", self.id), "no switch to request configuration through");
            return;
        };
        let request = Message::NetworkConfigRequest(NetworkConfigRequest {
            network_id: self.id,
            metadata: &[],
        });
        if let Err(e) = switch.send(request.to_packet(controller, self.local), true) {
            warn!(nwid = format_args!("{:016x}", self.id), error = %e, "configuration request not sent");
        }
    }

    fn update_and_check_multicast_balance(&self, group: &MulticastGroup, bytes: usize) -> bool {
        let Some(mut s) = self.state() else {
            return false;
        };
        let Some(rate) = s.config.as_ref().map(|c| c.multicast_rate(group)) else {
            return false;
        };
        s.rate_accounts.update_and_check(group, bytes, rate)
    }
}
