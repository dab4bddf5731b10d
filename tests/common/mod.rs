//! Shared harness for dispatcher integration tests: recording collaborators
//! and helpers to build armored packets between test nodes.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use vnet_protocol::config::{Config, PROTOCOL_VERSION, VERSION_MAJOR, VERSION_MINOR, VERSION_REVISION};
use vnet_protocol::core::address::{Address, Mac};
use vnet_protocol::core::certificate::CertificateOfMembership;
use vnet_protocol::core::dictionary::Dictionary;
use vnet_protocol::core::identity::LocalIdentity;
use vnet_protocol::core::packet::Packet;
use vnet_protocol::error::Result;
use vnet_protocol::node::network::keys;
use vnet_protocol::node::{
    LocalNetwork, MulticastDirectory, NetconfService, Network, NetworkTable, Peer, PeerTable,
    RuntimeEnvironment, Switch, Tap, Topology, Transport,
};
use vnet_protocol::protocol::message::{Hello, Message};
use vnet_protocol::protocol::Dispatcher;
use vnet_protocol::utils::time::now_ms;

#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
}

impl RecordingTransport {
    pub fn take(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl Transport for RecordingTransport {
    fn send(&self, to: SocketAddr, data: &[u8]) -> Result<()> {
        self.sent.lock().unwrap().push((to, data.to_vec()));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSwitch {
    pub whois_requests: Mutex<Vec<Address>>,
    pub cancelled_whois: Mutex<Vec<Address>>,
    pub contacts: Mutex<Vec<(Address, SocketAddr)>>,
    pub flushed: Mutex<Vec<Address>>,
    pub sent: Mutex<Vec<(Packet, bool)>>,
}

impl Switch for RecordingSwitch {
    fn request_whois(&self, address: Address) {
        self.whois_requests.lock().unwrap().push(address);
    }

    fn cancel_whois(&self, address: Address) {
        self.cancelled_whois.lock().unwrap().push(address);
    }

    fn contact(&self, peer: &Arc<Peer>, endpoint: SocketAddr) {
        self.contacts.lock().unwrap().push((peer.address(), endpoint));
    }

    fn do_anything_waiting_for_peer(&self, peer: &Arc<Peer>) {
        self.flushed.lock().unwrap().push(peer.address());
    }

    fn send(&self, packet: Packet, encrypt: bool) -> Result<()> {
        self.sent.lock().unwrap().push((packet, encrypt));
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapFrame {
    pub from: Mac,
    pub to: Mac,
    pub ether_type: u16,
    pub data: Vec<u8>,
}

#[derive(Default)]
pub struct RecordingTap {
    frames: Mutex<Vec<TapFrame>>,
}

impl RecordingTap {
    pub fn frames(&self) -> Vec<TapFrame> {
        self.frames.lock().unwrap().clone()
    }
}

impl Tap for RecordingTap {
    fn put(&self, from: Mac, to: Mac, ether_type: u16, data: &[u8]) {
        self.frames.lock().unwrap().push(TapFrame {
            from,
            to,
            ether_type,
            data: data.to_vec(),
        });
    }
}

#[derive(Default)]
pub struct RecordingNetconf {
    pub requests: Mutex<Vec<Dictionary>>,
}

impl NetconfService for RecordingNetconf {
    fn send(&self, request: &Dictionary) -> Result<()> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(())
    }
}

/// One node under test with all of its collaborators exposed.
pub struct TestNode {
    pub identity: Arc<LocalIdentity>,
    pub topology: Arc<PeerTable>,
    pub switch: Arc<RecordingSwitch>,
    pub transport: Arc<RecordingTransport>,
    pub networks: Arc<NetworkTable>,
    pub multicaster: Arc<MulticastDirectory>,
    pub netconf: Option<Arc<RecordingNetconf>>,
    pub dispatcher: Dispatcher,
}

pub struct NodeBuilder {
    identity: LocalIdentity,
    supernodes: Vec<Address>,
    netconf: bool,
    config: Config,
}

impl NodeBuilder {
    pub fn new() -> Self {
        Self {
            identity: LocalIdentity::generate().unwrap(),
            supernodes: Vec::new(),
            netconf: false,
            config: Config::default(),
        }
    }

    pub fn identity(mut self, identity: LocalIdentity) -> Self {
        self.identity = identity;
        self
    }

    pub fn supernodes(mut self, supernodes: &[Address]) -> Self {
        self.supernodes = supernodes.to_vec();
        self
    }

    pub fn with_netconf(mut self) -> Self {
        self.netconf = true;
        self
    }

    pub fn config(mut self, f: impl FnOnce(&mut Config)) -> Self {
        f(&mut self.config);
        self
    }

    pub fn build(self) -> TestNode {
        let identity = Arc::new(self.identity);
        let topology = Arc::new(PeerTable::new(identity.address(), self.supernodes));
        let switch = Arc::new(RecordingSwitch::default());
        let transport = Arc::new(RecordingTransport::default());
        let networks = Arc::new(NetworkTable::new());
        let multicaster = Arc::new(MulticastDirectory::new());
        let netconf = self.netconf.then(|| Arc::new(RecordingNetconf::default()));

        let env = RuntimeEnvironment {
            identity: Arc::clone(&identity),
            topology: topology.clone(),
            switch: switch.clone(),
            transport: transport.clone(),
            networks: networks.clone(),
            multicaster: multicaster.clone(),
            netconf: netconf.clone().map(|n| n as Arc<dyn NetconfService>),
        };
        TestNode {
            dispatcher: Dispatcher::new(env, &self.config),
            identity,
            topology,
            switch,
            transport,
            networks,
            multicaster,
            netconf,
        }
    }
}

impl TestNode {
    pub fn new() -> Self {
        NodeBuilder::new().build()
    }

    pub fn address(&self) -> Address {
        self.identity.address()
    }

    /// Make `other` a known peer of this node.
    pub fn knows(&self, other: &LocalIdentity) -> Arc<Peer> {
        self.topology
            .add_peer(Arc::new(Peer::new(&self.identity, other.identity().clone()).unwrap()))
    }

    /// Join a network whose controller is `controller`. `private` networks
    /// get a certificate for this node signed by the controller.
    pub fn join(
        &self,
        controller: &LocalIdentity,
        network_no: u64,
        extra: &[(&str, &str)],
        private: bool,
    ) -> (Arc<LocalNetwork>, Arc<RecordingTap>) {
        let nwid = (controller.address().to_u64() << 24) | network_no;
        let tap = Arc::new(RecordingTap::default());
        let network = Arc::new(
            LocalNetwork::new(nwid, self.address(), tap.clone()).with_switch(self.switch.clone()),
        );
        network.set_controller_identity(controller.identity().clone());

        let mut d = Dictionary::new();
        d.set(keys::NETWORK_ID, format!("{nwid:016x}"));
        d.set(keys::ISSUED_TO, self.address().to_string());
        d.set(keys::PRIVATE, if private { "1" } else { "0" });
        if private {
            let com = signed_certificate(controller, nwid, self.address(), now_ms());
            d.set(keys::CERTIFICATE, hex::encode(com.to_bytes()));
        }
        for (k, v) in extra {
            d.set(*k, *v);
        }
        network.set_configuration(&d).unwrap();
        self.networks.join(network.clone());
        (network, tap)
    }

    /// Remote address packets from `sender` arrive from in these tests.
    pub fn remote_of(sender: &LocalIdentity) -> SocketAddr {
        let port = 10_000 + (sender.address().to_u64() % 50_000) as u16;
        SocketAddr::from(([192, 0, 2, 1], port))
    }

    /// Dearmor every packet this node sent through its transport using the
    /// key shared with `peer`.
    pub fn replies_to(&self, peer: &LocalIdentity) -> Vec<Packet> {
        let key = self.identity.agree(peer.identity()).unwrap();
        self.transport
            .take()
            .into_iter()
            .map(|(_, bytes)| {
                let mut p = Packet::from_bytes(&bytes).unwrap();
                p.dearmor(&key).unwrap();
                p.uncompress().unwrap();
                p
            })
            .collect()
    }
}

pub fn signed_certificate(
    controller: &LocalIdentity,
    nwid: u64,
    issued_to: Address,
    timestamp: u64,
) -> CertificateOfMembership {
    let mut com = CertificateOfMembership::new(timestamp, 3_600_000, nwid, issued_to);
    com.sign(controller);
    com
}

/// Armored packet from `sender` to `receiver` carrying `message`.
pub fn packet_from(sender: &LocalIdentity, receiver: &LocalIdentity, message: &Message<'_>) -> Packet {
    let mut p = message.to_packet(receiver.address(), sender.address());
    p.compress();
    let key = sender.agree(receiver.identity()).unwrap();
    p.armor(&key, true);
    p
}

/// HELLO as a new node sends it: MAC only, no encryption.
pub fn hello_from(sender: &LocalIdentity, receiver: &LocalIdentity, protocol_version: u8) -> Packet {
    let hello = Message::Hello(Hello {
        protocol_version,
        major: VERSION_MAJOR,
        minor: VERSION_MINOR,
        revision: VERSION_REVISION,
        timestamp: now_ms(),
        identity: sender.identity().clone(),
    });
    let mut p = hello.to_packet(receiver.address(), sender.address());
    let key = sender.agree(receiver.identity()).unwrap();
    p.armor(&key, false);
    p
}

pub fn current_hello(sender: &LocalIdentity, receiver: &LocalIdentity) -> Packet {
    hello_from(sender, receiver, PROTOCOL_VERSION)
}

/// Deliver `packet` to `node` as if it came from `sender`'s usual address.
pub fn deliver(
    node: &TestNode,
    sender: &LocalIdentity,
    packet: Packet,
) -> vnet_protocol::protocol::DecodeOutcome {
    node.dispatcher.try_decode(TestNode::remote_of(sender), packet)
}
