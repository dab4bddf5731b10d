//! # Packet Dispatch
//!
//! [`Dispatcher::try_decode`] takes one received packet from the transport,
//! authenticates it, decodes its verb payload into a [`Message`] and runs the
//! matching handler against the node's collaborators.
//!
//! HELLO with the "none" cipher suite is the one verb handled before
//! authentication, since it is how a new peer's key is learned. Everything
//! else needs a known peer: an unknown source triggers a WHOIS and the packet
//! is reported as [`DecodeOutcome::AwaitingIdentity`].
//!
//! Handlers return `Result`. Errors stop at `try_decode` and become a silent
//! [`DecodeOutcome::Dropped`]; nothing a remote node sends can unwind past it.

use crate::config::{
    Config, MulticastConfig, ProtocolConfig, PROTOCOL_VERSION, PROTOCOL_VERSION_MIN, VERSION_MAJOR,
    VERSION_MINOR, VERSION_REVISION,
};
use crate::core::address::{Address, Mac, MulticastGroup};
use crate::core::dictionary::Dictionary;
use crate::core::packet::{CipherSuite, Packet, KEY_LENGTH};
use crate::error::{ProtocolError, Result};
use crate::node::{Network, Peer, RemoteVersion, RuntimeEnvironment};
use crate::protocol::legacy::LegacyRelay;
use crate::protocol::message::{
    ErrorMessage, ExtFrame, Frame, Hello, Message, MulticastFrame, MulticastGather,
    NetworkConfigRequest, OkBody, OkHello, OkMessage, P5MulticastFrame, Rendezvous,
};
use crate::protocol::verb::{ErrorCode, Verb};
use crate::utils::metrics::Metrics;
use crate::utils::time::now_ms;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, instrument, trace, warn};

/// What became of one received packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// A handler ran to completion.
    Processed,
    /// The packet was discarded without effect beyond logging and, where the
    /// sender can act on it, an ERROR reply.
    Dropped(DropReason),
    /// The sender is unknown. A WHOIS went out; the packet is not retried.
    AwaitingIdentity(Address),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Malformed,
    /// Longer than the configured packet length limit.
    Oversized,
    Unauthenticated,
    UnsupportedCipher,
    Decompression,
    ProtocolVersion,
    IdentityCollision,
    /// Sender is not a directory node but the verb requires one.
    Untrusted,
    NotMember,
    /// Rejected by network policy: ether type, MAC rules, bridging.
    Filtered,
    Duplicate,
    UnknownNetwork,
    Internal,
}

impl DropReason {
    pub const COUNT: usize = 13;

    pub const ALL: [DropReason; DropReason::COUNT] = [
        DropReason::Malformed,
        DropReason::Oversized,
        DropReason::Unauthenticated,
        DropReason::UnsupportedCipher,
        DropReason::Decompression,
        DropReason::ProtocolVersion,
        DropReason::IdentityCollision,
        DropReason::Untrusted,
        DropReason::NotMember,
        DropReason::Filtered,
        DropReason::Duplicate,
        DropReason::UnknownNetwork,
        DropReason::Internal,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DropReason::Malformed => "malformed",
            DropReason::Oversized => "oversized",
            DropReason::Unauthenticated => "unauthenticated",
            DropReason::UnsupportedCipher => "unsupported_cipher",
            DropReason::Decompression => "decompression",
            DropReason::ProtocolVersion => "protocol_version",
            DropReason::IdentityCollision => "identity_collision",
            DropReason::Untrusted => "untrusted",
            DropReason::NotMember => "not_member",
            DropReason::Filtered => "filtered",
            DropReason::Duplicate => "duplicate",
            DropReason::UnknownNetwork => "unknown_network",
            DropReason::Internal => "internal",
        }
    }
}

impl From<&ProtocolError> for DropReason {
    fn from(e: &ProtocolError) -> Self {
        match e {
            ProtocolError::Truncated
            | ProtocolError::InvalidHeader
            | ProtocolError::UnknownVerb(_)
            | ProtocolError::MalformedField(_)
            | ProtocolError::InvalidIdentity
            | ProtocolError::KeyAgreementFailed
            | ProtocolError::InvalidCertificate
            | ProtocolError::InvalidDictionary(_) => DropReason::Malformed,
            ProtocolError::OversizedPacket(_) => DropReason::Oversized,
            ProtocolError::AuthenticationFailed => DropReason::Unauthenticated,
            ProtocolError::UnsupportedCipher(_) => DropReason::UnsupportedCipher,
            ProtocolError::DecompressionFailure => DropReason::Decompression,
            _ => DropReason::Internal,
        }
    }
}

/// Verb dispatcher for one node.
///
/// Holds no locks of its own; all shared state lives in the collaborators of
/// its [`RuntimeEnvironment`], so one dispatcher may be driven from many
/// workers at once.
pub struct Dispatcher {
    env: RuntimeEnvironment,
    protocol: ProtocolConfig,
    multicast: MulticastConfig,
    legacy: LegacyRelay,
    metrics: Metrics,
}

impl Dispatcher {
    pub fn new(env: RuntimeEnvironment, config: &Config) -> Self {
        Self {
            legacy: LegacyRelay::new(&config.multicast),
            protocol: config.protocol.clone(),
            multicast: config.multicast.clone(),
            metrics: Metrics::new(),
            env,
        }
    }

    pub fn environment(&self) -> &RuntimeEnvironment {
        &self.env
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Parse raw datagram bytes as a packet and dispatch it.
    pub fn receive(&self, remote: SocketAddr, data: &[u8]) -> DecodeOutcome {
        match Packet::from_bytes(data) {
            Ok(packet) => self.try_decode(remote, packet),
            Err(e) => {
                self.metrics.packet_received(data.len() as u64);
                debug!(%remote, error = %e, "dropped malformed datagram");
                let outcome = DecodeOutcome::Dropped(DropReason::from(&e));
                self.record(outcome);
                outcome
            }
        }
    }

    /// Authenticate, decode and handle one packet received from `remote`.
    #[instrument(level = "trace", skip(self, packet), fields(len = packet.len(), source = %packet.source()))]
    pub fn try_decode(&self, remote: SocketAddr, packet: Packet) -> DecodeOutcome {
        self.metrics.packet_received(packet.len() as u64);
        let outcome = match self.decode(remote, packet) {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!(%remote, error = %e, "dropped packet");
                DecodeOutcome::Dropped(DropReason::from(&e))
            }
        };
        self.record(outcome);
        outcome
    }

    fn record(&self, outcome: DecodeOutcome) {
        match outcome {
            DecodeOutcome::Processed => self.metrics.packet_processed(),
            DecodeOutcome::Dropped(reason) => {
                if reason == DropReason::Unauthenticated {
                    self.metrics.authentication_failure();
                }
                self.metrics.packet_dropped(reason);
            }
            DecodeOutcome::AwaitingIdentity(_) => self.metrics.identity_pending(),
        }
    }

    fn decode(&self, remote: SocketAddr, mut packet: Packet) -> Result<DecodeOutcome> {
        if packet.len() > self.protocol.max_packet_length {
            debug!(%remote, len = packet.len(), limit = self.protocol.max_packet_length, "dropped oversized packet");
            return Ok(DecodeOutcome::Dropped(DropReason::Oversized));
        }
        let source = packet.source();
        if source == self.env.address() {
            debug!(%remote, "dropped packet claiming to be from us");
            return Ok(DecodeOutcome::Dropped(DropReason::Malformed));
        }

        if packet.cipher() == CipherSuite::Poly1305None as u8 && packet.verb_raw() == Verb::Hello as u8 {
            return self.do_hello(remote, packet);
        }

        let Some(peer) = self.env.topology.get_peer(source) else {
            trace!(%source, "unknown sender, requesting identity");
            self.env.switch.request_whois(source);
            return Ok(DecodeOutcome::AwaitingIdentity(source));
        };

        packet.dearmor(peer.key())?;
        packet.uncompress_within(self.protocol.max_packet_length)?;

        let verb = packet.verb_raw();
        peer.received(remote, packet.hops(), verb, now_ms())?;

        let message = Message::decode(verb, packet.payload())?;
        trace!(%source, verb, "authenticated packet");
        self.dispatch(remote, &peer, &packet, message)
    }

    fn dispatch(
        &self,
        remote: SocketAddr,
        peer: &Arc<Peer>,
        packet: &Packet,
        message: Message<'_>,
    ) -> Result<DecodeOutcome> {
        match message {
            Message::Nop => Ok(DecodeOutcome::Processed),
            Message::Hello(hello) => {
                if *peer.identity() != hello.identity {
                    debug!(peer = %peer.address(), "authenticated HELLO carries a different identity");
                    return Ok(DecodeOutcome::Dropped(DropReason::IdentityCollision));
                }
                self.accept_hello(remote, peer, packet, &hello)
            }
            Message::Error(error) => self.handle_error(remote, peer, error),
            Message::Ok(ok) => self.handle_ok(peer, ok),
            Message::Whois(address) => self.handle_whois(remote, peer, packet, address),
            Message::Rendezvous(rendezvous) => self.handle_rendezvous(peer, rendezvous),
            Message::Frame(frame) => self.handle_frame(remote, peer, packet, frame),
            Message::ExtFrame(frame) => self.handle_ext_frame(remote, peer, packet, frame),
            Message::P5MulticastFrame(frame) => self.handle_p5_multicast_frame(peer, packet, frame),
            Message::MulticastLike(likes) => {
                let now = now_ms();
                for (network_id, group) in likes {
                    self.env
                        .multicaster
                        .add(now, network_id, group, Address::default(), peer.address());
                }
                Ok(DecodeOutcome::Processed)
            }
            Message::NetworkMembershipCertificate(certificates) => {
                for com in certificates.iter().filter(|c| c.has_required_fields()) {
                    let network = com.network_id().and_then(|id| self.env.networks.network(id));
                    if let Some(network) = network {
                        network.add_membership_certificate(com, false);
                    }
                }
                Ok(DecodeOutcome::Processed)
            }
            Message::NetworkConfigRequest(request) => {
                self.handle_netconf_request(remote, peer, packet, request)
            }
            Message::NetworkConfigRefresh(network_ids) => {
                for id in network_ids {
                    if let Some(network) = self.env.networks.network(id) {
                        if network.controller() == peer.address() {
                            network.request_configuration();
                        }
                    }
                }
                Ok(DecodeOutcome::Processed)
            }
            Message::MulticastGather(gather) => self.handle_multicast_gather(remote, peer, packet, gather),
            Message::MulticastFrame(frame) => self.handle_multicast_frame(remote, peer, packet, frame),
            Message::Unknown(verb) => {
                trace!(peer = %peer.address(), verb, "ignored unknown verb");
                Ok(DecodeOutcome::Processed)
            }
        }
    }

    /// HELLO sent with the "none" cipher: parse first, then pick the key to
    /// authenticate with from the identity it carries.
    fn do_hello(&self, remote: SocketAddr, mut packet: Packet) -> Result<DecodeOutcome> {
        let source = packet.source();

        // dearmor under the none cipher leaves the bytes untouched, so the
        // payload can be read before the MAC is checked
        let mut plain = packet.clone();
        plain.uncompress_within(self.protocol.max_packet_length)?;
        let Message::Hello(hello) = Message::decode(Verb::Hello as u8, plain.payload())? else {
            return Ok(DecodeOutcome::Dropped(DropReason::Malformed));
        };

        if hello.protocol_version < PROTOCOL_VERSION_MIN {
            debug!(%source, version = hello.protocol_version, "dropped HELLO below protocol floor");
            return Ok(DecodeOutcome::Dropped(DropReason::ProtocolVersion));
        }
        if hello.identity.address() != source {
            debug!(%source, claimed = %hello.identity.address(), "dropped HELLO with mismatched identity");
            return Ok(DecodeOutcome::Dropped(DropReason::Malformed));
        }
        if !hello.identity.locally_validate() {
            debug!(%source, "dropped HELLO with invalid identity");
            return Ok(DecodeOutcome::Dropped(DropReason::Malformed));
        }

        let peer = match self.env.topology.get_peer(source) {
            Some(existing) if *existing.identity() != hello.identity => {
                return self.identity_collision(remote, &mut packet, &hello);
            }
            Some(existing) => {
                packet.dearmor(existing.key())?;
                existing
            }
            None => {
                let fresh = Arc::new(Peer::new(&self.env.identity, hello.identity.clone())?);
                packet.dearmor(fresh.key())?;
                let canonical = self.env.topology.add_peer(fresh);
                if *canonical.identity() != hello.identity {
                    info!(address = %source, "lost race to a different identity for this address");
                    return Ok(DecodeOutcome::Dropped(DropReason::IdentityCollision));
                }
                canonical
            }
        };

        peer.received(remote, packet.hops(), Verb::Hello as u8, now_ms())?;
        self.accept_hello(remote, &peer, &packet, &hello)
    }

    fn accept_hello(
        &self,
        remote: SocketAddr,
        peer: &Arc<Peer>,
        packet: &Packet,
        hello: &Hello,
    ) -> Result<DecodeOutcome> {
        if hello.protocol_version < PROTOCOL_VERSION_MIN {
            return Ok(DecodeOutcome::Dropped(DropReason::ProtocolVersion));
        }
        peer.set_remote_version(RemoteVersion {
            protocol: hello.protocol_version,
            major: hello.major,
            minor: hello.minor,
            revision: hello.revision,
        })?;

        let reply = Message::Ok(OkMessage {
            in_re_verb: Verb::Hello as u8,
            in_re_packet_id: packet.packet_id(),
            body: OkBody::Hello(OkHello {
                timestamp: hello.timestamp,
                protocol_version: PROTOCOL_VERSION,
                major: VERSION_MAJOR,
                minor: VERSION_MINOR,
                revision: VERSION_REVISION,
            }),
        });
        self.reply(remote, peer, &reply)?;
        trace!(peer = %peer.address(), "HELLO accepted");
        Ok(DecodeOutcome::Processed)
    }

    /// The address is known under another identity. Only a HELLO that
    /// authenticates under the new identity's key earns an ERROR, and the
    /// stored record is left alone either way.
    fn identity_collision(
        &self,
        remote: SocketAddr,
        packet: &mut Packet,
        hello: &Hello,
    ) -> Result<DecodeOutcome> {
        let source = packet.source();
        let key = self.env.identity.agree(&hello.identity)?;
        if packet.dearmor(&key).is_err() {
            debug!(%source, "dropped unauthenticated HELLO for an address we know");
            return Ok(DecodeOutcome::Dropped(DropReason::Unauthenticated));
        }

        info!(address = %source, %remote, "identity collision");
        let reply = Message::Error(ErrorMessage {
            in_re_verb: Verb::Hello as u8,
            in_re_packet_id: packet.packet_id(),
            code: ErrorCode::IdentityCollision as u8,
            payload: &[],
        });
        self.send_reply(remote, source, &key, &reply)?;
        Ok(DecodeOutcome::Dropped(DropReason::IdentityCollision))
    }

    fn handle_error(
        &self,
        remote: SocketAddr,
        peer: &Arc<Peer>,
        error: ErrorMessage<'_>,
    ) -> Result<DecodeOutcome> {
        let source = peer.address();
        match (error.error_code(), error.in_re()) {
            (Some(ErrorCode::ObjNotFound), Some(Verb::Whois)) => {
                if self.env.topology.is_supernode(source) {
                    self.env.switch.cancel_whois(error.address()?);
                }
            }
            (Some(ErrorCode::ObjNotFound), Some(Verb::NetworkConfigRequest)) => {
                if let Some(network) = self.controlled_by(error.network_id()?, source) {
                    network.set_not_found();
                }
            }
            (Some(ErrorCode::NeedMembershipCertificate), _) => {
                let com = self
                    .env
                    .networks
                    .network(error.network_id()?)
                    .and_then(|n| n.config())
                    .and_then(|c| c.com().cloned());
                if let Some(com) = com {
                    self.reply(remote, peer, &Message::NetworkMembershipCertificate(vec![com]))?;
                }
            }
            (Some(ErrorCode::NetworkAccessDenied), _) => {
                if let Some(network) = self.controlled_by(error.network_id()?, source) {
                    network.set_access_denied();
                }
            }
            (code, in_re) => {
                trace!(peer = %source, ?code, ?in_re, "ERROR ignored");
            }
        }
        Ok(DecodeOutcome::Processed)
    }

    fn handle_ok(&self, peer: &Arc<Peer>, ok: OkMessage<'_>) -> Result<DecodeOutcome> {
        let source = peer.address();
        let now = now_ms();
        match ok.body {
            OkBody::Hello(hello) => {
                if hello.protocol_version < PROTOCOL_VERSION_MIN {
                    return Ok(DecodeOutcome::Dropped(DropReason::ProtocolVersion));
                }
                let latency = now.saturating_sub(hello.timestamp).min(0xffff) as u32;
                peer.add_direct_latency_measurement(latency)?;
                peer.set_remote_version(RemoteVersion {
                    protocol: hello.protocol_version,
                    major: hello.major,
                    minor: hello.minor,
                    revision: hello.revision,
                })?;
                trace!(peer = %source, latency, "OK(HELLO)");
            }
            OkBody::Whois(identity) => {
                if !self.env.topology.is_supernode(source) {
                    debug!(peer = %source, "dropped OK(WHOIS) from a non-directory node");
                    return Ok(DecodeOutcome::Dropped(DropReason::Untrusted));
                }
                if !identity.locally_validate() {
                    debug!(peer = %source, "dropped OK(WHOIS) with invalid identity");
                    return Ok(DecodeOutcome::Dropped(DropReason::Malformed));
                }
                let learned = Arc::new(Peer::new(&self.env.identity, identity)?);
                let canonical = self.env.topology.add_peer(learned);
                self.env.switch.do_anything_waiting_for_peer(&canonical);
            }
            OkBody::NetworkConfigRequest {
                network_id,
                dictionary,
            } => {
                if let Some(network) = self.controlled_by(network_id, source) {
                    if !dictionary.is_empty() {
                        network.set_configuration(&Dictionary::from_bytes(dictionary)?)?;
                    }
                }
            }
            OkBody::MulticastGather {
                network_id,
                group,
                results,
            } => {
                self.env.multicaster.add_multiple(
                    now,
                    network_id,
                    group,
                    source,
                    &results.members,
                    results.total_known,
                );
            }
            OkBody::MulticastFrame {
                network_id,
                group,
                com,
                results,
            } => {
                if let Some(com) = com {
                    if let Some(network) = self.env.networks.network(network_id) {
                        network.add_membership_certificate(&com, false);
                    }
                }
                if let Some(results) = results {
                    self.env.multicaster.add_multiple(
                        now,
                        network_id,
                        group,
                        source,
                        &results.members,
                        results.total_known,
                    );
                }
            }
            OkBody::Other(_) => {}
        }
        Ok(DecodeOutcome::Processed)
    }

    fn handle_whois(
        &self,
        remote: SocketAddr,
        peer: &Arc<Peer>,
        packet: &Packet,
        address: Address,
    ) -> Result<DecodeOutcome> {
        let identity = if address == self.env.address() {
            Some(self.env.identity.identity().clone())
        } else {
            self.env.topology.get_peer(address).map(|p| p.identity().clone())
        };

        let address_bytes = address.to_bytes();
        let reply = match identity {
            Some(identity) => Message::Ok(OkMessage {
                in_re_verb: Verb::Whois as u8,
                in_re_packet_id: packet.packet_id(),
                body: OkBody::Whois(identity),
            }),
            None => Message::Error(ErrorMessage {
                in_re_verb: Verb::Whois as u8,
                in_re_packet_id: packet.packet_id(),
                code: ErrorCode::ObjNotFound as u8,
                payload: &address_bytes,
            }),
        };
        self.reply(remote, peer, &reply)?;
        Ok(DecodeOutcome::Processed)
    }

    fn handle_rendezvous(&self, peer: &Arc<Peer>, rendezvous: Rendezvous) -> Result<DecodeOutcome> {
        if !self.env.topology.is_supernode(peer.address()) {
            debug!(peer = %peer.address(), "dropped RENDEZVOUS from a non-directory node");
            return Ok(DecodeOutcome::Dropped(DropReason::Untrusted));
        }
        let Some(with) = self.env.topology.get_peer(rendezvous.with) else {
            debug!(with = %rendezvous.with, "RENDEZVOUS for a peer we do not know");
            return Ok(DecodeOutcome::Processed);
        };
        if rendezvous.endpoint.port() == 0 {
            return Ok(DecodeOutcome::Dropped(DropReason::Malformed));
        }
        trace!(with = %rendezvous.with, endpoint = %rendezvous.endpoint, "RENDEZVOUS");
        self.env.switch.contact(&with, rendezvous.endpoint);
        Ok(DecodeOutcome::Processed)
    }

    fn handle_frame(
        &self,
        remote: SocketAddr,
        peer: &Arc<Peer>,
        packet: &Packet,
        frame: Frame<'_>,
    ) -> Result<DecodeOutcome> {
        let source = peer.address();
        let Some(network) = self.env.networks.network(frame.network_id) else {
            return Ok(DecodeOutcome::Dropped(DropReason::UnknownNetwork));
        };
        if frame.data.is_empty() {
            return Ok(DecodeOutcome::Processed);
        }
        if !network.is_allowed(source) {
            self.need_certificate(remote, peer, packet, frame.network_id)?;
            return Ok(DecodeOutcome::Dropped(DropReason::NotMember));
        }
        if !network.permits_ether_type(frame.ether_type) {
            debug!(peer = %source, ether_type = frame.ether_type, "FRAME ether type not permitted");
            return Ok(DecodeOutcome::Dropped(DropReason::Filtered));
        }

        network.tap_put(
            Mac::from_address(source, frame.network_id),
            network.mac(),
            frame.ether_type,
            frame.data,
        );
        self.metrics.frame_delivered();
        Ok(DecodeOutcome::Processed)
    }

    fn handle_ext_frame(
        &self,
        remote: SocketAddr,
        peer: &Arc<Peer>,
        packet: &Packet,
        frame: ExtFrame<'_>,
    ) -> Result<DecodeOutcome> {
        let source = peer.address();
        let Some(network) = self.env.networks.network(frame.network_id) else {
            return Ok(DecodeOutcome::Dropped(DropReason::UnknownNetwork));
        };
        if let Some(ref com) = frame.com {
            network.add_membership_certificate(com, false);
        }
        if !network.is_allowed(source) {
            self.need_certificate(remote, peer, packet, frame.network_id)?;
            return Ok(DecodeOutcome::Dropped(DropReason::NotMember));
        }
        if !network.permits_ether_type(frame.ether_type) {
            debug!(peer = %source, ether_type = frame.ether_type, "EXT_FRAME ether type not permitted");
            return Ok(DecodeOutcome::Dropped(DropReason::Filtered));
        }
        if frame.to.is_multicast() {
            debug!(peer = %source, to = %frame.to, "EXT_FRAME to a multicast MAC");
            return Ok(DecodeOutcome::Dropped(DropReason::Filtered));
        }
        if let Err(reason) = self.check_bridged_source(network.as_ref(), source, frame.from) {
            return Ok(DecodeOutcome::Dropped(reason));
        }
        if frame.to != network.mac() && !network.permits_bridging(self.env.address()) {
            debug!(to = %frame.to, "EXT_FRAME for another MAC but we are not a bridge");
            return Ok(DecodeOutcome::Dropped(DropReason::Filtered));
        }

        if !frame.data.is_empty() {
            network.tap_put(frame.from, frame.to, frame.ether_type, frame.data);
            self.metrics.frame_delivered();
        }
        Ok(DecodeOutcome::Processed)
    }

    fn handle_netconf_request(
        &self,
        remote: SocketAddr,
        peer: &Arc<Peer>,
        packet: &Packet,
        request: NetworkConfigRequest<'_>,
    ) -> Result<DecodeOutcome> {
        let Some(ref netconf) = self.env.netconf else {
            let network_id = request.network_id.to_be_bytes();
            let reply = Message::Error(ErrorMessage {
                in_re_verb: Verb::NetworkConfigRequest as u8,
                in_re_packet_id: packet.packet_id(),
                code: ErrorCode::UnsupportedOperation as u8,
                payload: &network_id,
            });
            self.reply(remote, peer, &reply)?;
            return Ok(DecodeOutcome::Processed);
        };

        let mut dict = Dictionary::new();
        if !request.metadata.is_empty() {
            dict.set("meta", String::from_utf8_lossy(request.metadata));
        }
        dict.set("type", "netconf-request");
        dict.set("peerId", peer.identity().to_string());
        dict.set("nwid", format!("{:016x}", request.network_id));
        dict.set("requestId", format!("{:016x}", packet.packet_id()));
        if packet.hops() == 0 {
            dict.set("from", remote.to_string());
        }
        netconf.send(&dict)?;
        Ok(DecodeOutcome::Processed)
    }

    fn handle_multicast_gather(
        &self,
        remote: SocketAddr,
        peer: &Arc<Peer>,
        packet: &Packet,
        gather: MulticastGather,
    ) -> Result<DecodeOutcome> {
        if let Some(ref com) = gather.com {
            if let Some(network) = self.env.networks.network(gather.network_id) {
                network.add_membership_certificate(com, false);
            }
        }
        if gather.gather_limit > 0 {
            self.reply_with_gather(
                remote,
                peer,
                packet,
                Verb::MulticastGather,
                gather.network_id,
                gather.group,
                gather.gather_limit,
            )?;
        }
        Ok(DecodeOutcome::Processed)
    }

    fn handle_multicast_frame(
        &self,
        remote: SocketAddr,
        peer: &Arc<Peer>,
        packet: &Packet,
        frame: MulticastFrame<'_>,
    ) -> Result<DecodeOutcome> {
        let source = peer.address();
        let Some(network) = self.env.networks.network(frame.network_id) else {
            return Ok(DecodeOutcome::Dropped(DropReason::UnknownNetwork));
        };
        if let Some(ref com) = frame.com {
            network.add_membership_certificate(com, false);
        }
        if !network.is_allowed(source) {
            self.need_certificate(remote, peer, packet, frame.network_id)?;
            return Ok(DecodeOutcome::Dropped(DropReason::NotMember));
        }

        if !frame.data.is_empty() && frame.data.len() <= self.multicast.max_frame_length {
            let to = frame.group.mac();
            if !to.is_multicast() {
                debug!(peer = %source, %to, "MULTICAST_FRAME to a unicast MAC");
                return Ok(DecodeOutcome::Dropped(DropReason::Filtered));
            }
            if !network.permits_ether_type(frame.ether_type) {
                debug!(peer = %source, ether_type = frame.ether_type, "MULTICAST_FRAME ether type not permitted");
                return Ok(DecodeOutcome::Dropped(DropReason::Filtered));
            }
            let from = match frame.source {
                Some(from) => {
                    if let Err(reason) = self.check_bridged_source(network.as_ref(), source, from) {
                        return Ok(DecodeOutcome::Dropped(reason));
                    }
                    from
                }
                None => Mac::from_address(source, frame.network_id),
            };
            network.tap_put(from, to, frame.ether_type, frame.data);
            self.metrics.frame_delivered();
        }

        if let Some(limit) = frame.gather_limit.filter(|l| *l > 0) {
            self.reply_with_gather(
                remote,
                peer,
                packet,
                Verb::MulticastFrame,
                frame.network_id,
                frame.group,
                limit,
            )?;
        }
        Ok(DecodeOutcome::Processed)
    }

    fn handle_p5_multicast_frame(
        &self,
        peer: &Arc<Peer>,
        packet: &Packet,
        frame: P5MulticastFrame<'_>,
    ) -> Result<DecodeOutcome> {
        let origin = frame.origin();
        if origin == self.env.address() {
            trace!(guid = format_args!("{:016x}", frame.guid), "legacy multicast looped back to origin");
            return Ok(DecodeOutcome::Dropped(DropReason::Duplicate));
        }
        if self.legacy.is_duplicate(frame.guid)? {
            self.metrics.legacy_duplicate();
            return Ok(DecodeOutcome::Dropped(DropReason::Duplicate));
        }

        if let Some(network) = self.env.networks.network(frame.network_id) {
            if let Some(ref com) = frame.com {
                network.add_membership_certificate(com, false);
            }
            if !network.is_allowed(origin) {
                self.need_certificate_via_switch(origin, packet, frame.network_id)?;
            } else if let Err(reason) = self.deliver_legacy(network.as_ref(), &frame) {
                debug!(%origin, ?reason, "legacy multicast not delivered locally");
            }
        }

        if self.legacy.enabled() {
            let copies = self.legacy.relay(&self.env, peer, packet, &frame)?;
            if copies > 0 {
                self.metrics.legacy_relay(copies as u64);
            }
        }
        Ok(DecodeOutcome::Processed)
    }

    fn deliver_legacy(
        &self,
        network: &dyn Network,
        frame: &P5MulticastFrame<'_>,
    ) -> std::result::Result<(), DropReason> {
        let origin = frame.origin();
        if frame.frame.is_empty() || frame.frame.len() > self.multicast.max_frame_length {
            return Err(DropReason::Malformed);
        }
        if !frame.group.mac().is_multicast() || !network.permits_ether_type(frame.ether_type) {
            return Err(DropReason::Filtered);
        }
        self.check_bridged_source(network, origin, frame.source)?;
        if !network.update_and_check_multicast_balance(&frame.group, frame.frame.len()) {
            return Err(DropReason::Filtered);
        }
        network.tap_put(frame.source, frame.group.mac(), frame.ether_type, frame.frame);
        self.metrics.frame_delivered();
        Ok(())
    }

    /// Source MAC rules shared by the multicast paths: a real unicast MAC
    /// that is not ours, and if it is not `sender`'s own MAC the sender must
    /// be allowed to bridge. Learns the bridge route on success.
    fn check_bridged_source(
        &self,
        network: &dyn Network,
        sender: Address,
        from: Mac,
    ) -> std::result::Result<(), DropReason> {
        if from.is_empty() || from.is_multicast() || from == network.mac() {
            debug!(%sender, %from, "invalid source MAC");
            return Err(DropReason::Filtered);
        }
        if from != Mac::from_address(sender, network.id()) {
            if !network.permits_bridging(sender) {
                debug!(%sender, %from, "bridging not permitted for sender");
                return Err(DropReason::Filtered);
            }
            network.learn_bridge_route(from, sender);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn reply_with_gather(
        &self,
        remote: SocketAddr,
        peer: &Arc<Peer>,
        packet: &Packet,
        in_re: Verb,
        network_id: u64,
        group: MulticastGroup,
        limit: u32,
    ) -> Result<()> {
        let results = self
            .env
            .multicaster
            .gather(peer.address(), network_id, group, limit);
        if results.is_empty() {
            return Ok(());
        }
        let body = match in_re {
            Verb::MulticastFrame => OkBody::MulticastFrame {
                network_id,
                group,
                com: None,
                results: Some(results),
            },
            _ => OkBody::MulticastGather {
                network_id,
                group,
                results,
            },
        };
        let reply = Message::Ok(OkMessage {
            in_re_verb: in_re as u8,
            in_re_packet_id: packet.packet_id(),
            body,
        });
        self.reply(remote, peer, &reply)
    }

    fn controlled_by(&self, network_id: u64, controller: Address) -> Option<Arc<dyn Network>> {
        self.env
            .networks
            .network(network_id)
            .filter(|n| n.controller() == controller)
    }

    fn need_certificate(
        &self,
        remote: SocketAddr,
        peer: &Arc<Peer>,
        packet: &Packet,
        network_id: u64,
    ) -> Result<()> {
        debug!(peer = %peer.address(), nwid = format_args!("{network_id:016x}"), "sender is not a member, asking for certificate");
        let network_id = network_id.to_be_bytes();
        let reply = Message::Error(ErrorMessage {
            in_re_verb: packet.verb_raw(),
            in_re_packet_id: packet.packet_id(),
            code: ErrorCode::NeedMembershipCertificate as u8,
            payload: &network_id,
        });
        self.reply(remote, peer, &reply)
    }

    /// Legacy frames are relayed, so the origin may not be the peer that
    /// handed us the packet. Route the request through the switch instead.
    fn need_certificate_via_switch(&self, origin: Address, packet: &Packet, network_id: u64) -> Result<()> {
        if self.env.topology.get_peer(origin).is_none() {
            trace!(%origin, "non-member legacy origin unknown, not asking for certificate");
            return Ok(());
        }
        let network_id = network_id.to_be_bytes();
        let request = Message::Error(ErrorMessage {
            in_re_verb: packet.verb_raw(),
            in_re_packet_id: packet.packet_id(),
            code: ErrorCode::NeedMembershipCertificate as u8,
            payload: &network_id,
        });
        let mut out = request.to_packet(origin, self.env.address());
        out.compress_with(&self.protocol);
        let len = out.len();
        self.env.switch.send(out, true)?;
        self.metrics.packet_sent(len as u64);
        Ok(())
    }

    fn reply(&self, to: SocketAddr, peer: &Peer, message: &Message<'_>) -> Result<()> {
        self.send_reply(to, peer.address(), peer.key(), message)
    }

    fn send_reply(
        &self,
        to: SocketAddr,
        destination: Address,
        key: &[u8; KEY_LENGTH],
        message: &Message<'_>,
    ) -> Result<()> {
        let mut packet = message.to_packet(destination, self.env.address());
        packet.compress_with(&self.protocol);
        packet.armor(key, true);
        if let Err(e) = self.env.transport.send(to, packet.as_bytes()) {
            warn!(%to, error = %e, "failed to send reply");
            return Err(e);
        }
        self.metrics.packet_sent(packet.len() as u64);
        Ok(())
    }
}
