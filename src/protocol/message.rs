//! # Verb Payloads
//!
//! One variant per verb, carrying that verb's parsed fields. [`Message::decode`]
//! is the only place payload bytes are interpreted; handlers work on the
//! typed values. [`Message::to_packet`] is the inverse and is used to build
//! every outbound reply.
//!
//! Several verbs have optional fields whose presence is signalled by a flags
//! byte. Parsing walks them in declaration order with a [`PayloadReader`], so
//! every later field lands at an offset shifted by the optional fields that
//! actually appeared.

use crate::core::address::{Address, Mac, MulticastGroup};
use crate::core::certificate::CertificateOfMembership;
use crate::core::cursor::PayloadReader;
use crate::core::identity::Identity;
use crate::core::packet::Packet;
use crate::error::{ProtocolError, Result};
use crate::protocol::verb::{ErrorCode, Verb};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// EXT_FRAME: a certificate of membership follows the flags byte.
pub const EXT_FRAME_FLAG_COM: u8 = 0x01;

/// MULTICAST_GATHER: a certificate of membership follows the gather limit.
pub const GATHER_FLAG_COM: u8 = 0x01;

/// MULTICAST_FRAME optional fields, in wire order.
pub const MULTICAST_FRAME_FLAG_COM: u8 = 0x01;
pub const MULTICAST_FRAME_FLAG_GATHER_LIMIT: u8 = 0x02;
pub const MULTICAST_FRAME_FLAG_SOURCE_MAC: u8 = 0x04;

/// OK(MULTICAST_FRAME) optional fields, in wire order.
pub const OK_MULTICAST_FRAME_FLAG_COM: u8 = 0x01;
pub const OK_MULTICAST_FRAME_FLAG_GATHER_RESULTS: u8 = 0x02;

/// P5_MULTICAST_FRAME: a certificate of membership follows the signature.
pub const P5_FLAG_COM: u8 = 0x01;

/// Payload-relative offsets of the fixed P5 prefix.
pub const P5_IDX_DEPTH: usize = 0;
pub const P5_IDX_FIFO: usize = 2;
pub const P5_LEN_FIFO: usize = 320;
pub const P5_IDX_BLOOM: usize = P5_IDX_FIFO + P5_LEN_FIFO;
pub const P5_LEN_BLOOM: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub protocol_version: u8,
    pub major: u8,
    pub minor: u8,
    pub revision: u16,
    pub timestamp: u64,
    pub identity: Identity,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMessage<'a> {
    pub in_re_verb: u8,
    pub in_re_packet_id: u64,
    pub code: u8,
    /// Code-specific trailing data.
    pub payload: &'a [u8],
}

impl ErrorMessage<'_> {
    pub fn in_re(&self) -> Option<Verb> {
        Verb::try_from(self.in_re_verb).ok()
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        ErrorCode::try_from(self.code).ok()
    }

    /// Network ID that leads the payload of network-scoped errors.
    pub fn network_id(&self) -> Result<u64> {
        PayloadReader::new(self.payload).read_u64()
    }

    /// Address that leads the payload of WHOIS errors.
    pub fn address(&self) -> Result<Address> {
        PayloadReader::new(self.payload).read_address()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OkHello {
    pub timestamp: u64,
    pub protocol_version: u8,
    pub major: u8,
    pub minor: u8,
    pub revision: u16,
}

/// Members of a multicast group, as returned by a gather.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatherResults {
    pub total_known: u32,
    pub members: Vec<Address>,
}

impl GatherResults {
    fn read(reader: &mut PayloadReader<'_>) -> Result<Self> {
        let total_known = reader.read_u32()?;
        let count = reader.read_u16()? as usize;
        let mut members = Vec::with_capacity(count.min(reader.remaining() / Address::LENGTH));
        for _ in 0..count {
            members.push(reader.read_address()?);
        }
        Ok(Self {
            total_known,
            members,
        })
    }

    fn write_to(&self, out: &mut Packet) {
        out.append_u32(self.total_known);
        out.append_u16(self.members.len() as u16);
        for m in &self.members {
            out.append(&m.to_bytes());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OkBody<'a> {
    Hello(OkHello),
    Whois(Identity),
    NetworkConfigRequest {
        network_id: u64,
        dictionary: &'a [u8],
    },
    MulticastGather {
        network_id: u64,
        group: MulticastGroup,
        results: GatherResults,
    },
    MulticastFrame {
        network_id: u64,
        group: MulticastGroup,
        com: Option<CertificateOfMembership>,
        results: Option<GatherResults>,
    },
    /// OK for a verb with no structured reply.
    Other(&'a [u8]),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OkMessage<'a> {
    pub in_re_verb: u8,
    pub in_re_packet_id: u64,
    pub body: OkBody<'a>,
}

impl OkMessage<'_> {
    pub fn in_re(&self) -> Option<Verb> {
        Verb::try_from(self.in_re_verb).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendezvous {
    pub flags: u8,
    pub with: Address,
    pub endpoint: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame<'a> {
    pub network_id: u64,
    pub ether_type: u16,
    pub data: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtFrame<'a> {
    pub network_id: u64,
    pub com: Option<CertificateOfMembership>,
    pub to: Mac,
    pub from: Mac,
    pub ether_type: u16,
    pub data: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulticastGather {
    pub network_id: u64,
    pub group: MulticastGroup,
    pub gather_limit: u32,
    pub com: Option<CertificateOfMembership>,
}

/// MULTICAST_FRAME payload.
///
/// Every optional field is read when the payload is decoded, before the
/// handler looks at membership. A payload whose flags promise fields it does
/// not carry is therefore dropped as malformed, and the sender is not asked
/// for a membership certificate even if it lacks one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulticastFrame<'a> {
    pub network_id: u64,
    pub com: Option<CertificateOfMembership>,
    pub gather_limit: Option<u32>,
    pub source: Option<Mac>,
    pub group: MulticastGroup,
    pub ether_type: u16,
    pub data: &'a [u8],
}

impl MulticastFrame<'_> {
    pub fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.com.is_some() {
            flags |= MULTICAST_FRAME_FLAG_COM;
        }
        if self.gather_limit.is_some() {
            flags |= MULTICAST_FRAME_FLAG_GATHER_LIMIT;
        }
        if self.source.is_some() {
            flags |= MULTICAST_FRAME_FLAG_SOURCE_MAC;
        }
        flags
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfigRequest<'a> {
    pub network_id: u64,
    pub metadata: &'a [u8],
}

/// Legacy multicast frame relayed for pre-1.0 peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct P5MulticastFrame<'a> {
    pub depth: u16,
    pub fifo: &'a [u8],
    pub bloom: &'a [u8],
    pub flags: u8,
    pub network_id: u64,
    pub bloom_nonce: u16,
    pub prefix_bits: u8,
    pub prefix: u8,
    /// Origin address (high 40 bits) and multicast ID (low 24 bits).
    pub guid: u64,
    pub source: Mac,
    pub group: MulticastGroup,
    pub ether_type: u16,
    pub frame: &'a [u8],
    pub signature: &'a [u8],
    pub com: Option<CertificateOfMembership>,
}

impl P5MulticastFrame<'_> {
    pub fn origin(&self) -> Address {
        Address::new(self.guid >> 24)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message<'a> {
    Nop,
    Hello(Hello),
    Error(ErrorMessage<'a>),
    Ok(OkMessage<'a>),
    Whois(Address),
    Rendezvous(Rendezvous),
    Frame(Frame<'a>),
    ExtFrame(ExtFrame<'a>),
    P5MulticastFrame(P5MulticastFrame<'a>),
    MulticastLike(Vec<(u64, MulticastGroup)>),
    /// All or nothing: one truncated certificate fails the whole payload.
    NetworkMembershipCertificate(Vec<CertificateOfMembership>),
    NetworkConfigRequest(NetworkConfigRequest<'a>),
    NetworkConfigRefresh(Vec<u64>),
    MulticastGather(MulticastGather),
    MulticastFrame(MulticastFrame<'a>),
    /// A verb this node does not know. Still counts as received.
    Unknown(u8),
}

fn read_group(r: &mut PayloadReader<'_>) -> Result<MulticastGroup> {
    let mac = r.read_mac()?;
    let adi = r.read_u32()?;
    Ok(MulticastGroup::new(mac, adi))
}

fn read_optional_com(
    r: &mut PayloadReader<'_>,
    present: bool,
) -> Result<Option<CertificateOfMembership>> {
    if present {
        CertificateOfMembership::read(r).map(Some)
    } else {
        Ok(None)
    }
}

impl<'a> Message<'a> {
    /// Parse the payload of a dearmored, uncompressed packet.
    pub fn decode(verb: u8, payload: &'a [u8]) -> Result<Self> {
        let verb = match Verb::try_from(verb) {
            Ok(v) => v,
            Err(_) => return Ok(Message::Unknown(verb)),
        };
        let mut r = PayloadReader::new(payload);

        let message = match verb {
            Verb::Nop => Message::Nop,
            Verb::Hello => Message::Hello(Hello {
                protocol_version: r.read_u8()?,
                major: r.read_u8()?,
                minor: r.read_u8()?,
                revision: r.read_u16()?,
                timestamp: r.read_u64()?,
                identity: Identity::read(&mut r)?,
            }),
            Verb::Error => Message::Error(ErrorMessage {
                in_re_verb: r.read_u8()?,
                in_re_packet_id: r.read_u64()?,
                code: r.read_u8()?,
                payload: r.rest(),
            }),
            Verb::Ok => Message::Ok(Self::decode_ok(&mut r)?),
            Verb::Whois => {
                if payload.len() != Address::LENGTH {
                    return Err(ProtocolError::MalformedField("whois address"));
                }
                Message::Whois(r.read_address()?)
            }
            Verb::Rendezvous => {
                let flags = r.read_u8()?;
                let with = r.read_address()?;
                let port = r.read_u16()?;
                let ip = match r.read_u8()? {
                    4 => IpAddr::V4(Ipv4Addr::from(r.read_array::<4>()?)),
                    16 => IpAddr::V6(Ipv6Addr::from(r.read_array::<16>()?)),
                    _ => return Err(ProtocolError::MalformedField("rendezvous address length")),
                };
                Message::Rendezvous(Rendezvous {
                    flags,
                    with,
                    endpoint: SocketAddr::new(ip, port),
                })
            }
            Verb::Frame => Message::Frame(Frame {
                network_id: r.read_u64()?,
                ether_type: r.read_u16()?,
                data: r.rest(),
            }),
            Verb::ExtFrame => {
                let network_id = r.read_u64()?;
                let flags = r.read_u8()?;
                let com = read_optional_com(&mut r, flags & EXT_FRAME_FLAG_COM != 0)?;
                Message::ExtFrame(ExtFrame {
                    network_id,
                    com,
                    to: r.read_mac()?,
                    from: r.read_mac()?,
                    ether_type: r.read_u16()?,
                    data: r.rest(),
                })
            }
            Verb::P5MulticastFrame => Message::P5MulticastFrame(Self::decode_p5(&mut r)?),
            Verb::MulticastLike => {
                let mut likes = Vec::with_capacity(payload.len() / 18);
                while !r.is_empty() {
                    let network_id = r.read_u64()?;
                    likes.push((network_id, read_group(&mut r)?));
                }
                Message::MulticastLike(likes)
            }
            Verb::NetworkMembershipCertificate => {
                let mut certs = Vec::new();
                while !r.is_empty() {
                    certs.push(CertificateOfMembership::read(&mut r)?);
                }
                Message::NetworkMembershipCertificate(certs)
            }
            Verb::NetworkConfigRequest => {
                let network_id = r.read_u64()?;
                let metadata = if r.is_empty() {
                    &[][..]
                } else {
                    r.read_length_prefixed()?
                };
                Message::NetworkConfigRequest(NetworkConfigRequest {
                    network_id,
                    metadata,
                })
            }
            Verb::NetworkConfigRefresh => {
                let mut ids = Vec::with_capacity(payload.len() / 8);
                while r.remaining() >= 8 {
                    ids.push(r.read_u64()?);
                }
                Message::NetworkConfigRefresh(ids)
            }
            Verb::MulticastGather => {
                let network_id = r.read_u64()?;
                let flags = r.read_u8()?;
                let group = read_group(&mut r)?;
                let gather_limit = r.read_u32()?;
                let com = read_optional_com(&mut r, flags & GATHER_FLAG_COM != 0)?;
                Message::MulticastGather(MulticastGather {
                    network_id,
                    group,
                    gather_limit,
                    com,
                })
            }
            Verb::MulticastFrame => {
                let network_id = r.read_u64()?;
                let flags = r.read_u8()?;
                let com = read_optional_com(&mut r, flags & MULTICAST_FRAME_FLAG_COM != 0)?;
                let gather_limit = if flags & MULTICAST_FRAME_FLAG_GATHER_LIMIT != 0 {
                    Some(r.read_u32()?)
                } else {
                    None
                };
                let source = if flags & MULTICAST_FRAME_FLAG_SOURCE_MAC != 0 {
                    Some(r.read_mac()?)
                } else {
                    None
                };
                Message::MulticastFrame(MulticastFrame {
                    network_id,
                    com,
                    gather_limit,
                    source,
                    group: read_group(&mut r)?,
                    ether_type: r.read_u16()?,
                    data: r.rest(),
                })
            }
        };
        Ok(message)
    }

    fn decode_ok(r: &mut PayloadReader<'a>) -> Result<OkMessage<'a>> {
        let in_re_verb = r.read_u8()?;
        let in_re_packet_id = r.read_u64()?;
        let body = match Verb::try_from(in_re_verb) {
            Ok(Verb::Hello) => OkBody::Hello(OkHello {
                timestamp: r.read_u64()?,
                protocol_version: r.read_u8()?,
                major: r.read_u8()?,
                minor: r.read_u8()?,
                revision: r.read_u16()?,
            }),
            Ok(Verb::Whois) => OkBody::Whois(Identity::read(r)?),
            Ok(Verb::NetworkConfigRequest) => OkBody::NetworkConfigRequest {
                network_id: r.read_u64()?,
                dictionary: r.read_length_prefixed()?,
            },
            Ok(Verb::MulticastGather) => OkBody::MulticastGather {
                network_id: r.read_u64()?,
                group: read_group(r)?,
                results: GatherResults::read(r)?,
            },
            Ok(Verb::MulticastFrame) => {
                let network_id = r.read_u64()?;
                let group = read_group(r)?;
                let flags = r.read_u8()?;
                let com = read_optional_com(r, flags & OK_MULTICAST_FRAME_FLAG_COM != 0)?;
                let results = if flags & OK_MULTICAST_FRAME_FLAG_GATHER_RESULTS != 0 {
                    Some(GatherResults::read(r)?)
                } else {
                    None
                };
                OkBody::MulticastFrame {
                    network_id,
                    group,
                    com,
                    results,
                }
            }
            _ => OkBody::Other(r.rest()),
        };
        Ok(OkMessage {
            in_re_verb,
            in_re_packet_id,
            body,
        })
    }

    fn decode_p5(r: &mut PayloadReader<'a>) -> Result<P5MulticastFrame<'a>> {
        let depth = r.read_u16()?;
        let fifo = r.read_bytes(P5_LEN_FIFO)?;
        let bloom = r.read_bytes(P5_LEN_BLOOM)?;
        let flags = r.read_u8()?;
        let network_id = r.read_u64()?;
        let bloom_nonce = r.read_u16()?;
        let prefix_bits = r.read_u8()?;
        let prefix = r.read_u8()?;
        let guid = r.read_u64()?;
        let source = r.read_mac()?;
        let group = read_group(r)?;
        let ether_type = r.read_u16()?;
        let frame = r.read_length_prefixed()?;
        let signature = r.read_length_prefixed()?;
        let com = read_optional_com(r, flags & P5_FLAG_COM != 0)?;
        Ok(P5MulticastFrame {
            depth,
            fifo,
            bloom,
            flags,
            network_id,
            bloom_nonce,
            prefix_bits,
            prefix,
            guid,
            source,
            group,
            ether_type,
            frame,
            signature,
            com,
        })
    }

    pub fn verb(&self) -> u8 {
        let verb = match self {
            Message::Nop => Verb::Nop,
            Message::Hello(_) => Verb::Hello,
            Message::Error(_) => Verb::Error,
            Message::Ok(_) => Verb::Ok,
            Message::Whois(_) => Verb::Whois,
            Message::Rendezvous(_) => Verb::Rendezvous,
            Message::Frame(_) => Verb::Frame,
            Message::ExtFrame(_) => Verb::ExtFrame,
            Message::P5MulticastFrame(_) => Verb::P5MulticastFrame,
            Message::MulticastLike(_) => Verb::MulticastLike,
            Message::NetworkMembershipCertificate(_) => Verb::NetworkMembershipCertificate,
            Message::NetworkConfigRequest(_) => Verb::NetworkConfigRequest,
            Message::NetworkConfigRefresh(_) => Verb::NetworkConfigRefresh,
            Message::MulticastGather(_) => Verb::MulticastGather,
            Message::MulticastFrame(_) => Verb::MulticastFrame,
            Message::Unknown(raw) => return *raw,
        };
        verb as u8
    }

    /// Build an unarmored packet carrying this message.
    pub fn to_packet(&self, destination: Address, source: Address) -> Packet {
        let mut p = Packet::new_raw(destination, source, self.verb());
        match self {
            Message::Nop | Message::Unknown(_) => {}
            Message::Hello(h) => {
                p.append_u8(h.protocol_version);
                p.append_u8(h.major);
                p.append_u8(h.minor);
                p.append_u16(h.revision);
                p.append_u64(h.timestamp);
                p.append(&h.identity.to_bytes());
            }
            Message::Error(e) => {
                p.append_u8(e.in_re_verb);
                p.append_u64(e.in_re_packet_id);
                p.append_u8(e.code);
                p.append(e.payload);
            }
            Message::Ok(ok) => {
                p.append_u8(ok.in_re_verb);
                p.append_u64(ok.in_re_packet_id);
                write_ok_body(&ok.body, &mut p);
            }
            Message::Whois(addr) => p.append(&addr.to_bytes()),
            Message::Rendezvous(rv) => {
                p.append_u8(rv.flags);
                p.append(&rv.with.to_bytes());
                p.append_u16(rv.endpoint.port());
                match rv.endpoint.ip() {
                    IpAddr::V4(ip) => {
                        p.append_u8(4);
                        p.append(&ip.octets());
                    }
                    IpAddr::V6(ip) => {
                        p.append_u8(16);
                        p.append(&ip.octets());
                    }
                }
            }
            Message::Frame(f) => {
                p.append_u64(f.network_id);
                p.append_u16(f.ether_type);
                p.append(f.data);
            }
            Message::ExtFrame(f) => {
                p.append_u64(f.network_id);
                match f.com {
                    Some(ref com) => {
                        p.append_u8(EXT_FRAME_FLAG_COM);
                        p.append(&com.to_bytes());
                    }
                    None => p.append_u8(0),
                }
                p.append(&f.to.to_bytes());
                p.append(&f.from.to_bytes());
                p.append_u16(f.ether_type);
                p.append(f.data);
            }
            Message::P5MulticastFrame(f) => write_p5(f, &mut p),
            Message::MulticastLike(likes) => {
                for (nwid, group) in likes {
                    p.append_u64(*nwid);
                    p.append(&group.mac().to_bytes());
                    p.append_u32(group.adi());
                }
            }
            Message::NetworkMembershipCertificate(certs) => {
                for com in certs {
                    p.append(&com.to_bytes());
                }
            }
            Message::NetworkConfigRequest(req) => {
                p.append_u64(req.network_id);
                p.append_u16(req.metadata.len() as u16);
                p.append(req.metadata);
            }
            Message::NetworkConfigRefresh(ids) => {
                for id in ids {
                    p.append_u64(*id);
                }
            }
            Message::MulticastGather(g) => {
                p.append_u64(g.network_id);
                p.append_u8(if g.com.is_some() { GATHER_FLAG_COM } else { 0 });
                p.append(&g.group.mac().to_bytes());
                p.append_u32(g.group.adi());
                p.append_u32(g.gather_limit);
                if let Some(ref com) = g.com {
                    p.append(&com.to_bytes());
                }
            }
            Message::MulticastFrame(f) => {
                p.append_u64(f.network_id);
                p.append_u8(f.flags());
                if let Some(ref com) = f.com {
                    p.append(&com.to_bytes());
                }
                if let Some(limit) = f.gather_limit {
                    p.append_u32(limit);
                }
                if let Some(mac) = f.source {
                    p.append(&mac.to_bytes());
                }
                p.append(&f.group.mac().to_bytes());
                p.append_u32(f.group.adi());
                p.append_u16(f.ether_type);
                p.append(f.data);
            }
        }
        p
    }
}

fn write_ok_body(body: &OkBody<'_>, p: &mut Packet) {
    match body {
        OkBody::Hello(h) => {
            p.append_u64(h.timestamp);
            p.append_u8(h.protocol_version);
            p.append_u8(h.major);
            p.append_u8(h.minor);
            p.append_u16(h.revision);
        }
        OkBody::Whois(identity) => p.append(&identity.to_bytes()),
        OkBody::NetworkConfigRequest {
            network_id,
            dictionary,
        } => {
            p.append_u64(*network_id);
            p.append_u16(dictionary.len() as u16);
            p.append(dictionary);
        }
        OkBody::MulticastGather {
            network_id,
            group,
            results,
        } => {
            p.append_u64(*network_id);
            p.append(&group.mac().to_bytes());
            p.append_u32(group.adi());
            results.write_to(p);
        }
        OkBody::MulticastFrame {
            network_id,
            group,
            com,
            results,
        } => {
            p.append_u64(*network_id);
            p.append(&group.mac().to_bytes());
            p.append_u32(group.adi());
            let mut flags = 0;
            if com.is_some() {
                flags |= OK_MULTICAST_FRAME_FLAG_COM;
            }
            if results.is_some() {
                flags |= OK_MULTICAST_FRAME_FLAG_GATHER_RESULTS;
            }
            p.append_u8(flags);
            if let Some(com) = com {
                p.append(&com.to_bytes());
            }
            if let Some(results) = results {
                results.write_to(p);
            }
        }
        OkBody::Other(rest) => p.append(rest),
    }
}

fn append_fixed(p: &mut Packet, bytes: &[u8], len: usize) {
    let n = bytes.len().min(len);
    p.append(&bytes[..n]);
    p.append(&vec![0u8; len - n]);
}

fn write_p5(f: &P5MulticastFrame<'_>, p: &mut Packet) {
    p.append_u16(f.depth);
    append_fixed(p, f.fifo, P5_LEN_FIFO);
    append_fixed(p, f.bloom, P5_LEN_BLOOM);
    let mut flags = f.flags & !P5_FLAG_COM;
    if f.com.is_some() {
        flags |= P5_FLAG_COM;
    }
    p.append_u8(flags);
    p.append_u64(f.network_id);
    p.append_u16(f.bloom_nonce);
    p.append_u8(f.prefix_bits);
    p.append_u8(f.prefix);
    p.append_u64(f.guid);
    p.append(&f.source.to_bytes());
    p.append(&f.group.mac().to_bytes());
    p.append_u32(f.group.adi());
    p.append_u16(f.ether_type);
    p.append_u16(f.frame.len() as u16);
    p.append(f.frame);
    p.append_u16(f.signature.len() as u16);
    p.append(f.signature);
    if let Some(ref com) = f.com {
        p.append(&com.to_bytes());
    }
}
