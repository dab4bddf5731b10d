// test-only module included via protocol/mod.rs
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use crate::core::address::{Address, Mac, MulticastGroup};
use crate::core::certificate::CertificateOfMembership;
use crate::core::identity::LocalIdentity;
use crate::error::ProtocolError;
use crate::protocol::dispatcher::DropReason;
use crate::protocol::message::*;
use crate::protocol::verb::{ErrorCode, Verb};
use bytes::BufMut;

const NWID: u64 = 0x8056_c2e2_1c00_0001;

fn group() -> MulticastGroup {
    MulticastGroup::new(Mac::new(0x3333_0000_0001), 0)
}

fn unsigned_com() -> CertificateOfMembership {
    CertificateOfMembership::new(1_000, 100, NWID, Address::new(0x0102030405))
}

#[test]
fn test_multicast_frame_all_optional_fields_shift_offsets() {
    let com = unsigned_com();
    let com_bytes = com.to_bytes();
    // version + count + 3 qualifiers + zero signer, no signature
    assert_eq!(com_bytes.len(), 3 + 3 * 24 + 5);

    let source = Mac::new(0x0a00_0000_0042);
    let mut payload = Vec::new();
    payload.put_u64(NWID);
    payload.put_u8(0x07);
    payload.put_slice(&com_bytes);
    payload.put_u32(12);
    payload.put_slice(&source.to_bytes());
    payload.put_slice(&group().mac().to_bytes());
    payload.put_u32(group().adi());
    payload.put_u16(0x0800);
    payload.put_slice(b"frame bytes");

    // base offset is the end of the group field for the flag-free layout
    let base = 8 + 1 + 6 + 4;
    let ether_type_at = base + com_bytes.len() + 4 + 6;
    assert_eq!(&payload[ether_type_at..ether_type_at + 2], &[0x08, 0x00]);

    let Message::MulticastFrame(f) = Message::decode(Verb::MulticastFrame as u8, &payload).unwrap() else {
        panic!("expected MULTICAST_FRAME");
    };
    assert_eq!(f.network_id, NWID);
    assert_eq!(f.com.as_ref(), Some(&com));
    assert_eq!(f.gather_limit, Some(12));
    assert_eq!(f.source, Some(source));
    assert_eq!(f.group, group());
    assert_eq!(f.ether_type, 0x0800);
    assert_eq!(f.data, b"frame bytes");
    assert_eq!(f.flags(), 0x07);
}

#[test]
fn test_multicast_frame_without_optional_fields() {
    let mut payload = Vec::new();
    payload.put_u64(NWID);
    payload.put_u8(0);
    payload.put_slice(&group().mac().to_bytes());
    payload.put_u32(group().adi());
    payload.put_u16(0x86dd);
    payload.put_slice(&[1, 2, 3]);

    let Message::MulticastFrame(f) = Message::decode(Verb::MulticastFrame as u8, &payload).unwrap() else {
        panic!("expected MULTICAST_FRAME");
    };
    assert!(f.com.is_none());
    assert!(f.gather_limit.is_none());
    assert!(f.source.is_none());
    assert_eq!(f.ether_type, 0x86dd);
    assert_eq!(f.data, &[1, 2, 3]);
}

#[test]
fn test_truncated_optional_field_is_an_error() {
    let mut payload = Vec::new();
    payload.put_u64(NWID);
    payload.put_u8(MULTICAST_FRAME_FLAG_GATHER_LIMIT);
    payload.put_u16(1);
    assert!(Message::decode(Verb::MulticastFrame as u8, &payload).is_err());
}

#[test]
fn test_whois_requires_exactly_one_address() {
    let addr = Address::new(0x89e9_2cee_e5);
    let addr_bytes = addr.to_bytes();
    let ok = Message::decode(Verb::Whois as u8, &addr_bytes).unwrap();
    assert_eq!(ok, Message::Whois(addr));

    let mut long = addr.to_bytes().to_vec();
    long.push(0);
    assert!(matches!(
        Message::decode(Verb::Whois as u8, &long),
        Err(ProtocolError::MalformedField(_))
    ));
    assert!(Message::decode(Verb::Whois as u8, &addr.to_bytes()[..4]).is_err());
}

#[test]
fn test_unknown_verb_is_not_an_error() {
    assert_eq!(Message::decode(0x1d, b"whatever").unwrap(), Message::Unknown(0x1d));
    assert_eq!(Message::Unknown(0x1d).verb(), 0x1d);
}

#[test]
fn test_rendezvous_address_forms() {
    let mut payload = Vec::new();
    payload.put_u8(0);
    payload.put_slice(&Address::new(7).to_bytes());
    payload.put_u16(9993);
    payload.put_u8(4);
    payload.put_slice(&[10, 0, 0, 1]);
    let Message::Rendezvous(rv) = Message::decode(Verb::Rendezvous as u8, &payload).unwrap() else {
        panic!("expected RENDEZVOUS");
    };
    assert_eq!(rv.with, Address::new(7));
    assert_eq!(rv.endpoint, "10.0.0.1:9993".parse().unwrap());

    payload[8] = 6;
    assert!(Message::decode(Verb::Rendezvous as u8, &payload).is_err());
}

#[test]
fn test_multicast_like_tuples() {
    let mut payload = Vec::new();
    for adi in 0..3u32 {
        payload.put_u64(NWID);
        payload.put_slice(&Mac::BROADCAST.to_bytes());
        payload.put_u32(adi);
    }
    let Message::MulticastLike(likes) = Message::decode(Verb::MulticastLike as u8, &payload).unwrap() else {
        panic!("expected MULTICAST_LIKE");
    };
    assert_eq!(likes.len(), 3);
    assert_eq!(likes[2], (NWID, MulticastGroup::new(Mac::BROADCAST, 2)));

    payload.push(0);
    assert!(Message::decode(Verb::MulticastLike as u8, &payload).is_err());
}

#[test]
fn test_netconf_request_metadata_is_optional() {
    let nwid_bytes = NWID.to_be_bytes();
    let Message::NetworkConfigRequest(req) =
        Message::decode(Verb::NetworkConfigRequest as u8, &nwid_bytes).unwrap()
    else {
        panic!("expected NETWORK_CONFIG_REQUEST");
    };
    assert_eq!(req.network_id, NWID);
    assert!(req.metadata.is_empty());

    let mut payload = NWID.to_be_bytes().to_vec();
    payload.put_u16(5);
    payload.put_slice(b"a=b\nc");
    let Message::NetworkConfigRequest(req) =
        Message::decode(Verb::NetworkConfigRequest as u8, &payload).unwrap()
    else {
        panic!("expected NETWORK_CONFIG_REQUEST");
    };
    assert_eq!(req.metadata, b"a=b\nc");
}

#[test]
fn test_refresh_ignores_trailing_partial_id() {
    let mut payload = Vec::new();
    payload.put_u64(NWID);
    payload.put_u64(NWID + 1);
    payload.put_slice(&[0xff; 3]);
    assert_eq!(
        Message::decode(Verb::NetworkConfigRefresh as u8, &payload).unwrap(),
        Message::NetworkConfigRefresh(vec![NWID, NWID + 1])
    );
}

#[test]
fn test_ok_multicast_frame_reply_carries_results_and_certificate() {
    let reply = Message::Ok(OkMessage {
        in_re_verb: Verb::MulticastFrame as u8,
        in_re_packet_id: 0x1122_3344_5566_7788,
        body: OkBody::MulticastFrame {
            network_id: NWID,
            group: group(),
            com: Some(unsigned_com()),
            results: Some(GatherResults {
                total_known: 9,
                members: vec![Address::new(1), Address::new(2)],
            }),
        },
    });
    let packet = reply.to_packet(Address::new(0x0a), Address::new(0x0b));
    assert_eq!(packet.verb_raw(), Verb::Ok as u8);
    let decoded = Message::decode(packet.verb_raw(), packet.payload()).unwrap();
    assert_eq!(decoded, reply);
}

#[test]
fn test_error_payload_accessors() {
    let mut payload = vec![Verb::Frame as u8];
    payload.put_u64(42);
    payload.put_u8(ErrorCode::NeedMembershipCertificate as u8);
    payload.put_u64(NWID);
    let Message::Error(e) = Message::decode(Verb::Error as u8, &payload).unwrap() else {
        panic!("expected ERROR");
    };
    assert_eq!(e.in_re(), Some(Verb::Frame));
    assert_eq!(e.in_re_packet_id, 42);
    assert_eq!(e.error_code(), Some(ErrorCode::NeedMembershipCertificate));
    assert_eq!(e.network_id().unwrap(), NWID);
}

#[test]
fn test_hello_carries_identity() {
    let me = LocalIdentity::generate().unwrap();
    let hello = Message::Hello(Hello {
        protocol_version: 4,
        major: 1,
        minor: 0,
        revision: 3,
        timestamp: 123_456,
        identity: me.identity().clone(),
    });
    let packet = hello.to_packet(Address::new(1), me.address());
    let Message::Hello(h) = Message::decode(Verb::Hello as u8, packet.payload()).unwrap() else {
        panic!("expected HELLO");
    };
    assert_eq!(h.identity, *me.identity());
    assert_eq!(h.revision, 3);
    assert_eq!(h.timestamp, 123_456);
}

#[test]
fn test_p5_frame_layout_and_origin() {
    let bloom = vec![0u8; P5_LEN_BLOOM];
    let frame = P5MulticastFrame {
        depth: 0,
        fifo: &[],
        bloom: &bloom,
        flags: 0,
        network_id: NWID,
        bloom_nonce: 77,
        prefix_bits: 0,
        prefix: 0,
        guid: (0x89e9_2cee_e5u64 << 24) | 0x000123,
        source: Mac::new(0x0a00_0000_0001),
        group: group(),
        ether_type: 0x0800,
        frame: b"legacy",
        signature: &[9u8; 64],
        com: Some(unsigned_com()),
    };
    let packet = Message::P5MulticastFrame(frame).to_packet(Address::new(1), Address::new(2));
    let payload = packet.payload();
    assert_eq!(payload.len(), 2 + P5_LEN_FIFO + P5_LEN_BLOOM + 1 + 8 + 2 + 1 + 1 + 8 + 6 + 10 + 2 + 2 + 6 + 2 + 64 + 80);

    let Message::P5MulticastFrame(decoded) = Message::decode(Verb::P5MulticastFrame as u8, payload).unwrap()
    else {
        panic!("expected P5_MULTICAST_FRAME");
    };
    assert_eq!(decoded.origin(), Address::new(0x89e9_2cee_e5));
    assert_eq!(decoded.flags & P5_FLAG_COM, P5_FLAG_COM);
    assert_eq!(decoded.bloom_nonce, 77);
    assert_eq!(decoded.frame, b"legacy");
    assert_eq!(decoded.com, Some(unsigned_com()));
}

#[test]
fn test_drop_reasons_follow_error_kind() {
    assert_eq!(DropReason::from(&ProtocolError::AuthenticationFailed), DropReason::Unauthenticated);
    assert_eq!(DropReason::from(&ProtocolError::UnsupportedCipher(2)), DropReason::UnsupportedCipher);
    assert_eq!(DropReason::from(&ProtocolError::DecompressionFailure), DropReason::Decompression);
    assert_eq!(DropReason::from(&ProtocolError::Truncated), DropReason::Malformed);
    assert_eq!(DropReason::from(&ProtocolError::OversizedPacket(30_000)), DropReason::Oversized);
    assert_eq!(
        DropReason::from(&ProtocolError::LockPoisoned("peer")),
        DropReason::Internal
    );
}
