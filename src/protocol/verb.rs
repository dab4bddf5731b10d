//! Verb and error-code enumerations.

use crate::error::ProtocolError;
use std::fmt;

/// Message type carried in the low five bits of the envelope byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Verb {
    Nop = 0,
    Hello = 1,
    Error = 2,
    Ok = 3,
    Whois = 4,
    Rendezvous = 5,
    Frame = 6,
    ExtFrame = 7,
    P5MulticastFrame = 8,
    MulticastLike = 9,
    NetworkMembershipCertificate = 10,
    NetworkConfigRequest = 11,
    NetworkConfigRefresh = 12,
    MulticastGather = 13,
    MulticastFrame = 14,
}

impl TryFrom<u8> for Verb {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        Ok(match value {
            0 => Verb::Nop,
            1 => Verb::Hello,
            2 => Verb::Error,
            3 => Verb::Ok,
            4 => Verb::Whois,
            5 => Verb::Rendezvous,
            6 => Verb::Frame,
            7 => Verb::ExtFrame,
            8 => Verb::P5MulticastFrame,
            9 => Verb::MulticastLike,
            10 => Verb::NetworkMembershipCertificate,
            11 => Verb::NetworkConfigRequest,
            12 => Verb::NetworkConfigRefresh,
            13 => Verb::MulticastGather,
            14 => Verb::MulticastFrame,
            other => return Err(ProtocolError::UnknownVerb(other)),
        })
    }
}

impl Verb {
    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Nop => "NOP",
            Verb::Hello => "HELLO",
            Verb::Error => "ERROR",
            Verb::Ok => "OK",
            Verb::Whois => "WHOIS",
            Verb::Rendezvous => "RENDEZVOUS",
            Verb::Frame => "FRAME",
            Verb::ExtFrame => "EXT_FRAME",
            Verb::P5MulticastFrame => "P5_MULTICAST_FRAME",
            Verb::MulticastLike => "MULTICAST_LIKE",
            Verb::NetworkMembershipCertificate => "NETWORK_MEMBERSHIP_CERTIFICATE",
            Verb::NetworkConfigRequest => "NETWORK_CONFIG_REQUEST",
            Verb::NetworkConfigRefresh => "NETWORK_CONFIG_REFRESH",
            Verb::MulticastGather => "MULTICAST_GATHER",
            Verb::MulticastFrame => "MULTICAST_FRAME",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error codes carried in ERROR payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    None = 0,
    InvalidRequest = 1,
    BadProtocolVersion = 2,
    ObjNotFound = 3,
    IdentityCollision = 4,
    UnsupportedOperation = 5,
    NeedMembershipCertificate = 6,
    NetworkAccessDenied = 7,
    UnwantedMulticast = 8,
}

impl TryFrom<u8> for ErrorCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => ErrorCode::None,
            1 => ErrorCode::InvalidRequest,
            2 => ErrorCode::BadProtocolVersion,
            3 => ErrorCode::ObjNotFound,
            4 => ErrorCode::IdentityCollision,
            5 => ErrorCode::UnsupportedOperation,
            6 => ErrorCode::NeedMembershipCertificate,
            7 => ErrorCode::NetworkAccessDenied,
            8 => ErrorCode::UnwantedMulticast,
            _ => return Err(ProtocolError::MalformedField("error code")),
        })
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::None => "NONE",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::BadProtocolVersion => "BAD_PROTOCOL_VERSION",
            ErrorCode::ObjNotFound => "OBJECT_NOT_FOUND",
            ErrorCode::IdentityCollision => "IDENTITY_COLLISION",
            ErrorCode::UnsupportedOperation => "UNSUPPORTED_OPERATION",
            ErrorCode::NeedMembershipCertificate => "NEED_MEMBERSHIP_CERTIFICATE",
            ErrorCode::NetworkAccessDenied => "NETWORK_ACCESS_DENIED",
            ErrorCode::UnwantedMulticast => "UNWANTED_MULTICAST",
        };
        f.write_str(s)
    }
}
