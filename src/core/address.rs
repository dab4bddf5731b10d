//! Addressing value types: 40-bit node addresses, 48-bit Ethernet MACs and
//! multicast groups.

use crate::error::{ProtocolError, Result};
use std::fmt;

/// 40-bit node address, the short form of an identity's public key hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(u64);

impl Address {
    pub const LENGTH: usize = 5;

    /// Addresses beginning with this byte are reserved.
    pub const RESERVED_PREFIX: u8 = 0xff;

    /// Build from an integer, keeping only the low 40 bits.
    pub const fn new(value: u64) -> Self {
        Self(value & 0xff_ffff_ffff)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let b = bytes
            .get(..Self::LENGTH)
            .ok_or(ProtocolError::MalformedField("address"))?;
        Ok(Self(
            (u64::from(b[0]) << 32)
                | (u64::from(b[1]) << 24)
                | (u64::from(b[2]) << 16)
                | (u64::from(b[3]) << 8)
                | u64::from(b[4]),
        ))
    }

    pub fn to_bytes(self) -> [u8; 5] {
        let v = self.0;
        [
            (v >> 32) as u8,
            (v >> 24) as u8,
            (v >> 16) as u8,
            (v >> 8) as u8,
            v as u8,
        ]
    }

    pub const fn to_u64(self) -> u64 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Zero and `0xff…` addresses can never belong to a node.
    pub fn is_reserved(self) -> bool {
        self.0 == 0 || (self.0 >> 32) as u8 == Self::RESERVED_PREFIX
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:010x}", self.0)
    }
}

/// 48-bit Ethernet MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Mac(u64);

impl Mac {
    pub const LENGTH: usize = 6;

    pub const BROADCAST: Mac = Mac(0xffff_ffff_ffff);

    pub const fn new(value: u64) -> Self {
        Self(value & 0xffff_ffff_ffff)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let b = bytes
            .get(..Self::LENGTH)
            .ok_or(ProtocolError::MalformedField("mac"))?;
        Ok(Self(b.iter().fold(0u64, |acc, &x| (acc << 8) | u64::from(x))))
    }

    pub fn to_bytes(self) -> [u8; 6] {
        let v = self.0;
        [
            (v >> 40) as u8,
            (v >> 32) as u8,
            (v >> 24) as u8,
            (v >> 16) as u8,
            (v >> 8) as u8,
            v as u8,
        ]
    }

    pub const fn to_u64(self) -> u64 {
        self.0
    }

    pub fn first_octet(self) -> u8 {
        (self.0 >> 40) as u8
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Group bit of the first octet.
    pub fn is_multicast(self) -> bool {
        self.first_octet() & 0x01 != 0
    }

    /// Deterministic MAC a node presents on a given network.
    ///
    /// The first octet comes from the low byte of the network ID with the
    /// locally-administered bit set and the group bit cleared. `0x52` is
    /// remapped to `0x32` to stay clear of a range used by common hypervisors.
    /// The remaining five octets are the node address XORed with bytes 1..5
    /// of the network ID.
    pub fn from_address(address: Address, network_id: u64) -> Self {
        let mut first = ((network_id & 0xfe) as u8) | 0x02;
        if first == 0x52 {
            first = 0x32;
        }
        let mut m = (u64::from(first) << 40) | address.to_u64();
        m ^= ((network_id >> 8) & 0xff) << 32;
        m ^= ((network_id >> 16) & 0xff) << 24;
        m ^= ((network_id >> 24) & 0xff) << 16;
        m ^= ((network_id >> 32) & 0xff) << 8;
        m ^= (network_id >> 40) & 0xff;
        Self(m)
    }

    /// Inverse of [`Mac::from_address`]. Only meaningful when the MAC was
    /// derived, i.e. when `Mac::from_address(result, nwid) == self`.
    pub fn to_address(self, network_id: u64) -> Address {
        let mut a = self.0 & 0xff_ffff_ffff;
        a ^= ((network_id >> 8) & 0xff) << 32;
        a ^= ((network_id >> 16) & 0xff) << 24;
        a ^= ((network_id >> 24) & 0xff) << 16;
        a ^= ((network_id >> 32) & 0xff) << 8;
        a ^= (network_id >> 40) & 0xff;
        Address::new(a)
    }
}

impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.to_bytes();
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// A multicast destination: MAC plus 32-bit additional distinguishing
/// information (ADI). Ordered by MAC then ADI so it can key ordered maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MulticastGroup {
    mac: Mac,
    adi: u32,
}

impl MulticastGroup {
    pub const fn new(mac: Mac, adi: u32) -> Self {
        Self { mac, adi }
    }

    /// Ethernet broadcast as a group.
    pub const fn broadcast() -> Self {
        Self::new(Mac::BROADCAST, 0)
    }

    pub const fn mac(&self) -> Mac {
        self.mac
    }

    pub const fn adi(&self) -> u32 {
        self.adi
    }
}

impl fmt::Display for MulticastGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:08x}", self.mac, self.adi)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_address_bytes() {
        let a = Address::from_bytes(&[0x89, 0xe9, 0x2c, 0xee, 0xe5]).unwrap();
        assert_eq!(a.to_u64(), 0x89e92ceee5);
        assert_eq!(a.to_bytes(), [0x89, 0xe9, 0x2c, 0xee, 0xe5]);
        assert_eq!(a.to_string(), "89e92ceee5");
        assert!(Address::from_bytes(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_reserved_addresses() {
        assert!(Address::new(0).is_reserved());
        assert!(Address::new(0xff_0000_0001).is_reserved());
        assert!(!Address::new(0x01_0000_0000).is_reserved());
    }

    #[test]
    fn test_mac_derivation_round_trip() {
        let nwid = 0x8056c2e21c000001u64;
        let addr = Address::new(0x89e92ceee5);
        let mac = Mac::from_address(addr, nwid);
        assert!(!mac.is_multicast());
        assert_eq!(mac.first_octet() & 0x02, 0x02);
        assert_eq!(mac.to_address(nwid), addr);
    }

    #[test]
    fn test_mac_first_octet_remap() {
        let mac = Mac::from_address(Address::new(1), 0x52);
        assert_eq!(mac.first_octet(), 0x32);
    }

    #[test]
    fn test_multicast_group_ordering() {
        let a = MulticastGroup::new(Mac::new(1), 5);
        let b = MulticastGroup::new(Mac::new(1), 6);
        let c = MulticastGroup::new(Mac::new(2), 0);
        assert!(a < b && b < c);
        assert!(MulticastGroup::broadcast().mac().is_multicast());
    }
}
