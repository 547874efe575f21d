//! Bluetooth device address type.
//!
//! Beacons are keyed by their address everywhere in the exporter: as the
//! ingestion key and as the `address` label on every exported gauge. The
//! type is independent of any specific Bluetooth library.

use std::fmt;

/// A Bluetooth device address stored as a compact 6-byte array, most
/// significant byte first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// Build an address from the little-endian byte order used on the HCI wire.
    pub fn from_le_bytes(mut bytes: [u8; 6]) -> Self {
        bytes.reverse();
        Self(bytes)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

#[cfg(feature = "bluer")]
impl From<bluer::Address> for MacAddress {
    fn from(addr: bluer::Address) -> Self {
        Self(addr.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let addr = MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        assert_eq!(addr.to_string(), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_display_with_zeros() {
        let addr = MacAddress([0x00, 0x01, 0x02, 0x03, 0x04, 0x05]);
        assert_eq!(addr.to_string(), "00:01:02:03:04:05");
    }

    #[test]
    fn test_from_le_bytes_reverses_wire_order() {
        let addr = MacAddress::from_le_bytes([0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA]);
        assert_eq!(addr, MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]));
    }

    #[test]
    fn test_hash_equality() {
        use std::collections::HashMap;

        let addr1 = MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        let addr2 = MacAddress::from([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

        let mut map = HashMap::new();
        map.insert(addr1, "kitchen");

        assert_eq!(map.get(&addr2), Some(&"kitchen"));
    }

    #[cfg(feature = "bluer")]
    #[test]
    fn test_from_bluer_address() {
        let addr = bluer::Address([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        let mac: MacAddress = addr.into();
        assert_eq!(mac, MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]));
    }
}
