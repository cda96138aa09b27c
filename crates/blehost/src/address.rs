//! Device addresses

use std::fmt;
use std::str::FromStr;

/// LE address type as carried in HCI and SMP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddressType {
    #[default]
    Public,
    Random,
}

impl AddressType {
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Public => 0x00,
            Self::Random => 0x01,
        }
    }

    /// Identity address types (0x02, 0x03) fold onto public/random
    pub fn from_u8(value: u8) -> Self {
        if value & 0x01 == 0 {
            Self::Public
        } else {
            Self::Random
        }
    }
}

/// A Bluetooth device address with its type
///
/// `bytes` are stored in wire (little-endian) order; `Display` and
/// `FromStr` use the conventional most-significant-first notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Address {
    pub bytes: [u8; 6],
    pub kind: AddressType,
}

impl Address {
    pub fn new(bytes: [u8; 6], kind: AddressType) -> Self {
        Self { bytes, kind }
    }

    pub fn public(bytes: [u8; 6]) -> Self {
        Self::new(bytes, AddressType::Public)
    }

    pub fn random(bytes: [u8; 6]) -> Self {
        Self::new(bytes, AddressType::Random)
    }

    /// Address followed by its type, the 56-bit form used by f5 and f6
    pub fn to_smp_bytes(&self) -> [u8; 7] {
        let mut out = [0u8; 7];
        out[..6].copy_from_slice(&self.bytes);
        out[6] = self.kind.to_u8();
        out
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.bytes;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[5], b[4], b[3], b[2], b[1], b[0]
        )
    }
}

/// Error parsing an address string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid Bluetooth address: {0}")]
pub struct AddressParseError(String);

impl FromStr for Address {
    type Err = AddressParseError;

    /// Parses `AA:BB:CC:DD:EE:FF` as a public address
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cleaned: String = s.chars().filter(|c| *c != ':' && *c != '-').collect();
        let mut be = [0u8; 6];
        hex::decode_to_slice(&cleaned, &mut be).map_err(|_| AddressParseError(s.to_string()))?;
        be.reverse();
        Ok(Self::public(be))
    }
}
