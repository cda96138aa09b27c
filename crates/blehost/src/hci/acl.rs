//! ACL data packet framing

use crate::hci::constants::*;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// Packet boundary flag of an ACL fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryFlag {
    /// First fragment of a non-flushable PDU (host to controller)
    FirstNonFlushable,
    /// Continuing fragment
    Continuing,
    /// First fragment of an automatically flushable PDU
    FirstFlushable,
    /// Complete automatically flushable PDU
    Complete,
}

impl BoundaryFlag {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            ACL_PB_FIRST_NON_FLUSHABLE => Self::FirstNonFlushable,
            ACL_PB_CONTINUING => Self::Continuing,
            ACL_PB_FIRST_FLUSHABLE => Self::FirstFlushable,
            _ => Self::Complete,
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            Self::FirstNonFlushable => ACL_PB_FIRST_NON_FLUSHABLE,
            Self::Continuing => ACL_PB_CONTINUING,
            Self::FirstFlushable => ACL_PB_FIRST_FLUSHABLE,
            Self::Complete => ACL_PB_COMPLETE,
        }
    }

    /// Whether this fragment starts a new L2CAP PDU
    pub fn is_start(self) -> bool {
        self != Self::Continuing
    }
}

/// ACL data header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AclHeader {
    /// 12-bit connection handle
    pub handle: u16,
    pub boundary: BoundaryFlag,
    /// 2-bit broadcast flag
    pub broadcast: u8,
    /// Length of the data that follows
    pub length: u16,
}

impl AclHeader {
    pub fn new(handle: u16, boundary: BoundaryFlag, length: u16) -> Self {
        Self {
            handle: handle & ACL_HANDLE_MASK,
            boundary,
            broadcast: 0,
            length,
        }
    }

    /// Parse an ACL header from raw bytes (without the packet type byte)
    pub fn parse(data: &[u8]) -> Option<Self> {
        let mut cursor = Cursor::new(data);
        let word = cursor.read_u16::<LittleEndian>().ok()?;
        let length = cursor.read_u16::<LittleEndian>().ok()?;
        Some(Self {
            handle: word & ACL_HANDLE_MASK,
            boundary: BoundaryFlag::from_bits((word >> 12) as u8),
            broadcast: ((word >> 14) & 0x03) as u8,
            length,
        })
    }

    pub fn to_bytes(&self) -> [u8; HCI_ACL_HDR_SIZE] {
        let word = (self.handle & ACL_HANDLE_MASK)
            | ((self.boundary.bits() as u16) << 12)
            | (((self.broadcast & 0x03) as u16) << 14);
        let mut bytes = [0u8; HCI_ACL_HDR_SIZE];
        bytes[0..2].copy_from_slice(&word.to_le_bytes());
        bytes[2..4].copy_from_slice(&self.length.to_le_bytes());
        bytes
    }
}

/// An inbound or outbound ACL data packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclPacket {
    pub header: AclHeader,
    pub data: Vec<u8>,
}

impl AclPacket {
    /// Parse an ACL packet (without the packet type byte)
    ///
    /// The declared length must match the bytes present.
    pub fn parse(data: &[u8]) -> Option<Self> {
        let header = AclHeader::parse(data)?;
        let payload = data.get(HCI_ACL_HDR_SIZE..)?;
        if payload.len() != header.length as usize {
            return None;
        }
        Some(Self {
            header,
            data: payload.to_vec(),
        })
    }

    /// Serialize the packet, including the packet type byte
    pub fn to_packet(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(1 + HCI_ACL_HDR_SIZE + self.data.len());
        packet.push(HCI_ACL_PKT);
        packet.extend_from_slice(&self.header.to_bytes());
        packet.extend_from_slice(&self.data);
        packet
    }
}
