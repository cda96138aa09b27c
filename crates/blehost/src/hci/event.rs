//! Typed views over the HCI events the host acts on
//!
//! Each parser takes the event parameters (after the two-byte event header)
//! and returns `None` when the payload is shorter than the fixed layout.

use crate::hci::constants::*;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};

/// Command Complete event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandComplete {
    /// Number of commands the controller will accept from now on
    pub num_hci_command_packets: u8,
    pub opcode: u16,
    /// Return parameters, status byte first
    pub return_parameters: Vec<u8>,
}

impl CommandComplete {
    pub fn parse(params: &[u8]) -> Option<Self> {
        let mut cursor = Cursor::new(params);
        let num_hci_command_packets = cursor.read_u8().ok()?;
        let opcode = cursor.read_u16::<LittleEndian>().ok()?;
        Some(Self {
            num_hci_command_packets,
            opcode,
            return_parameters: params[3..].to_vec(),
        })
    }

    /// Status of the command, if the return parameters carry one
    pub fn status(&self) -> u8 {
        self.return_parameters.first().copied().unwrap_or(HCI_SUCCESS)
    }
}

/// Command Status event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandStatus {
    pub status: u8,
    pub num_hci_command_packets: u8,
    pub opcode: u16,
}

impl CommandStatus {
    pub fn parse(params: &[u8]) -> Option<Self> {
        let mut cursor = Cursor::new(params);
        Some(Self {
            status: cursor.read_u8().ok()?,
            num_hci_command_packets: cursor.read_u8().ok()?,
            opcode: cursor.read_u16::<LittleEndian>().ok()?,
        })
    }
}

/// Disconnection Complete event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectionComplete {
    pub status: u8,
    pub handle: u16,
    pub reason: u8,
}

impl DisconnectionComplete {
    pub fn parse(params: &[u8]) -> Option<Self> {
        let mut cursor = Cursor::new(params);
        Some(Self {
            status: cursor.read_u8().ok()?,
            handle: cursor.read_u16::<LittleEndian>().ok()? & ACL_HANDLE_MASK,
            reason: cursor.read_u8().ok()?,
        })
    }
}

/// Encryption Change event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptionChange {
    pub status: u8,
    pub handle: u16,
    pub enabled: bool,
}

impl EncryptionChange {
    pub fn parse(params: &[u8]) -> Option<Self> {
        let mut cursor = Cursor::new(params);
        Some(Self {
            status: cursor.read_u8().ok()?,
            handle: cursor.read_u16::<LittleEndian>().ok()? & ACL_HANDLE_MASK,
            enabled: cursor.read_u8().ok()? != 0,
        })
    }
}

/// Encryption Key Refresh Complete event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptionKeyRefresh {
    pub status: u8,
    pub handle: u16,
}

impl EncryptionKeyRefresh {
    pub fn parse(params: &[u8]) -> Option<Self> {
        let mut cursor = Cursor::new(params);
        Some(Self {
            status: cursor.read_u8().ok()?,
            handle: cursor.read_u16::<LittleEndian>().ok()? & ACL_HANDLE_MASK,
        })
    }
}

/// Number Of Completed Packets event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumberOfCompletedPackets {
    /// (connection handle, completed packet count) pairs
    pub completed: Vec<(u16, u16)>,
}

impl NumberOfCompletedPackets {
    pub fn parse(params: &[u8]) -> Option<Self> {
        let mut cursor = Cursor::new(params);
        let num_handles = cursor.read_u8().ok()? as usize;
        if params.len() < 1 + num_handles * 4 {
            return None;
        }
        let mut completed = Vec::with_capacity(num_handles);
        for _ in 0..num_handles {
            let handle = cursor.read_u16::<LittleEndian>().ok()? & ACL_HANDLE_MASK;
            let count = cursor.read_u16::<LittleEndian>().ok()?;
            completed.push((handle, count));
        }
        Some(Self { completed })
    }
}

/// LE Connection Complete (and Enhanced Connection Complete) event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeConnectionComplete {
    pub status: u8,
    pub handle: u16,
    /// 0x00 = central, 0x01 = peripheral
    pub role: u8,
    pub peer_address_type: u8,
    pub peer_address: [u8; 6],
    pub conn_interval: u16,
    pub conn_latency: u16,
    pub supervision_timeout: u16,
    pub central_clock_accuracy: u8,
}

impl LeConnectionComplete {
    /// Parse from LE Meta parameters, sub-event code included
    pub fn parse(params: &[u8]) -> Option<Self> {
        let subevent = *params.first()?;
        let mut cursor = Cursor::new(&params[1..]);
        let status = cursor.read_u8().ok()?;
        let handle = cursor.read_u16::<LittleEndian>().ok()? & ACL_HANDLE_MASK;
        let role = cursor.read_u8().ok()?;
        let peer_address_type = cursor.read_u8().ok()?;
        let mut peer_address = [0u8; 6];
        cursor.read_exact(&mut peer_address).ok()?;
        if subevent == EVT_LE_ENHANCED_CONN_COMPLETE {
            // Local and peer resolvable private addresses
            let mut rpa = [0u8; 12];
            cursor.read_exact(&mut rpa).ok()?;
        }
        Some(Self {
            status,
            handle,
            role,
            peer_address_type,
            peer_address,
            conn_interval: cursor.read_u16::<LittleEndian>().ok()?,
            conn_latency: cursor.read_u16::<LittleEndian>().ok()?,
            supervision_timeout: cursor.read_u16::<LittleEndian>().ok()?,
            central_clock_accuracy: cursor.read_u8().ok()?,
        })
    }
}

/// LE Connection Update Complete event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeConnectionUpdateComplete {
    pub status: u8,
    pub handle: u16,
    pub conn_interval: u16,
    pub conn_latency: u16,
    pub supervision_timeout: u16,
}

impl LeConnectionUpdateComplete {
    pub fn parse(params: &[u8]) -> Option<Self> {
        let mut cursor = Cursor::new(params.get(1..)?);
        Some(Self {
            status: cursor.read_u8().ok()?,
            handle: cursor.read_u16::<LittleEndian>().ok()? & ACL_HANDLE_MASK,
            conn_interval: cursor.read_u16::<LittleEndian>().ok()?,
            conn_latency: cursor.read_u16::<LittleEndian>().ok()?,
            supervision_timeout: cursor.read_u16::<LittleEndian>().ok()?,
        })
    }
}

/// LE Long Term Key Request event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeLongTermKeyRequest {
    pub handle: u16,
    pub rand: [u8; 8],
    pub ediv: u16,
}

impl LeLongTermKeyRequest {
    pub fn parse(params: &[u8]) -> Option<Self> {
        let mut cursor = Cursor::new(params.get(1..)?);
        let handle = cursor.read_u16::<LittleEndian>().ok()? & ACL_HANDLE_MASK;
        let mut rand = [0u8; 8];
        cursor.read_exact(&mut rand).ok()?;
        let ediv = cursor.read_u16::<LittleEndian>().ok()?;
        Some(Self { handle, rand, ediv })
    }
}

/// A single report from an LE Advertising Report event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeAdvertisingReport {
    pub event_type: u8,
    pub address_type: u8,
    pub address: [u8; 6],
    /// Raw advertising payload; field decoding is left to the caller
    pub data: Vec<u8>,
    pub rssi: i8,
}

impl LeAdvertisingReport {
    /// Parse every report carried by an LE Advertising Report event
    ///
    /// The parameters include the sub-event code. Returns `None` if any
    /// report is truncated.
    pub fn parse_all(params: &[u8]) -> Option<Vec<Self>> {
        if params.first() != Some(&EVT_LE_ADVERTISING_REPORT) {
            return None;
        }
        let mut cursor = Cursor::new(&params[1..]);
        let num_reports = cursor.read_u8().ok()? as usize;
        let mut reports = Vec::with_capacity(num_reports);
        for _ in 0..num_reports {
            let event_type = cursor.read_u8().ok()?;
            let address_type = cursor.read_u8().ok()?;
            let mut address = [0u8; 6];
            cursor.read_exact(&mut address).ok()?;
            let data_length = cursor.read_u8().ok()? as usize;
            let mut data = vec![0u8; data_length];
            cursor.read_exact(&mut data).ok()?;
            let rssi = cursor.read_i8().ok()?;
            reports.push(Self {
                event_type,
                address_type,
                address,
                data,
                rssi,
            });
        }
        Some(reports)
    }
}
