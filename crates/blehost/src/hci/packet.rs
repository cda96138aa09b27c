//! HCI packet structures and parsing
//!
//! This module contains structures and methods for handling HCI command
//! and event packets.

use crate::hci::constants::*;

/// Parameters for LE Set Advertising Parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvertisingParameters {
    /// Minimum advertising interval (0.625 ms units)
    pub interval_min: u16,
    /// Maximum advertising interval (0.625 ms units)
    pub interval_max: u16,
    /// Advertising type (0x00 = ADV_IND)
    pub advertising_type: u8,
    pub own_address_type: u8,
    pub peer_address_type: u8,
    pub peer_address: [u8; 6],
    /// Channel map (bit 0..2 = channels 37, 38, 39)
    pub channel_map: u8,
    pub filter_policy: u8,
}

impl Default for AdvertisingParameters {
    fn default() -> Self {
        Self {
            interval_min: 0x0020,
            interval_max: 0x0020,
            advertising_type: 0x00,
            own_address_type: 0x00,
            peer_address_type: 0x00,
            peer_address: [0; 6],
            channel_map: 0x07,
            filter_policy: 0x00,
        }
    }
}

/// Parameters for LE Set Scan Parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanParameters {
    /// 0 = passive, 1 = active
    pub scan_type: u8,
    /// Scan interval (0.625 ms units)
    pub scan_interval: u16,
    /// Scan window (0.625 ms units)
    pub scan_window: u16,
    pub own_address_type: u8,
    pub filter_policy: u8,
    /// Ask the controller to drop duplicate reports
    pub filter_duplicates: bool,
}

impl Default for ScanParameters {
    fn default() -> Self {
        Self {
            scan_type: 0x01,
            scan_interval: 0x0010,
            scan_window: 0x0010,
            own_address_type: 0x00,
            filter_policy: 0x00,
            filter_duplicates: true,
        }
    }
}

/// Parameters for LE Create Connection and LE Connection Update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionParameters {
    pub scan_interval: u16,
    pub scan_window: u16,
    /// Minimum connection interval (1.25 ms units)
    pub conn_interval_min: u16,
    /// Maximum connection interval (1.25 ms units)
    pub conn_interval_max: u16,
    pub conn_latency: u16,
    /// Supervision timeout (10 ms units)
    pub supervision_timeout: u16,
    pub min_ce_length: u16,
    pub max_ce_length: u16,
}

impl Default for ConnectionParameters {
    fn default() -> Self {
        Self {
            scan_interval: 0x0060,
            scan_window: 0x0060,
            conn_interval_min: 0x0018,
            conn_interval_max: 0x0028,
            conn_latency: 0x0000,
            supervision_timeout: 0x01F4,
            min_ce_length: 0x0000,
            max_ce_length: 0x0000,
        }
    }
}

/// Common HCI Commands
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum HciCommand {
    // Link Control Commands (OGF: 0x01)
    Disconnect { handle: u16, reason: u8 },

    // Host Controller Commands (OGF: 0x03)
    Reset,
    SetEventMask { event_mask: u64 },

    // Informational Parameters (OGF: 0x04)
    ReadBufferSize,
    ReadBdAddr,

    // LE Commands (OGF: 0x08)
    LeSetEventMask { event_mask: u64 },
    LeReadBufferSize,
    LeSetRandomAddress { address: [u8; 6] },
    LeSetAdvertisingParameters(AdvertisingParameters),
    LeSetAdvertisingData { data: Vec<u8> },
    LeSetScanResponseData { data: Vec<u8> },
    LeSetAdvertisingEnable { enable: bool },
    LeSetScanParameters {
        scan_type: u8,
        scan_interval: u16,
        scan_window: u16,
        own_address_type: u8,
        filter_policy: u8,
    },
    LeSetScanEnable { enable: bool, filter_duplicates: bool },
    LeCreateConnection {
        peer_addr: [u8; 6],
        peer_addr_type: u8,
        own_addr_type: u8,
        params: ConnectionParameters,
    },
    LeCreateConnectionCancel,
    LeConnectionUpdate {
        handle: u16,
        params: ConnectionParameters,
    },
    LeStartEncryption {
        handle: u16,
        rand: [u8; 8],
        ediv: u16,
        ltk: [u8; 16],
    },
    LeLongTermKeyRequestReply { handle: u16, ltk: [u8; 16] },
    LeLongTermKeyRequestNegativeReply { handle: u16 },

    /// Any command not modelled above
    Raw { ogf: u8, ocf: u16, params: Vec<u8> },
}

impl HciCommand {
    /// Create a raw command from its group, command field and parameters
    pub fn new(ogf: u8, ocf: u16, params: Vec<u8>) -> Self {
        Self::Raw { ogf, ocf, params }
    }

    /// Get the OGF and OCF for this command
    pub fn opcode_parts(&self) -> (u8, u16) {
        match self {
            Self::Disconnect { .. } => (OGF_LINK_CTL, OCF_DISCONNECT),

            Self::Reset => (OGF_HOST_CTL, OCF_RESET),
            Self::SetEventMask { .. } => (OGF_HOST_CTL, OCF_SET_EVENT_MASK),

            Self::ReadBufferSize => (OGF_INFO_PARAM, OCF_READ_BUFFER_SIZE),
            Self::ReadBdAddr => (OGF_INFO_PARAM, OCF_READ_BD_ADDR),

            Self::LeSetEventMask { .. } => (OGF_LE, OCF_LE_SET_EVENT_MASK),
            Self::LeReadBufferSize => (OGF_LE, OCF_LE_READ_BUFFER_SIZE),
            Self::LeSetRandomAddress { .. } => (OGF_LE, OCF_LE_SET_RANDOM_ADDRESS),
            Self::LeSetAdvertisingParameters(_) => (OGF_LE, OCF_LE_SET_ADVERTISING_PARAMETERS),
            Self::LeSetAdvertisingData { .. } => (OGF_LE, OCF_LE_SET_ADVERTISING_DATA),
            Self::LeSetScanResponseData { .. } => (OGF_LE, OCF_LE_SET_SCAN_RESPONSE_DATA),
            Self::LeSetAdvertisingEnable { .. } => (OGF_LE, OCF_LE_SET_ADVERTISING_ENABLE),
            Self::LeSetScanParameters { .. } => (OGF_LE, OCF_LE_SET_SCAN_PARAMETERS),
            Self::LeSetScanEnable { .. } => (OGF_LE, OCF_LE_SET_SCAN_ENABLE),
            Self::LeCreateConnection { .. } => (OGF_LE, OCF_LE_CREATE_CONNECTION),
            Self::LeCreateConnectionCancel => (OGF_LE, OCF_LE_CREATE_CONNECTION_CANCEL),
            Self::LeConnectionUpdate { .. } => (OGF_LE, OCF_LE_CONNECTION_UPDATE),
            Self::LeStartEncryption { .. } => (OGF_LE, OCF_LE_START_ENCRYPTION),
            Self::LeLongTermKeyRequestReply { .. } => (OGF_LE, OCF_LE_LTK_REQUEST_REPLY),
            Self::LeLongTermKeyRequestNegativeReply { .. } => {
                (OGF_LE, OCF_LE_LTK_REQUEST_NEGATIVE_REPLY)
            }

            Self::Raw { ogf, ocf, .. } => (*ogf, *ocf),
        }
    }

    /// The 16-bit opcode carried on the wire
    pub fn opcode(&self) -> u16 {
        let (ogf, ocf) = self.opcode_parts();
        opcode(ogf, ocf)
    }

    /// Convert the command to its raw parameter bytes
    fn parameters(&self) -> Vec<u8> {
        match self {
            Self::Reset
            | Self::ReadBufferSize
            | Self::ReadBdAddr
            | Self::LeReadBufferSize
            | Self::LeCreateConnectionCancel => vec![],

            Self::Disconnect { handle, reason } => {
                let mut params = Vec::with_capacity(3);
                params.extend_from_slice(&handle.to_le_bytes());
                params.push(*reason);
                params
            }

            Self::SetEventMask { event_mask } | Self::LeSetEventMask { event_mask } => {
                event_mask.to_le_bytes().to_vec()
            }

            Self::LeSetRandomAddress { address } => address.to_vec(),

            Self::LeSetAdvertisingParameters(p) => {
                let mut params = Vec::with_capacity(15);
                params.extend_from_slice(&p.interval_min.to_le_bytes());
                params.extend_from_slice(&p.interval_max.to_le_bytes());
                params.push(p.advertising_type);
                params.push(p.own_address_type);
                params.push(p.peer_address_type);
                params.extend_from_slice(&p.peer_address);
                params.push(p.channel_map);
                params.push(p.filter_policy);
                params
            }

            // Advertising and scan response payloads are always 31 bytes on the wire
            Self::LeSetAdvertisingData { data } | Self::LeSetScanResponseData { data } => {
                let len = data.len().min(31);
                let mut params = Vec::with_capacity(32);
                params.push(len as u8);
                params.extend_from_slice(&data[..len]);
                params.resize(32, 0);
                params
            }

            Self::LeSetAdvertisingEnable { enable } => vec![*enable as u8],

            Self::LeSetScanParameters {
                scan_type,
                scan_interval,
                scan_window,
                own_address_type,
                filter_policy,
            } => {
                let mut params = Vec::with_capacity(7);
                params.push(*scan_type);
                params.extend_from_slice(&scan_interval.to_le_bytes());
                params.extend_from_slice(&scan_window.to_le_bytes());
                params.push(*own_address_type);
                params.push(*filter_policy);
                params
            }

            Self::LeSetScanEnable { enable, filter_duplicates } => {
                vec![*enable as u8, *filter_duplicates as u8]
            }

            Self::LeCreateConnection {
                peer_addr,
                peer_addr_type,
                own_addr_type,
                params: p,
            } => {
                let mut params = Vec::with_capacity(25);
                params.extend_from_slice(&p.scan_interval.to_le_bytes());
                params.extend_from_slice(&p.scan_window.to_le_bytes());
                params.push(0x00); // Initiator filter policy: use peer address
                params.push(*peer_addr_type);
                params.extend_from_slice(peer_addr);
                params.push(*own_addr_type);
                params.extend_from_slice(&p.conn_interval_min.to_le_bytes());
                params.extend_from_slice(&p.conn_interval_max.to_le_bytes());
                params.extend_from_slice(&p.conn_latency.to_le_bytes());
                params.extend_from_slice(&p.supervision_timeout.to_le_bytes());
                params.extend_from_slice(&p.min_ce_length.to_le_bytes());
                params.extend_from_slice(&p.max_ce_length.to_le_bytes());
                params
            }

            Self::LeConnectionUpdate { handle, params: p } => {
                let mut params = Vec::with_capacity(14);
                params.extend_from_slice(&handle.to_le_bytes());
                params.extend_from_slice(&p.conn_interval_min.to_le_bytes());
                params.extend_from_slice(&p.conn_interval_max.to_le_bytes());
                params.extend_from_slice(&p.conn_latency.to_le_bytes());
                params.extend_from_slice(&p.supervision_timeout.to_le_bytes());
                params.extend_from_slice(&p.min_ce_length.to_le_bytes());
                params.extend_from_slice(&p.max_ce_length.to_le_bytes());
                params
            }

            Self::LeStartEncryption { handle, rand, ediv, ltk } => {
                let mut params = Vec::with_capacity(28);
                params.extend_from_slice(&handle.to_le_bytes());
                params.extend_from_slice(rand);
                params.extend_from_slice(&ediv.to_le_bytes());
                params.extend_from_slice(ltk);
                params
            }

            Self::LeLongTermKeyRequestReply { handle, ltk } => {
                let mut params = Vec::with_capacity(18);
                params.extend_from_slice(&handle.to_le_bytes());
                params.extend_from_slice(ltk);
                params
            }

            Self::LeLongTermKeyRequestNegativeReply { handle } => handle.to_le_bytes().to_vec(),

            Self::Raw { params, .. } => params.clone(),
        }
    }

    /// Convert the command to a raw HCI packet
    pub fn to_packet(&self) -> Vec<u8> {
        let params = self.parameters();

        let mut packet = Vec::with_capacity(1 + HCI_COMMAND_HDR_SIZE + params.len());
        packet.push(HCI_COMMAND_PKT);
        packet.extend_from_slice(&self.opcode().to_le_bytes());
        packet.push(params.len().min(HCI_MAX_PARAM_LEN) as u8);
        packet.extend_from_slice(&params[..params.len().min(HCI_MAX_PARAM_LEN)]);
        packet
    }
}

/// HCI Event packet
#[derive(Debug, Clone)]
pub struct HciEvent {
    pub event_code: u8,
    pub parameter_total_length: u8,
    pub parameters: Vec<u8>,
}

impl HciEvent {
    /// Parse an HCI event from raw bytes (without the packet type byte)
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HCI_EVENT_HDR_SIZE {
            return None;
        }

        let event_code = data[0];
        let parameter_total_length = data[1];

        if data.len() < (parameter_total_length as usize + HCI_EVENT_HDR_SIZE) {
            return None;
        }

        let parameters =
            data[HCI_EVENT_HDR_SIZE..(parameter_total_length as usize + HCI_EVENT_HDR_SIZE)].to_vec();

        Some(HciEvent {
            event_code,
            parameter_total_length,
            parameters,
        })
    }

    /// Serialize the event, including the packet type byte
    pub fn to_packet(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(1 + HCI_EVENT_HDR_SIZE + self.parameters.len());
        packet.push(HCI_EVENT_PKT);
        packet.push(self.event_code);
        packet.push(self.parameters.len() as u8);
        packet.extend_from_slice(&self.parameters);
        packet
    }

    /// Build an event from its code and parameters
    pub fn new(event_code: u8, parameters: Vec<u8>) -> Self {
        Self {
            event_code,
            parameter_total_length: parameters.len() as u8,
            parameters,
        }
    }

    /// Check whether this is a Command Complete for the given command
    pub fn is_command_complete(&self, ogf: u8, ocf: u16) -> bool {
        self.event_code == EVT_CMD_COMPLETE
            && self.parameters.len() >= 3
            && u16::from_le_bytes([self.parameters[1], self.parameters[2]]) == opcode(ogf, ocf)
    }

    /// LE Meta sub-event code, if this is an LE Meta event
    pub fn subevent_code(&self) -> Option<u8> {
        if self.event_code == EVT_LE_META_EVENT {
            self.parameters.first().copied()
        } else {
            None
        }
    }
}
