//! HCI protocol constants
//!
//! This module contains constants used in the Bluetooth HCI protocol.

// HCI packet types
pub const HCI_COMMAND_PKT: u8 = 0x01;
pub const HCI_ACL_PKT: u8 = 0x02;
pub const HCI_SCO_PKT: u8 = 0x03;
pub const HCI_EVENT_PKT: u8 = 0x04;
pub const HCI_ISO_PKT: u8 = 0x05;

// Header sizes (excluding the packet type byte)
pub const HCI_COMMAND_HDR_SIZE: usize = 3;
pub const HCI_ACL_HDR_SIZE: usize = 4;
pub const HCI_SCO_HDR_SIZE: usize = 3;
pub const HCI_EVENT_HDR_SIZE: usize = 2;
pub const HCI_ISO_HDR_SIZE: usize = 4;

// Maximum size of HCI command parameters
pub const HCI_MAX_PARAM_LEN: usize = 255;

// Common OGF (Opcode Group Field) values
pub const OGF_LINK_CTL: u8 = 0x01;
pub const OGF_HOST_CTL: u8 = 0x03;
pub const OGF_INFO_PARAM: u8 = 0x04;
pub const OGF_LE: u8 = 0x08;
pub const OGF_VENDOR: u8 = 0x3F;

// Link Control Commands (OGF: 0x01)
pub const OCF_DISCONNECT: u16 = 0x0006;

// Host Controller Commands (OGF: 0x03)
pub const OCF_SET_EVENT_MASK: u16 = 0x0001;
pub const OCF_RESET: u16 = 0x0003;

// Informational Parameters (OGF: 0x04)
pub const OCF_READ_BUFFER_SIZE: u16 = 0x0005;
pub const OCF_READ_BD_ADDR: u16 = 0x0009;

// LE Command OCF values (OGF: 0x08)
pub const OCF_LE_SET_EVENT_MASK: u16 = 0x0001;
pub const OCF_LE_READ_BUFFER_SIZE: u16 = 0x0002;
pub const OCF_LE_SET_RANDOM_ADDRESS: u16 = 0x0005;
pub const OCF_LE_SET_ADVERTISING_PARAMETERS: u16 = 0x0006;
pub const OCF_LE_SET_ADVERTISING_DATA: u16 = 0x0008;
pub const OCF_LE_SET_SCAN_RESPONSE_DATA: u16 = 0x0009;
pub const OCF_LE_SET_ADVERTISING_ENABLE: u16 = 0x000A;
pub const OCF_LE_SET_SCAN_PARAMETERS: u16 = 0x000B;
pub const OCF_LE_SET_SCAN_ENABLE: u16 = 0x000C;
pub const OCF_LE_CREATE_CONNECTION: u16 = 0x000D;
pub const OCF_LE_CREATE_CONNECTION_CANCEL: u16 = 0x000E;
pub const OCF_LE_CONNECTION_UPDATE: u16 = 0x0013;
pub const OCF_LE_START_ENCRYPTION: u16 = 0x0019;
pub const OCF_LE_LTK_REQUEST_REPLY: u16 = 0x001A;
pub const OCF_LE_LTK_REQUEST_NEGATIVE_REPLY: u16 = 0x001B;

// HCI Events
pub const EVT_DISCONN_COMPLETE: u8 = 0x05;
pub const EVT_ENCRYPTION_CHANGE: u8 = 0x08;
pub const EVT_CMD_COMPLETE: u8 = 0x0E;
pub const EVT_CMD_STATUS: u8 = 0x0F;
pub const EVT_HARDWARE_ERROR: u8 = 0x10;
pub const EVT_NUM_COMP_PKTS: u8 = 0x13;
pub const EVT_DATA_BUFFER_OVERFLOW: u8 = 0x1A;
pub const EVT_ENCRYPTION_KEY_REFRESH: u8 = 0x30;
pub const EVT_LE_META_EVENT: u8 = 0x3E;
pub const EVT_VENDOR: u8 = 0xFF;

// LE Meta Events
pub const EVT_LE_CONN_COMPLETE: u8 = 0x01;
pub const EVT_LE_ADVERTISING_REPORT: u8 = 0x02;
pub const EVT_LE_CONN_UPDATE_COMPLETE: u8 = 0x03;
pub const EVT_LE_LTK_REQUEST: u8 = 0x05;
pub const EVT_LE_ENHANCED_CONN_COMPLETE: u8 = 0x0A;

// Event masks enabled at start-up
pub const DEFAULT_EVENT_MASK: u64 = 0x3DBF_F807_FFFB_FFFF;
pub const DEFAULT_LE_EVENT_MASK: u64 = 0x0000_0000_0000_021F;

// ACL packet boundary flags
pub const ACL_PB_FIRST_NON_FLUSHABLE: u8 = 0x00;
pub const ACL_PB_CONTINUING: u8 = 0x01;
pub const ACL_PB_FIRST_FLUSHABLE: u8 = 0x02;
pub const ACL_PB_COMPLETE: u8 = 0x03;

// Connection handles are 12 bits wide
pub const ACL_HANDLE_MASK: u16 = 0x0FFF;

// Status codes used by the host
pub const HCI_SUCCESS: u8 = 0x00;
pub const HCI_UNKNOWN_CONNECTION_ID: u8 = 0x02;
pub const HCI_REMOTE_USER_TERMINATED: u8 = 0x13;
pub const HCI_LOCAL_HOST_TERMINATED: u8 = 0x16;

// Connection roles reported in LE Connection Complete
pub const ROLE_CENTRAL: u8 = 0x00;
pub const ROLE_PERIPHERAL: u8 = 0x01;

/// Build a command opcode from its group and command fields
pub const fn opcode(ogf: u8, ocf: u16) -> u16 {
    ((ogf as u16) << 10) | (ocf & 0x03FF)
}

pub const OP_RESET: u16 = opcode(OGF_HOST_CTL, OCF_RESET);
pub const OP_LE_CREATE_CONNECTION: u16 = opcode(OGF_LE, OCF_LE_CREATE_CONNECTION);
pub const OP_LE_START_ENCRYPTION: u16 = opcode(OGF_LE, OCF_LE_START_ENCRYPTION);
pub const OP_DISCONNECT: u16 = opcode(OGF_LINK_CTL, OCF_DISCONNECT);
