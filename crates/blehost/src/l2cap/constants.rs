//! L2CAP protocol constants for LE links

// Header sizes
pub const L2CAP_BASIC_HEADER_SIZE: usize = 4;
pub const L2CAP_SIG_HEADER_SIZE: usize = 4;
/// SDU length prefix carried by the first K-frame of an SDU
pub const L2CAP_SDU_LENGTH_SIZE: usize = 2;

// Fixed channel identifiers on an LE-U link
pub const L2CAP_ATT_CID: u16 = 0x0004;
pub const L2CAP_LE_SIGNALING_CID: u16 = 0x0005;
pub const L2CAP_SMP_CID: u16 = 0x0006;

// Dynamically allocated channel identifiers on an LE-U link
pub const L2CAP_LE_DYN_CID_START: u16 = 0x0040;
pub const L2CAP_LE_DYN_CID_END: u16 = 0x007F;

// ATT default MTU, also the minimum
pub const L2CAP_LE_DEFAULT_MTU: u16 = 23;

// LE signaling command codes
pub const L2CAP_COMMAND_REJECT: u8 = 0x01;
pub const L2CAP_DISCONNECTION_REQUEST: u8 = 0x06;
pub const L2CAP_DISCONNECTION_RESPONSE: u8 = 0x07;
pub const L2CAP_CONNECTION_PARAMETER_UPDATE_REQUEST: u8 = 0x12;
pub const L2CAP_CONNECTION_PARAMETER_UPDATE_RESPONSE: u8 = 0x13;
pub const L2CAP_LE_CREDIT_BASED_CONNECTION_REQUEST: u8 = 0x14;
pub const L2CAP_LE_CREDIT_BASED_CONNECTION_RESPONSE: u8 = 0x15;
pub const L2CAP_LE_FLOW_CONTROL_CREDIT: u8 = 0x16;

// Command Reject reasons
pub const L2CAP_REJECT_NOT_UNDERSTOOD: u16 = 0x0000;
pub const L2CAP_REJECT_INVALID_CID: u16 = 0x0002;

// Connection Parameter Update results
pub const L2CAP_CONN_PARAM_ACCEPTED: u16 = 0x0000;
pub const L2CAP_CONN_PARAM_REJECTED: u16 = 0x0001;

// LE Credit Based Connection results
pub const L2CAP_LE_CONN_SUCCESSFUL: u16 = 0x0000;
pub const L2CAP_LE_CONN_PSM_NOT_SUPPORTED: u16 = 0x0002;

// Connection parameter limits (Core Vol 6 Part B 4.5.1)
pub const L2CAP_LE_CONN_INTERVAL_MIN: u16 = 0x0006;
pub const L2CAP_LE_CONN_INTERVAL_MAX: u16 = 0x0C80;
pub const L2CAP_LE_CONN_LATENCY_MAX: u16 = 0x01F3;
pub const L2CAP_LE_SUPERVISION_TIMEOUT_MIN: u16 = 0x000A;
pub const L2CAP_LE_SUPERVISION_TIMEOUT_MAX: u16 = 0x0C80;

// LE credit based channel limits
pub const L2CAP_LE_COC_MIN_MTU: u16 = 23;
pub const L2CAP_LE_COC_MIN_MPS: u16 = 23;
pub const L2CAP_LE_COC_MAX_MPS: u16 = 65533;
pub const L2CAP_LE_COC_DEFAULT_MTU: u16 = 512;
pub const L2CAP_LE_COC_DEFAULT_MPS: u16 = 247;
pub const L2CAP_LE_COC_DEFAULT_CREDITS: u16 = 10;
