//! Error types for the blehost library
//!
//! `HciError` covers the transport and the command engine. Connection,
//! L2CAP and SMP errors live next to their modules and are folded into
//! the crate-level [`Error`].

use crate::l2cap::L2capError;
use crate::smp::SmpError;
use thiserror::Error;

/// Errors raised by the transport and the HCI command engine
#[derive(Error, Debug)]
pub enum HciError {
    #[error("hci: failed to open socket: {0}")]
    SocketError(#[from] std::io::Error),

    #[error("hci: failed to bind to device: {0}")]
    BindError(std::io::Error),

    #[error("hci: failed to send packet: {0}")]
    SendError(std::io::Error),

    #[error("hci: failed to receive packet: {0}")]
    ReceiveError(std::io::Error),

    #[error("hci: transport reached end of stream")]
    Eof,

    #[error("hci: invalid parameter length: {0}")]
    InvalidParamLength(usize),

    #[error("hci: invalid packet format")]
    InvalidPacketFormat,

    #[error("hci: unknown packet type 0x{0:02x}")]
    UnknownPacketType(u8),

    #[error("hci: command 0x{opcode:04x} failed with status 0x{status:02x}")]
    CommandFailed { opcode: u16, status: u8 },

    #[error("hci: command 0x{opcode:04x} timed out")]
    CommandTimeout { opcode: u16 },

    #[error("hci: no command credit for 0x{opcode:04x}")]
    CreditTimeout { opcode: u16 },

    #[error("hci: command 0x{opcode:04x} is already in flight")]
    OpcodeBusy { opcode: u16 },

    #[error("hci: session closed")]
    Closed,

    #[error("hci: unsupported operation")]
    Unsupported,
}

impl HciError {
    /// Whether the error means the transport itself is gone
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::SocketError(_)
                | Self::SendError(_)
                | Self::ReceiveError(_)
                | Self::Eof
                | Self::CommandTimeout { .. }
        )
    }
}

/// Crate-level error
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Hci(#[from] HciError),

    #[error(transparent)]
    L2cap(#[from] L2capError),

    #[error(transparent)]
    Smp(#[from] SmpError),

    #[error("session: closed")]
    Closed,

    #[error("session: {op} timed out")]
    Timeout { op: &'static str },

    #[error("session: no connection established before the dial deadline")]
    DialTimeout,

    #[error("session: {0} already in progress")]
    Busy(&'static str),

    #[error("session: connection 0x{0:04x} not found")]
    ConnectionNotFound(u16),

    #[error("session: malformed event 0x{code:02x}")]
    MalformedEvent { code: u8 },

    #[error("session: vendor event ({} bytes)", .0.len())]
    VendorEvent(Vec<u8>),

    #[error("session: controller hardware error 0x{0:02x}")]
    HardwareError(u8),

    #[error("session: invalid parameter: {0}")]
    InvalidParameter(String),
}

/// Result type for session-level operations
pub type Result<T> = std::result::Result<T, Error>;
