//! Type definitions for L2CAP operations
//!
//! This module contains core data structures used in L2CAP operations.

use super::constants::*;
use crate::error::HciError;
use thiserror::Error;

/// Error types specific to connections and L2CAP
#[derive(Debug, Error)]
pub enum L2capError {
    #[error("l2cap: invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("l2cap: framing error on handle 0x{handle:04x}: {reason}")]
    Framing { handle: u16, reason: String },

    #[error("l2cap: {0} timed out")]
    Timeout(&'static str),

    #[error("l2cap: request rejected by peer (reason 0x{0:04x})")]
    CommandRejected(u16),

    #[error("l2cap: credit based connection refused (result 0x{0:04x})")]
    ConnectionRefused(u16),

    #[error("l2cap: parameter update rejected by peer")]
    ParameterUpdateRejected,

    #[error("l2cap: channel 0x{0:04x} not found")]
    ChannelNotFound(u16),

    #[error("l2cap: channel 0x{0:04x} already registered")]
    DuplicateChannel(u16),

    #[error("l2cap: no free dynamic channel identifier")]
    ResourceLimitReached,

    #[error("l2cap: no send credit on channel 0x{0:04x}")]
    NoCredits(u16),

    #[error("l2cap: credit overflow on channel 0x{0:04x}")]
    CreditOverflow(u16),

    #[error("l2cap: SDU of {size} bytes exceeds MTU {mtu}")]
    MtuExceeded { size: usize, mtu: u16 },

    #[error("l2cap: no controller buffer available")]
    NoBuffer,

    #[error("l2cap: operation not supported")]
    NotSupported,

    #[error("l2cap: invalid state for operation")]
    InvalidState,

    #[error("l2cap: connection terminated")]
    ConnectionTerminated,

    #[error("l2cap: {0}")]
    Hci(#[from] HciError),
}

/// Result type for L2CAP operations
pub type L2capResult<T> = std::result::Result<T, L2capError>;

/// Connection parameters carried by the LE signaling update procedure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionParameterUpdate {
    /// Minimum connection interval (1.25ms units)
    pub conn_interval_min: u16,
    /// Maximum connection interval (1.25ms units)
    pub conn_interval_max: u16,
    /// Peripheral latency (number of events)
    pub conn_latency: u16,
    /// Connection supervision timeout (10ms units)
    pub supervision_timeout: u16,
}

impl ConnectionParameterUpdate {
    /// Validates that the parameters are within acceptable ranges
    pub fn validate(&self) -> bool {
        let interval_ok = self.conn_interval_min >= L2CAP_LE_CONN_INTERVAL_MIN
            && self.conn_interval_max <= L2CAP_LE_CONN_INTERVAL_MAX
            && self.conn_interval_min <= self.conn_interval_max;

        let latency_ok = self.conn_latency <= L2CAP_LE_CONN_LATENCY_MAX;

        let timeout_ok = self.supervision_timeout >= L2CAP_LE_SUPERVISION_TIMEOUT_MIN
            && self.supervision_timeout <= L2CAP_LE_SUPERVISION_TIMEOUT_MAX;

        // Supervision timeout (10 ms) must exceed (1 + latency) * interval_max (1.25 ms) * 2
        let relation_ok = (self.supervision_timeout as u32) * 4
            > (self.conn_interval_max as u32) * (self.conn_latency as u32 + 1);

        interval_ok && latency_ok && timeout_ok && relation_ok
    }
}

/// LE Credit-Based Connection configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeCreditBasedConfig {
    /// Maximum SDU size we accept
    pub mtu: u16,
    /// Maximum K-frame payload we accept
    pub mps: u16,
    /// Credits granted to the peer when the channel opens
    pub initial_credits: u16,
}

impl Default for LeCreditBasedConfig {
    fn default() -> Self {
        Self {
            mtu: L2CAP_LE_COC_DEFAULT_MTU,
            mps: L2CAP_LE_COC_DEFAULT_MPS,
            initial_credits: L2CAP_LE_COC_DEFAULT_CREDITS,
        }
    }
}

impl LeCreditBasedConfig {
    pub fn validate(&self) -> L2capResult<()> {
        if self.mtu < L2CAP_LE_COC_MIN_MTU {
            return Err(L2capError::InvalidParameter(format!("MTU {} below 23", self.mtu)));
        }
        if !(L2CAP_LE_COC_MIN_MPS..=L2CAP_LE_COC_MAX_MPS).contains(&self.mps) {
            return Err(L2capError::InvalidParameter(format!("MPS {} out of range", self.mps)));
        }
        Ok(())
    }
}

/// Credits a sender may still spend on a channel
///
/// The count only moves through `grant` and `try_take`, so it can never go
/// negative and never exceeds what was granted minus what was spent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Credits(u16);

impl Credits {
    pub fn new(initial: u16) -> Self {
        Self(initial)
    }

    pub fn available(&self) -> u16 {
        self.0
    }

    /// Add credits granted by the peer; fails if the total would exceed 65535
    pub fn grant(&mut self, credits: u16) -> Option<u16> {
        self.0 = self.0.checked_add(credits)?;
        Some(self.0)
    }

    /// Spend one credit if any remain
    pub fn try_take(&mut self) -> bool {
        match self.0.checked_sub(1) {
            Some(left) => {
                self.0 = left;
                true
            }
            None => false,
        }
    }
}
