//! L2CAP (Logical Link Control and Adaptation Protocol) for LE links
//!
//! This module provides:
//! - Basic frame encoding for the fixed ATT, signaling and SMP channels
//! - The LE signaling commands and request/response correlation
//! - Credit based connection oriented channels

pub mod coc;
pub mod constants;
pub mod packet;
pub mod signaling;
pub mod types;
#[cfg(test)]
mod tests;

// Re-export the public API
pub use self::coc::{CocChannelInfo, CocEngine};
pub use self::packet::{L2capHeader, L2capPacket};
pub use self::signaling::{SignalingChannel, SignalingMessage};
pub use self::types::*;
