//! Connections and their L2CAP plumbing
//!
//! This module provides:
//! - The per-link [`Connection`] with its reassembly thread
//! - ACL fragmentation and recombination
//! - Controller buffer accounting shared by all links

pub mod connection;
pub mod pool;
pub mod recombine;
pub(crate) mod table;

pub use self::connection::Connection;
pub use self::pool::AclPool;
pub use self::recombine::{fragment, Reassembler};

/// Link layer role of the local device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Central,
    Peripheral,
}

/// Connection parameters currently in force
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkParameters {
    /// Connection interval (1.25 ms units)
    pub interval: u16,
    pub latency: u16,
    /// Supervision timeout (10 ms units)
    pub supervision_timeout: u16,
}
