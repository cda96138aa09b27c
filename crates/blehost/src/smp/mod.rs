//! Security Manager Protocol (SMP)
//!
//! This module implements LE pairing for one link at a time:
//! - Feature exchange and association model selection
//! - LE legacy pairing (c1/s1) and LE Secure Connections (P-256, f4/f5/f6/g2)
//! - Key distribution and bond storage
//!
//! OOB pairing is not offered.

pub mod bond;
pub mod constants;
pub mod crypto;
pub mod manager;
pub mod pairing;
pub mod pdu;
pub mod types;

// Re-export public API
pub use self::bond::{Bond, BondStore, MemoryBondStore};
pub use self::manager::{PairingResult, SecurityManager, SmpTransport};
pub use self::pairing::{select_method, Association, PairingState};
pub use self::pdu::{PairingFeatures, SmpPdu};
pub use self::types::*;
