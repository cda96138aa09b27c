//! Bluetooth HCI (Host Controller Interface) codec
//!
//! This module provides command encoding, event decoding and ACL framing.

pub mod acl;
pub mod constants;
pub mod event;
pub mod packet;


pub use acl::{AclHeader, AclPacket, BoundaryFlag};
pub use event::LeAdvertisingReport;
pub use packet::{AdvertisingParameters, ConnectionParameters, HciCommand, HciEvent, ScanParameters};
