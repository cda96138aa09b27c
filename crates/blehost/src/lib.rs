//! blehost - a Bluetooth Low Energy host stack over raw HCI
//!
//! A [`Session`] drives one controller through a byte transport (a Linux
//! HCI user channel, a TCP bridge or a UART) and provides:
//! - HCI command flow control and event dispatch
//! - LE connections as central ([`Session::dial`]) and peripheral
//!   ([`Session::accept`]) with ACL fragmentation and recombination
//! - ATT data transfer, L2CAP signaling and LE credit based channels
//! - The Security Manager: legacy and Secure Connections pairing,
//!   bonding and link encryption
//!
//! Blocking calls run on the caller's thread; the session owns a small set
//! of background threads and stops them on [`Session::close`].

pub mod address;
pub mod config;
pub mod conn;
pub mod error;
pub mod hci;
pub mod host;
pub mod l2cap;
pub mod smp;
pub mod transport;

#[cfg(test)]
mod testing;

// Re-export common types for convenience
pub use address::{Address, AddressType};
pub use config::Config;
pub use conn::{Connection, LinkParameters, Role};
pub use error::{Error, HciError, Result};
pub use hci::{AdvertisingParameters, ConnectionParameters, HciCommand, ScanParameters};
pub use host::{Advertisement, CommandResponse, Session};
pub use l2cap::{CocChannelInfo, ConnectionParameterUpdate, L2capError, LeCreditBasedConfig};
pub use smp::{AuthData, Bond, BondStore, MemoryBondStore, PairingConfig, SecurityLevel, SmpError};
pub use transport::{HciSocket, TcpTransport, Transport, UartTransport};
