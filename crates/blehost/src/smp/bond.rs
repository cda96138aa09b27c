//! Bond records and bond storage
//!
//! A bond is the output of a successful pairing: the long term key plus the
//! values the controller needs to resume encryption without re-pairing.

use super::types::*;
use crate::address::Address;
use std::collections::HashMap;
use std::sync::RwLock;

/// Keys and metadata persisted for a paired peer
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Bond {
    /// Long term key
    pub ltk: [u8; 16],
    /// Encrypted diversifier (0 for Secure Connections)
    pub ediv: u16,
    /// Random number (0 for Secure Connections)
    pub rand: [u8; 8],
    /// Derived by LE legacy pairing
    pub legacy: bool,
    /// Derived with MITM protection
    pub authenticated: bool,
    /// Negotiated encryption key size
    pub key_size: u8,
    /// Peer's Identity Resolving Key, if distributed
    pub irk: Option<[u8; 16]>,
    /// Peer's identity address, if distributed
    pub identity: Option<Address>,
    /// Peer's Connection Signature Resolving Key, if distributed
    pub csrk: Option<[u8; 16]>,
}

impl Bond {
    pub fn new(ltk: [u8; 16], ediv: u16, rand: [u8; 8], legacy: bool) -> Self {
        Self {
            ltk,
            ediv,
            rand,
            legacy,
            key_size: 16,
            ..Self::default()
        }
    }

    /// Security level provided once the link is encrypted with this bond
    pub fn security_level(&self) -> SecurityLevel {
        match (self.legacy, self.authenticated) {
            (false, true) => SecurityLevel::SecureConnections,
            (_, true) => SecurityLevel::EncryptionWithAuthentication,
            _ => SecurityLevel::EncryptionOnly,
        }
    }

    /// Whether this bond answers an LTK request carrying `ediv` and `rand`
    pub fn matches(&self, ediv: u16, rand: &[u8; 8]) -> bool {
        self.ediv == ediv && &self.rand == rand
    }
}

/// Persistent storage for bonds, keyed by peer address
///
/// Implementations are shared between connections and must tolerate
/// concurrent calls.
pub trait BondStore: Send + Sync {
    fn find(&self, peer: &Address) -> Option<Bond>;

    fn save(&self, peer: &Address, bond: &Bond) -> SmpResult<()>;

    fn exists(&self, peer: &Address) -> bool {
        self.find(peer).is_some()
    }

    fn delete(&self, peer: &Address) -> SmpResult<()>;
}

/// In-memory bond storage
#[derive(Debug, Default)]
pub struct MemoryBondStore {
    bonds: RwLock<HashMap<Address, Bond>>,
}

impl MemoryBondStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Addresses with a stored bond
    pub fn peers(&self) -> Vec<Address> {
        self.bonds.read().unwrap().keys().copied().collect()
    }
}

impl BondStore for MemoryBondStore {
    fn find(&self, peer: &Address) -> Option<Bond> {
        self.bonds.read().unwrap().get(peer).cloned()
    }

    fn save(&self, peer: &Address, bond: &Bond) -> SmpResult<()> {
        self.bonds.write().unwrap().insert(*peer, bond.clone());
        Ok(())
    }

    fn exists(&self, peer: &Address) -> bool {
        self.bonds.read().unwrap().contains_key(peer)
    }

    fn delete(&self, peer: &Address) -> SmpResult<()> {
        self.bonds.write().unwrap().remove(peer);
        Ok(())
    }
}
