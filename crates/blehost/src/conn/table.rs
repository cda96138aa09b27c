//! Handle to connection map

use super::connection::Connection;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Live connections keyed by controller handle
#[derive(Debug, Default)]
pub(crate) struct ConnectionTable {
    links: RwLock<HashMap<u16, Arc<Connection>>>,
}

impl ConnectionTable {
    /// Register a connection, returning one the handle still pointed at
    pub fn insert(&self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        self.links.write().unwrap().insert(conn.handle(), conn)
    }

    pub fn get(&self, handle: u16) -> Option<Arc<Connection>> {
        self.links.read().unwrap().get(&handle).cloned()
    }

    pub fn remove(&self, handle: u16) -> Option<Arc<Connection>> {
        self.links.write().unwrap().remove(&handle)
    }

    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.links.read().unwrap().values().cloned().collect()
    }

    pub fn drain(&self) -> Vec<Arc<Connection>> {
        self.links.write().unwrap().drain().map(|(_, conn)| conn).collect()
    }

    pub fn len(&self) -> usize {
        self.links.read().unwrap().len()
    }
}
