//! Connection registry
//!
//! The authoritative map of server id to live connection. Lookups hand out
//! `Arc`s so a caller keeps a usable handle even if the entry is removed
//! while it is in use.

use crate::connection::ServerConnection;
use crate::error::{Result, RouterError};
use crate::namespace::ServerId;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ServerId, Arc<ServerConnection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails with `DuplicateServer` if the id is taken.
    pub fn insert(&self, connection: Arc<ServerConnection>) -> Result<()> {
        let mut connections = self.connections.write();
        let id = connection.id().clone();
        if connections.contains_key(&id) {
            return Err(RouterError::DuplicateServer { id: id.to_string() });
        }
        connections.insert(id, connection);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<ServerConnection>> {
        self.connections.read().get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<ServerConnection>> {
        self.connections.write().remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.connections.read().contains_key(id)
    }

    pub fn ids(&self) -> BTreeSet<ServerId> {
        self.connections.read().keys().cloned().collect()
    }

    /// Every connection, ordered by id.
    pub fn snapshot(&self) -> Vec<Arc<ServerConnection>> {
        let mut connections: Vec<_> = self.connections.read().values().cloned().collect();
        connections.sort_by(|a, b| a.id().cmp(b.id()));
        connections
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
