//! Connection registry
//!
//! Thread-safe index of live connections, used for id allocation, lookup
//! and closing everything on shutdown. Once drained, the registry refuses
//! new connections so that handshakes still in flight cannot slip past a
//! shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::net::connection::{Conn, Connection, ConnectionId, TransportKind};

/// Registry of live connections
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    next_id: AtomicU64,
    draining: AtomicBool,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
            draining: AtomicBool::new(false),
        }
    }

    /// Allocate the next connection id
    pub fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Register a connection
    ///
    /// After [`close_all`](Self::close_all) the connection is closed instead
    /// and `false` is returned.
    pub fn insert(&self, connection: Arc<Connection>) -> bool {
        // Insert before reading the flag; close_all sets it before iterating
        self.connections.insert(connection.id(), connection.clone());
        if self.draining.load(Ordering::SeqCst) {
            self.connections.remove(&connection.id());
            debug!(conn_id = connection.id(), "Registry draining, connection refused");
            connection.close();
            return false;
        }
        debug!(
            conn_id = connection.id(),
            remote = %connection.remote_addr(),
            transport = %connection.kind(),
            "Connection registered"
        );
        true
    }

    /// Remove a connection
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let removed = self.connections.remove(&id).map(|(_, c)| c);
        if removed.is_some() {
            debug!(conn_id = id, "Connection unregistered");
        }
        removed
    }

    /// Get a connection by id
    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|r| r.clone())
    }

    /// Number of live connections
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Ids of all live connections
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|r| *r.key()).collect()
    }

    /// Count of connections per transport kind
    pub fn count_by_kind(&self) -> HashMap<TransportKind, usize> {
        let mut counts = HashMap::new();
        for connection in self.connections.iter() {
            *counts.entry(connection.kind()).or_insert(0) += 1;
        }
        counts
    }

    /// Whether [`close_all`](Self::close_all) has run
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Close every registered connection and refuse new ones
    ///
    /// Connections stay registered until their pumps finish.
    pub fn close_all(&self) {
        self.draining.store(true, Ordering::SeqCst);
        // Collect first: close runs session callbacks, which may touch the registry
        let connections: Vec<Arc<Connection>> =
            self.connections.iter().map(|r| r.value().clone()).collect();
        if !connections.is_empty() {
            info!(count = connections.len(), "Closing all connections");
        }
        for connection in connections {
            connection.close();
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
