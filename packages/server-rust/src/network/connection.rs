//! Connection tracking for the `pgscope` server.
//!
//! The registry records which connections are alive and how to cancel them.
//! It deliberately stores no session metadata: parameters, type map, and
//! remote address travel with each connection's [`Context`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use pgscope_core::{CancelHandle, Context, RemoteAddr};

/// Unique identifier for a connection, assigned by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// Handle to a single live connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    /// Unique connection identifier assigned by the registry.
    pub id: ConnectionId,
    /// Peer address reported by the transport.
    pub remote_addr: RemoteAddr,
    /// When this connection was accepted.
    pub connected_at: Instant,
    ctx: Context,
    cancel: CancelHandle,
}

impl ConnectionHandle {
    /// Base context of the connection, carrying the remote address.
    #[must_use]
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Cancels the connection's context and everything derived from it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns `false` once the connection or the whole server is cancelled.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.ctx.is_done()
    }
}

/// Thread-safe registry of all active connections.
///
/// `DashMap` shards its locks, so accept and teardown on different
/// connections never contend on a single global lock.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Creates a new empty registry.
    ///
    /// Connection IDs start at 1 (0 is reserved as "no connection").
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers an accepted connection.
    ///
    /// Derives the connection's cancellation scope from `parent` and attaches
    /// the remote address before any handler can see the context.
    pub fn register(&self, parent: &Context, remote_addr: RemoteAddr) -> Arc<ConnectionHandle> {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (scope, cancel) = parent.with_cancel();
        let ctx = scope.with_remote_addr(remote_addr.clone());

        let handle = Arc::new(ConnectionHandle {
            id,
            remote_addr,
            connected_at: Instant::now(),
            ctx,
            cancel,
        });

        self.connections.insert(id, Arc::clone(&handle));
        handle
    }

    /// Removes a connection from the registry, returning its handle if found.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.remove(&id).map(|(_, handle)| handle)
    }

    /// Looks up a connection by ID.
    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(&id).map(|r| r.value().clone())
    }

    /// Cancels one connection. Returns `false` if the ID is unknown.
    pub fn cancel(&self, id: ConnectionId) -> bool {
        match self.connections.get(&id) {
            Some(entry) => {
                entry.value().cancel();
                true
            }
            None => false,
        }
    }

    /// Returns the total number of registered connections.
    #[must_use]
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Removes and returns all connections. Used during graceful shutdown.
    pub fn drain_all(&self) -> Vec<Arc<ConnectionHandle>> {
        let keys: Vec<ConnectionId> = self
            .connections
            .iter()
            .map(|entry| *entry.key())
            .collect();

        let mut handles = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((_, handle)) = self.connections.remove(&key) {
                handles.push(handle);
            }
        }
        handles
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
