//! Registry of browser connections and the single front slot.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          ConnectionRegistry             │
//! │  ┌─────────────────────────────────┐    │
//! │  │ ConnectionId=1 → Connection 1   │    │
//! │  │ ConnectionId=2 → Connection 2   │    │
//! │  │ ConnectionId=3 → Connection 3 ◄─┼── front
//! │  └─────────────────────────────────┘    │
//! └─────────────────────────────────────────┘
//! ```
//!
//! The registry is plain data with `&mut self` mutators. Its owner holds
//! it behind the same lock as the pending-request table, so front changes
//! and request resolution are mutually exclusive.

// ============================================================================
// Imports
// ============================================================================

use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::identifiers::ConnectionId;
use crate::protocol::BrowserInfo;

use super::Connection;

// ============================================================================
// RegisteredConnection
// ============================================================================

/// A connection plus what the registry knows about it.
#[derive(Debug, Clone)]
pub struct RegisteredConnection {
    /// Transport handle.
    pub connection: Connection,
    /// Metadata reported by the tab.
    pub info: BrowserInfo,
    /// When the connection registered.
    pub connected_at: Instant,
    /// When the last envelope arrived.
    pub last_seen: Instant,
}

// ============================================================================
// Retired
// ============================================================================

/// Outcome of retiring a registered connection.
#[derive(Debug)]
pub struct Retired {
    /// The removed connection (already shut down).
    pub connection: Connection,
    /// Whether it held the front slot.
    pub was_front: bool,
}

// ============================================================================
// ConnectionRegistry
// ============================================================================

/// Tracks registered browser connections and at most one front connection.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    /// Registered connections by ID.
    connections: FxHashMap<ConnectionId, RegisteredConnection>,
    /// The one connection receiving `execute` envelopes.
    front: Option<ConnectionId>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection and makes it front (last registered wins).
    ///
    /// # Errors
    ///
    /// - [`Error::Protocol`] if the ID is already registered
    /// - [`Error::ConnectionClosed`] if the connection already closed
    pub fn register(&mut self, connection: Connection) -> Result<()> {
        let id = connection.id();

        if self.connections.contains_key(&id) {
            return Err(Error::protocol(format!(
                "connection {id} is already registered"
            )));
        }

        if !connection.mark_open() {
            return Err(Error::ConnectionClosed);
        }

        let now = Instant::now();
        self.connections.insert(
            id,
            RegisteredConnection {
                connection,
                info: BrowserInfo::default(),
                connected_at: now,
                last_seen: now,
            },
        );

        let previous = self.front.replace(id);
        info!(connection_id = %id, previous_front = ?previous, "Connection registered as front");

        Ok(())
    }

    /// Removes a connection and shuts it down.
    ///
    /// Clears the front slot when it held it. Retiring an unknown or
    /// already-retired ID returns `None`.
    pub fn retire(&mut self, id: ConnectionId) -> Option<Retired> {
        let entry = self.connections.remove(&id)?;
        entry.connection.shutdown();

        let was_front = self.front == Some(id);
        if was_front {
            self.front = None;
        }

        debug!(connection_id = %id, was_front, "Connection retired");

        Some(Retired {
            connection: entry.connection,
            was_front,
        })
    }

    /// Makes an open, registered connection the front connection.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if the ID is unknown or not open
    pub fn promote(&mut self, id: ConnectionId) -> Result<()> {
        let entry = self
            .connections
            .get(&id)
            .ok_or_else(|| Error::invalid_argument(format!("unknown connection {id}")))?;

        if !entry.connection.is_open() {
            return Err(Error::invalid_argument(format!(
                "connection {id} is not open"
            )));
        }

        let previous = self.front.replace(id);
        info!(connection_id = %id, previous_front = ?previous, "Connection promoted to front");

        Ok(())
    }

    /// Returns the front connection if it is still open.
    #[must_use]
    pub fn front(&self) -> Option<&Connection> {
        self.front_entry().map(|entry| &entry.connection)
    }

    /// Returns the front connection's registry entry if it is still open.
    #[must_use]
    pub fn front_entry(&self) -> Option<&RegisteredConnection> {
        let id = self.front?;
        self.connections
            .get(&id)
            .filter(|entry| entry.connection.is_open())
    }

    /// Returns the ID holding the front slot, open or not.
    #[inline]
    #[must_use]
    pub fn front_id(&self) -> Option<ConnectionId> {
        self.front
    }

    /// Returns a registered connection.
    #[inline]
    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<&RegisteredConnection> {
        self.connections.get(&id)
    }

    /// Records activity on a connection.
    pub fn touch(&mut self, id: ConnectionId) {
        if let Some(entry) = self.connections.get_mut(&id) {
            entry.last_seen = Instant::now();
        }
    }

    /// Replaces the browser metadata of a connection.
    pub fn update_info(&mut self, id: ConnectionId, info: BrowserInfo) {
        if let Some(entry) = self.connections.get_mut(&id) {
            entry.info = info;
        }
    }

    /// Updates the last known page location of a connection.
    pub fn update_page(&mut self, id: ConnectionId, url: &str, title: &str) {
        if let Some(entry) = self.connections.get_mut(&id) {
            if !url.is_empty() {
                entry.info.url = url.to_string();
            }
            if !title.is_empty() {
                entry.info.title = title.to_string();
            }
        }
    }

    /// Returns the number of registered connections.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Returns `true` if nothing is registered.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Removes and shuts down every connection.
    pub fn drain(&mut self) -> Vec<Connection> {
        self.front = None;
        self.connections
            .drain()
            .map(|(_, entry)| {
                entry.connection.shutdown();
                entry.connection
            })
            .collect()
    }
}

// ============================================================================
// Tests
// ============================================================================
