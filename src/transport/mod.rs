//! Browser-facing WebSocket transport.
//!
//! This module handles the link between the bridge (Rust) and browser tabs
//! (content script or extension) via WebSocket.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐                         ┌─────────────────┐
//! │  Bridge (Rust)       │        WebSocket        │  Browser tab    │
//! │                      │◄───────────────────────►│                 │
//! │  BrowserListener     │   ws://127.0.0.1:PORT   │  Relay client   │
//! │  → Connection        │                         │                 │
//! │  → ConnectionEvent   │                         │                 │
//! └──────────────────────┘                         └─────────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `connection` | Per-tab WebSocket event loop |
//! | `registry` | Registered connections and the front slot |
//! | `server` | Loopback WebSocket listener |

// ============================================================================
// Submodules
// ============================================================================

/// Per-tab WebSocket event loop.
pub mod connection;

/// Registered connections and the front slot.
pub mod registry;

/// Loopback WebSocket listener.
pub mod server;

// ============================================================================
// Re-exports
// ============================================================================

pub use connection::{Connection, ConnectionEvent, ConnectionState, EventReceiver, EventSender};
pub use registry::{ConnectionRegistry, RegisteredConnection, Retired};
pub use server::BrowserListener;
