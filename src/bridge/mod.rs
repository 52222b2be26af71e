//! Server side of the bridge.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `correlator` | Pending-request table keyed by request id |
//! | `server` | [`BridgeServer`] façade and background tasks |
//! | `http` | CLI-facing HTTP endpoint |

// ============================================================================
// Submodules
// ============================================================================

/// Pending-request table keyed by request id.
pub mod correlator;

/// CLI-facing HTTP endpoint.
pub mod http;

/// Bridge server façade.
pub mod server;

// ============================================================================
// Re-exports
// ============================================================================

pub use correlator::Correlator;
pub use http::router;
pub use server::BridgeServer;
