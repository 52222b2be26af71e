//! Error types for the tab bridge.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use tab_bridge::{BridgeServer, Result};
//!
//! async fn example(server: &BridgeServer) -> Result<()> {
//!     let output = server.execute("document.title", None).await?;
//!     println!("{}", output.value);
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Execution outcome | [`Error::NoBrowserConnected`], [`Error::Timeout`], [`Error::ExecutionError`], [`Error::ConnectionLost`], [`Error::PermissionDenied`] |
//! | Admission | [`Error::TooManyPending`], [`Error::InvalidArgument`] |
//! | Configuration | [`Error::Config`] |
//! | Connection | [`Error::Connection`], [`Error::ConnectionClosed`] |
//! | Protocol | [`Error::Protocol`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`] |
//!
//! The Display strings of the execution-outcome variants are exactly the
//! strings returned to CLI callers in the `error` field.

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::identifiers::{ConnectionId, RequestId};

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Execution Outcomes
    // ========================================================================
    /// No front browser connection at submission time.
    ///
    /// Fails fast; the server does not retry.
    #[error("no browser connected")]
    NoBrowserConnected,

    /// No matching result arrived before the deadline.
    #[error("timeout")]
    Timeout {
        /// The request that expired.
        request_id: RequestId,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// The executed code threw, or its awaited continuation rejected.
    ///
    /// The message is the browser's description, verbatim.
    #[error("{message}")]
    ExecutionError {
        /// Error description reported by the page.
        message: String,
    },

    /// The connection carrying the request closed before a result arrived.
    #[error("connection lost")]
    ConnectionLost {
        /// The connection that went away.
        connection_id: ConnectionId,
    },

    /// Domain is not on the user's allow-list (extension deployment).
    #[error("permission denied for {domain}")]
    PermissionDenied {
        /// Domain that was refused.
        domain: String,
    },

    // ========================================================================
    // Admission Errors
    // ========================================================================
    /// Pending table is full.
    #[error("too many pending requests ({pending}/{max})")]
    TooManyPending {
        /// Requests currently in flight.
        pending: usize,
        /// Configured limit.
        max: usize,
    },

    /// Invalid caller input.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the invalid argument.
        message: String,
    },

    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    #[error("configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// WebSocket connection failed.
    #[error("connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Connection is not open (closed or never opened).
    #[error("connection closed")]
    ConnectionClosed,

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Protocol violation or unexpected message.
    #[error("protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a timeout error.
    #[inline]
    pub fn timeout(request_id: RequestId, timeout_ms: u64) -> Self {
        Self::Timeout {
            request_id,
            timeout_ms,
        }
    }

    /// Creates an execution error.
    #[inline]
    pub fn execution(message: impl Into<String>) -> Self {
        Self::ExecutionError {
            message: message.into(),
        }
    }

    /// Creates a connection lost error.
    #[inline]
    pub fn connection_lost(connection_id: ConnectionId) -> Self {
        Self::ConnectionLost { connection_id }
    }

    /// Creates a permission denied error.
    #[inline]
    pub fn permission_denied(domain: impl Into<String>) -> Self {
        Self::PermissionDenied {
            domain: domain.into(),
        }
    }

    /// Creates a too many pending error.
    #[inline]
    pub fn too_many_pending(pending: usize, max: usize) -> Self {
        Self::TooManyPending { pending, max }
    }

    /// Creates an invalid argument error.
    #[inline]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::NoBrowserConnected
                | Self::ConnectionLost { .. }
                | Self::Connection { .. }
                | Self::ConnectionClosed
                | Self::WebSocket(_)
        )
    }

    /// Returns `true` if the caller's input was rejected before dispatch.
    #[inline]
    #[must_use]
    pub fn is_invalid_input(&self) -> bool {
        matches!(self, Self::InvalidArgument { .. })
    }

    /// Returns `true` if this error is one of the terminal execution outcomes
    /// reported to CLI callers.
    #[inline]
    #[must_use]
    pub fn is_execution_outcome(&self) -> bool {
        matches!(
            self,
            Self::NoBrowserConnected
                | Self::Timeout { .. }
                | Self::ExecutionError { .. }
                | Self::ConnectionLost { .. }
                | Self::PermissionDenied { .. }
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
