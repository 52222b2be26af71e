//! Browser-side relay options.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use tab_bridge::RelayConfig;
//!
//! let config = RelayConfig::new("ws://127.0.0.1:9333")
//!     .with_reconnect_delay(Duration::from_secs(1))
//!     .with_keepalive_interval(Duration::from_secs(10));
//! config.validate()?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use url::Url;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Delay before a single reconnect attempt.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Interval between keepalive pings while open.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Bound on one connect attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// RelayConfig
// ============================================================================

/// Options for the browser-side relay client and its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Bridge WebSocket URL.
    pub server_url: String,
    /// Delay before reconnecting after a drop.
    pub reconnect_delay: Duration,
    /// Keepalive ping period.
    pub keepalive_interval: Duration,
    /// Bound on one connect attempt.
    pub connect_timeout: Duration,
}

// ============================================================================
// Constructors
// ============================================================================

impl RelayConfig {
    /// Creates options for the given bridge URL with default timings.
    #[must_use]
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl RelayConfig {
    /// Sets the reconnect delay.
    #[inline]
    #[must_use]
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Sets the keepalive period.
    #[inline]
    #[must_use]
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Sets the connect timeout.
    #[inline]
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

// ============================================================================
// Validation
// ============================================================================

impl RelayConfig {
    /// Checks the URL scheme and timings.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the URL is not `ws://` or `wss://`
    /// - [`Error::Config`] if any duration is zero
    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.server_url)
            .map_err(|e| Error::config(format!("invalid server URL {:?}: {e}", self.server_url)))?;

        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::config(format!(
                "server URL must use ws:// or wss://, got {}://",
                url.scheme()
            )));
        }

        if self.reconnect_delay.is_zero()
            || self.keepalive_interval.is_zero()
            || self.connect_timeout.is_zero()
        {
            return Err(Error::config("relay durations must be greater than zero"));
        }

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
