//! Bridge server configuration and its builder.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use tab_bridge::BridgeConfig;
//!
//! # fn example() -> tab_bridge::Result<()> {
//! let config = BridgeConfig::builder()
//!     .browser_port(9333)
//!     .cli_port(9334)
//!     .default_timeout(Duration::from_secs(10))
//!     .build()?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Default port tabs connect to.
pub const DEFAULT_BROWSER_PORT: u16 = 9333;

/// Default port the CLI talks to.
pub const DEFAULT_CLI_PORT: u16 = 9334;

/// Default execution timeout when a request names none.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest timeout a caller may ask for.
pub const DEFAULT_MAX_TIMEOUT: Duration = Duration::from_secs(300);

/// Default bound on in-flight requests.
pub const DEFAULT_MAX_PENDING: usize = 100;

/// Default period of the expired-request sweep.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(250);

// ============================================================================
// BridgeConfig
// ============================================================================

/// Validated bridge server configuration.
///
/// Build with [`BridgeConfig::builder()`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Address both listeners bind to. Always loopback.
    pub bind_ip: IpAddr,
    /// Browser WebSocket port (0 picks a free port).
    pub browser_port: u16,
    /// CLI HTTP port (0 picks a free port).
    pub cli_port: u16,
    /// Timeout applied when a request names none.
    pub default_timeout: Duration,
    /// Upper bound on caller-supplied timeouts.
    pub max_timeout: Duration,
    /// Bound on in-flight requests.
    pub max_pending: usize,
    /// Period of the expired-request sweep.
    pub sweep_interval: Duration,
}

impl BridgeConfig {
    /// Creates a configuration builder.
    #[inline]
    #[must_use]
    pub fn builder() -> BridgeConfigBuilder {
        BridgeConfigBuilder::new()
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            browser_port: DEFAULT_BROWSER_PORT,
            cli_port: DEFAULT_CLI_PORT,
            default_timeout: DEFAULT_TIMEOUT,
            max_timeout: DEFAULT_MAX_TIMEOUT,
            max_pending: DEFAULT_MAX_PENDING,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

// ============================================================================
// BridgeConfigBuilder
// ============================================================================

/// Builder for [`BridgeConfig`].
#[derive(Debug, Default, Clone)]
pub struct BridgeConfigBuilder {
    bind_ip: Option<IpAddr>,
    browser_port: Option<u16>,
    cli_port: Option<u16>,
    default_timeout: Option<Duration>,
    max_timeout: Option<Duration>,
    max_pending: Option<usize>,
    sweep_interval: Option<Duration>,
}

impl BridgeConfigBuilder {
    /// Creates a builder with every option at its default.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the bind address. Must be loopback.
    #[inline]
    #[must_use]
    pub fn bind_ip(mut self, ip: IpAddr) -> Self {
        self.bind_ip = Some(ip);
        self
    }

    /// Sets the browser WebSocket port.
    #[inline]
    #[must_use]
    pub fn browser_port(mut self, port: u16) -> Self {
        self.browser_port = Some(port);
        self
    }

    /// Sets the CLI HTTP port.
    #[inline]
    #[must_use]
    pub fn cli_port(mut self, port: u16) -> Self {
        self.cli_port = Some(port);
        self
    }

    /// Sets the timeout used when a request names none.
    #[inline]
    #[must_use]
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Sets the largest timeout a caller may ask for.
    #[inline]
    #[must_use]
    pub fn max_timeout(mut self, timeout: Duration) -> Self {
        self.max_timeout = Some(timeout);
        self
    }

    /// Sets the bound on in-flight requests.
    #[inline]
    #[must_use]
    pub fn max_pending(mut self, max: usize) -> Self {
        self.max_pending = Some(max);
        self
    }

    /// Sets the expired-request sweep period.
    #[inline]
    #[must_use]
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    /// Validates and builds the configuration.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the bind address is not loopback
    /// - [`Error::Config`] if a duration or bound is zero
    /// - [`Error::Config`] if the default timeout exceeds the max timeout
    pub fn build(self) -> Result<BridgeConfig> {
        let defaults = BridgeConfig::default();
        let config = BridgeConfig {
            bind_ip: self.bind_ip.unwrap_or(defaults.bind_ip),
            browser_port: self.browser_port.unwrap_or(defaults.browser_port),
            cli_port: self.cli_port.unwrap_or(defaults.cli_port),
            default_timeout: self.default_timeout.unwrap_or(defaults.default_timeout),
            max_timeout: self.max_timeout.unwrap_or(defaults.max_timeout),
            max_pending: self.max_pending.unwrap_or(defaults.max_pending),
            sweep_interval: self.sweep_interval.unwrap_or(defaults.sweep_interval),
        };

        Self::validate(&config)?;
        Ok(config)
    }
}

// ============================================================================
// Validation
// ============================================================================

impl BridgeConfigBuilder {
    fn validate(config: &BridgeConfig) -> Result<()> {
        if !config.bind_ip.is_loopback() {
            return Err(Error::config(format!(
                "bind address {} is not loopback; the bridge only trusts the local machine",
                config.bind_ip
            )));
        }

        if config.browser_port != 0 && config.browser_port == config.cli_port {
            return Err(Error::config(format!(
                "browser and CLI listeners cannot share port {}",
                config.browser_port
            )));
        }

        if config.default_timeout.is_zero() || config.max_timeout.is_zero() {
            return Err(Error::config("timeouts must be greater than zero"));
        }

        if config.default_timeout > config.max_timeout {
            return Err(Error::config(format!(
                "default timeout {}ms exceeds max timeout {}ms",
                config.default_timeout.as_millis(),
                config.max_timeout.as_millis()
            )));
        }

        if config.max_pending == 0 {
            return Err(Error::config("max_pending must be at least 1"));
        }

        if config.sweep_interval.is_zero() {
            return Err(Error::config("sweep interval must be greater than zero"));
        }

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::Ipv6Addr;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::builder().build().expect("defaults are valid");
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(config.browser_port, DEFAULT_BROWSER_PORT);
        assert_eq!(config.default_timeout, DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_overrides() {
        let config = BridgeConfig::builder()
            .bind_ip(IpAddr::V6(Ipv6Addr::LOCALHOST))
            .browser_port(0)
            .cli_port(0)
            .max_pending(5)
            .build()
            .expect("valid");

        assert_eq!(config.max_pending, 5);
        assert_eq!(config.browser_port, 0);
        assert!(config.bind_ip.is_ipv6());
    }

    #[test]
    fn test_rejects_non_loopback() {
        let err = BridgeConfig::builder()
            .bind_ip(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("loopback"));
    }

    #[test]
    fn test_rejects_shared_port() {
        let result = BridgeConfig::builder()
            .browser_port(9000)
            .cli_port(9000)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_default_above_max() {
        let result = BridgeConfig::builder()
            .default_timeout(Duration::from_secs(10))
            .max_timeout(Duration::from_secs(5))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_zero_values() {
        assert!(BridgeConfig::builder().max_pending(0).build().is_err());
        assert!(
            BridgeConfig::builder()
                .default_timeout(Duration::ZERO)
                .build()
                .is_err()
        );
        assert!(
            BridgeConfig::builder()
                .sweep_interval(Duration::ZERO)
                .build()
                .is_err()
        );
    }

    #[test]
    fn test_builder_is_clone() {
        let builder = BridgeConfigBuilder::new().browser_port(1234);
        let cloned = builder.clone();
        assert_eq!(builder.browser_port, cloned.browser_port);
    }
}
