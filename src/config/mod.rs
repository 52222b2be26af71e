//! Configuration for both ends of the bridge.
//!
//! | Type | Description |
//! |------|-------------|
//! | [`BridgeConfig`] | Server listeners, timeouts, bounds |
//! | [`BridgeConfigBuilder`] | Fluent, validating builder |
//! | [`RelayConfig`] | Browser-side reconnect, keepalive, connect timings |

// ============================================================================
// Submodules
// ============================================================================

/// Bridge server configuration and builder.
pub mod bridge;

/// Browser-side relay options.
pub mod relay;

// ============================================================================
// Re-exports
// ============================================================================

pub use bridge::{BridgeConfig, BridgeConfigBuilder};
pub use relay::RelayConfig;
