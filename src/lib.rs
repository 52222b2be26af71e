//! Tab Bridge - run JavaScript in the front browser tab from the command line.
//!
//! A local process submits code over HTTP; the bridge relays it over a
//! WebSocket to exactly one "front" tab, waits for that tab's result, and
//! returns it, even when the page's script policy forbids injection.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────┐  POST /execute  ┌──────────────────────────┐   WebSocket   ┌──────────────┐
//! │   CLI   │────────────────►│  BridgeServer            │◄─────────────►│ Browser tab  │
//! │         │◄────────────────│   Correlator + Registry  │  execute ───► │ RelayClient  │
//! └─────────┘  {ok,value,err} └──────────────────────────┘  ◄─── result  │ Lifecycle    │
//!                                                                         └──────────────┘
//! ```
//!
//! Key design principles:
//!
//! - At most one front connection; the newest tab wins
//! - Results are matched by request id, never by arrival order
//! - Every accepted request resolves exactly once: result, timeout, or
//!   connection loss
//! - Code travels as one JSON string field, never spliced into a script
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use tab_bridge::{BridgeConfig, BridgeServer, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let server = BridgeServer::start(BridgeConfig::default()).await?;
//!     server.wait_for_browser(Duration::from_secs(30)).await?;
//!
//!     let output = server.execute("document.title", None).await?;
//!     println!("{}", output.value);
//!
//!     server.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`bridge`] | [`BridgeServer`], correlator, CLI endpoint |
//! | [`config`] | [`BridgeConfig`] and [`RelayConfig`] |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Request and connection ids |
//! | [`protocol`] | Browser envelopes and CLI schema |
//! | [`relay`] | Browser-side relay, lifecycle, permission gate |
//! | [`transport`] | Browser-facing WebSocket layer |

// ============================================================================
// Modules
// ============================================================================

/// Server side: correlator, façade and CLI endpoint.
///
/// Start with [`BridgeServer::start`].
pub mod bridge;

/// Server and relay configuration.
pub mod config;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers.
pub mod identifiers;

/// Wire formats.
pub mod protocol;

/// Browser side: execution relay, client, lifecycle, permission gate.
pub mod relay;

/// WebSocket transport layer.
///
/// Handles the browser listener, per-tab connections and the registry.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Bridge types
pub use bridge::{BridgeServer, Correlator};

// Configuration types
pub use config::{BridgeConfig, BridgeConfigBuilder, RelayConfig};

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{ConnectionId, RequestId};

// Protocol types
pub use protocol::{
    BridgeStatus, BrowserInfo, Envelope, ExecuteRequest, ExecuteResponse, ExecutionOutput,
};

// Relay types
pub use relay::{
    CompanionHandle, Completion, Evaluator, ExecutionMode, ExecutionRelay, Injector,
    LifecycleManager, LifecycleState, PageContext, PermissionGate, RelayClient, StaticPage,
};
