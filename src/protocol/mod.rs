//! Message codec.
//!
//! This module defines the two wire formats the bridge speaks.
//!
//! # Protocol Overview
//!
//! | Message | Channel | Direction | Purpose |
//! |---------|---------|-----------|---------|
//! | `execute` | browser | Bridge → Tab | Run code in the page |
//! | `result` | browser | Tab → Bridge | Outcome of one `execute` |
//! | `ping` / `pong` | browser | Both | Keepalive |
//! | `browser_info` | browser | Tab → Bridge | Descriptive metadata |
//! | [`ExecuteRequest`] | CLI | CLI → Bridge | Execution request |
//! | [`ExecuteResponse`] | CLI | Bridge → CLI | Terminal outcome |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `cli` | CLI-facing request/response schema |
//! | `envelope` | Browser-facing envelopes |

// ============================================================================
// Submodules
// ============================================================================

/// CLI-facing request and response schema.
pub mod cli;

/// Browser-facing envelope types.
pub mod envelope;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{BridgeStatus, ExecuteRequest, ExecuteResponse, ExecutionOutput, FrontStatus};
pub use envelope::{BrowserInfo, Envelope, ExecuteEnvelope, ResultEnvelope};
