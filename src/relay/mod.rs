//! Browser side of the bridge.
//!
//! A relay lives in a tab. It dials the bridge, announces the page, and runs
//! every `execute` envelope it receives, either in the page itself or
//! through a privileged companion that is not bound by the page's script
//! policy.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `executor` | Page traits and [`ExecutionRelay`] |
//! | `client` | [`RelayClient`] and its session loop |
//! | `lifecycle` | Visibility-driven connect, reconnect and close |
//! | `permission` | Per-domain allow-list |

// ============================================================================
// Submodules
// ============================================================================

/// Browser-side WebSocket client.
pub mod client;

/// Page traits and the execution relay.
pub mod executor;

/// Connect, reconnect and close rules.
pub mod lifecycle;

/// Per-domain allow-list.
pub mod permission;

// ============================================================================
// Re-exports
// ============================================================================

pub use client::{RelayClient, RelaySession, SessionEnd};
pub use executor::{
    CompanionHandle, Completion, Evaluator, ExecutionMode, ExecutionRelay, Injector, PageContext,
    ScriptResult, StaticPage,
};
pub use lifecycle::{
    Lifecycle, LifecycleAction, LifecycleEvent, LifecycleManager, LifecycleState,
};
pub use permission::{PermissionGate, PermissionPrompt, domain_of};
