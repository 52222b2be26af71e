//! Connection lifecycle of a browser-side relay.
//!
//! [`Lifecycle`] is a pure state machine: feed it a [`LifecycleEvent`], get
//! back the [`LifecycleAction`]s to perform. [`LifecycleManager`] performs
//! them with tokio.
//!
//! ```text
//!              visible                handshake ok
//! Disconnected ───────► Connecting ──────────────► Open
//!      ▲                    │                        │
//!      │   connect failed   │      transport closed  │
//!      └────────────────────┴────────────────────────┘
//!            (one reconnect scheduled after the delay)
//! ```
//!
//! Rules:
//!
//! - embedded frames never connect
//! - losing visibility closes the connection and cancels any reconnect
//! - at most one reconnect timer is outstanding
//! - a successful handshake cancels a pending reconnect
//! - the permission prompt runs on the blocking pool, never on the loop

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Sleep, sleep};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

use super::client::{RelayClient, RelaySession, SessionEnd};
use super::permission::{PermissionGate, domain_of};

// ============================================================================
// LifecycleState
// ============================================================================

/// Connection state of one relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifecycleState {
    /// No connection and no attempt in flight.
    #[default]
    Disconnected,
    /// Connect attempt in flight.
    Connecting,
    /// Session open.
    Open,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Open => "open",
        })
    }
}

// ============================================================================
// LifecycleEvent / LifecycleAction
// ============================================================================

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Page visibility changed.
    VisibilityChanged {
        /// New visibility.
        visible: bool,
    },
    /// Connect attempt completed its handshake.
    HandshakeSucceeded,
    /// Connect attempt failed or timed out.
    ConnectFailed,
    /// Open session ended.
    TransportClosed,
    /// The reconnect timer fired.
    ReconnectDue,
    /// The permission gate refused the page's domain.
    PermissionDenied,
}

/// Outputs of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    /// Start a connect attempt.
    Connect,
    /// Abort the attempt or close the session.
    Close,
    /// Arm the reconnect timer.
    ScheduleReconnect(Duration),
    /// Disarm the reconnect timer.
    CancelReconnect,
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Pure lifecycle state machine.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: LifecycleState,
    top_level: bool,
    visible: bool,
    reconnect_armed: bool,
    reconnect_delay: Duration,
}

impl Lifecycle {
    /// Creates a hidden, disconnected machine.
    #[must_use]
    pub fn new(top_level: bool, reconnect_delay: Duration) -> Self {
        Self {
            state: LifecycleState::Disconnected,
            top_level,
            visible: false,
            reconnect_armed: false,
            reconnect_delay,
        }
    }

    /// Returns the current state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Returns `true` while a reconnect timer is armed.
    #[inline]
    #[must_use]
    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_armed
    }

    /// Returns `true` if this context may hold a connection right now.
    #[inline]
    #[must_use]
    pub fn wants_connection(&self) -> bool {
        self.top_level && self.visible
    }

    /// Applies one event and returns the actions to perform, in order.
    pub fn handle(&mut self, event: LifecycleEvent) -> Vec<LifecycleAction> {
        let mut actions = Vec::new();

        match event {
            LifecycleEvent::VisibilityChanged { visible: true } => {
                self.visible = true;
                if self.wants_connection() && self.state == LifecycleState::Disconnected {
                    self.disarm(&mut actions);
                    self.state = LifecycleState::Connecting;
                    actions.push(LifecycleAction::Connect);
                }
            }

            LifecycleEvent::VisibilityChanged { visible: false } => {
                self.visible = false;
                self.disarm(&mut actions);
                if self.state != LifecycleState::Disconnected {
                    self.state = LifecycleState::Disconnected;
                    actions.push(LifecycleAction::Close);
                }
            }

            LifecycleEvent::HandshakeSucceeded => {
                if self.state == LifecycleState::Connecting && self.wants_connection() {
                    self.state = LifecycleState::Open;
                    self.disarm(&mut actions);
                } else {
                    // Stale attempt; whoever cancelled it already moved on.
                    actions.push(LifecycleAction::Close);
                }
            }

            LifecycleEvent::ConnectFailed | LifecycleEvent::TransportClosed => {
                if self.state != LifecycleState::Disconnected {
                    self.state = LifecycleState::Disconnected;
                    if self.wants_connection() && !self.reconnect_armed {
                        self.reconnect_armed = true;
                        actions.push(LifecycleAction::ScheduleReconnect(self.reconnect_delay));
                    }
                }
            }

            LifecycleEvent::ReconnectDue => {
                if self.reconnect_armed {
                    self.reconnect_armed = false;
                    if self.wants_connection() && self.state == LifecycleState::Disconnected {
                        self.state = LifecycleState::Connecting;
                        actions.push(LifecycleAction::Connect);
                    }
                }
            }

            LifecycleEvent::PermissionDenied => {
                if self.state == LifecycleState::Connecting {
                    self.state = LifecycleState::Disconnected;
                }
                self.disarm(&mut actions);
            }
        }

        actions
    }

    fn disarm(&mut self, actions: &mut Vec<LifecycleAction>) {
        if self.reconnect_armed {
            self.reconnect_armed = false;
            actions.push(LifecycleAction::CancelReconnect);
        }
    }
}

// ============================================================================
// LifecycleManager
// ============================================================================

/// An open session running on its own task.
struct ActiveSession {
    stop: oneshot::Sender<()>,
    task: JoinHandle<SessionEnd>,
}

/// In-flight work owned by the manager loop.
#[derive(Default)]
struct Tasks {
    checking: Option<JoinHandle<Result<()>>>,
    connecting: Option<JoinHandle<Result<RelaySession>>>,
    session: Option<ActiveSession>,
    reconnect: Option<Pin<Box<Sleep>>>,
}

/// What woke the manager loop.
enum Wake {
    Visibility(bool),
    Stop,
    Checked(std::result::Result<Result<()>, JoinError>),
    Connected(std::result::Result<Result<RelaySession>, JoinError>),
    SessionEnded,
    ReconnectDue,
}

/// Drives a [`Lifecycle`] for one [`RelayClient`].
///
/// # Example
///
/// ```ignore
/// let (visibility_tx, visibility_rx) = watch::channel(true);
/// let (stop_tx, stop_rx) = watch::channel(false);
///
/// let manager = LifecycleManager::new(client);
/// let mut state = manager.subscribe();
/// tokio::spawn(manager.run(visibility_rx, stop_rx));
///
/// visibility_tx.send(false)?; // tab hidden: connection closes
/// ```
pub struct LifecycleManager {
    client: RelayClient,
    gate: Option<Arc<PermissionGate>>,
    state_tx: watch::Sender<LifecycleState>,
}

impl fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("state", &*self.state_tx.borrow())
            .field("gated", &self.gate.is_some())
            .finish_non_exhaustive()
    }
}

impl LifecycleManager {
    /// Creates a manager without a permission gate.
    #[must_use]
    pub fn new(client: RelayClient) -> Self {
        let (state_tx, _) = watch::channel(LifecycleState::Disconnected);
        Self {
            client,
            gate: None,
            state_tx,
        }
    }

    /// Requires the page's domain to pass `gate` before every connect.
    #[must_use]
    pub fn with_permission_gate(mut self, gate: Arc<PermissionGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Observes state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state_tx.subscribe()
    }

    /// Runs until `stop` flips to `true` or its sender is dropped.
    ///
    /// `visibility` carries page visibility; its current value is applied
    /// immediately.
    pub async fn run(
        self,
        mut visibility: watch::Receiver<bool>,
        mut stop: watch::Receiver<bool>,
    ) {
        let page = Arc::clone(self.client.relay().page());
        let mut machine = Lifecycle::new(page.is_top_level(), self.client.config().reconnect_delay);

        let mut tasks = Tasks::default();

        if !page.is_top_level() {
            debug!("Embedded frame, relay stays disconnected");
        }

        let initial = *visibility.borrow_and_update();
        let mut pending = vec![LifecycleEvent::VisibilityChanged { visible: initial }];

        loop {
            while let Some(event) = pending.pop() {
                let actions = machine.handle(event);
                for action in actions {
                    self.apply(action, &mut tasks);
                }
                self.state_tx.send_replace(machine.state());
            }

            let wake = tokio::select! {
                changed = visibility.changed() => match changed {
                    Ok(()) => Wake::Visibility(*visibility.borrow_and_update()),
                    Err(_) => Wake::Stop,
                },

                changed = stop.changed() => match changed {
                    Ok(()) if !*stop.borrow() => continue,
                    _ => Wake::Stop,
                },

                joined = join_task(&mut tasks.checking) => Wake::Checked(joined),

                joined = join_task(&mut tasks.connecting) => Wake::Connected(joined),

                () = wait_session(&mut tasks.session) => Wake::SessionEnded,

                () = wait_reconnect(&mut tasks.reconnect) => Wake::ReconnectDue,
            };

            match wake {
                Wake::Visibility(visible) => {
                    debug!(visible, "Visibility changed");
                    pending.push(LifecycleEvent::VisibilityChanged { visible });
                }

                Wake::Stop => break,

                Wake::Checked(joined) => {
                    tasks.checking = None;
                    match joined {
                        Ok(Ok(())) => {
                            if machine.state() == LifecycleState::Connecting {
                                tasks.connecting = Some(self.spawn_connect());
                            }
                        }
                        Ok(Err(e)) => {
                            warn!(error = %e, "Connection skipped");
                            pending.push(LifecycleEvent::PermissionDenied);
                        }
                        Err(e) => {
                            warn!(error = %e, "Permission check aborted");
                            pending.push(LifecycleEvent::PermissionDenied);
                        }
                    }
                }

                Wake::Connected(joined) => {
                    tasks.connecting = None;
                    match joined {
                        Ok(Ok(opened)) => {
                            let (stop_tx, stop_rx) = oneshot::channel();
                            let task = tokio::spawn(opened.run(async move {
                                let _ = stop_rx.await;
                            }));
                            tasks.session = Some(ActiveSession {
                                stop: stop_tx,
                                task,
                            });
                            pending.push(LifecycleEvent::HandshakeSucceeded);
                        }
                        Ok(Err(e)) => {
                            warn!(error = %e, "Connect attempt failed");
                            pending.push(LifecycleEvent::ConnectFailed);
                        }
                        Err(e) => {
                            warn!(error = %e, "Connect task aborted");
                            pending.push(LifecycleEvent::ConnectFailed);
                        }
                    }
                }

                Wake::SessionEnded => {
                    tasks.session = None;
                    pending.push(LifecycleEvent::TransportClosed);
                }

                Wake::ReconnectDue => {
                    tasks.reconnect = None;
                    pending.push(LifecycleEvent::ReconnectDue);
                }
            }
        }

        if let Some(handle) = tasks.checking.take() {
            handle.abort();
        }
        if let Some(handle) = tasks.connecting.take() {
            handle.abort();
        }
        if let Some(active) = tasks.session.take() {
            let _ = active.stop.send(());
            let _ = active.task.await;
        }
        self.state_tx.send_replace(LifecycleState::Disconnected);

        info!("Lifecycle manager stopped");
    }

    /// Performs one action.
    fn apply(&self, action: LifecycleAction, tasks: &mut Tasks) {
        match action {
            LifecycleAction::Connect => match &self.gate {
                Some(gate) => {
                    let gate = Arc::clone(gate);
                    let url = self.client.relay().page().url();
                    tasks.checking =
                        Some(tokio::task::spawn_blocking(move || check_permission(&gate, &url)));
                }
                None => tasks.connecting = Some(self.spawn_connect()),
            },

            LifecycleAction::Close => {
                // A prompt already showing cannot be withdrawn; its answer is ignored.
                if let Some(handle) = tasks.checking.take() {
                    handle.abort();
                }
                if let Some(handle) = tasks.connecting.take() {
                    handle.abort();
                }
                if let Some(active) = tasks.session.take() {
                    // The session task finishes on its own after the close frame.
                    let _ = active.stop.send(());
                    debug!("Session asked to close");
                }
            }

            LifecycleAction::ScheduleReconnect(delay) => {
                debug!(delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
                tasks.reconnect = Some(Box::pin(sleep(delay)));
            }

            LifecycleAction::CancelReconnect => {
                tasks.reconnect = None;
            }
        }
    }

    fn spawn_connect(&self) -> JoinHandle<Result<RelaySession>> {
        let client = self.client.clone();
        tokio::spawn(async move { client.connect().await })
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Consults `gate` for the page at `url`. Blocks while the user decides.
fn check_permission(gate: &PermissionGate, url: &str) -> Result<()> {
    let domain = domain_of(url).ok_or_else(|| Error::permission_denied(url))?;

    match gate.check_and_request(&domain) {
        Ok(true) => Ok(()),
        Ok(false) => Err(Error::permission_denied(domain)),
        Err(e) => {
            warn!(%domain, error = %e, "Permission check failed");
            Err(Error::permission_denied(domain))
        }
    }
}

async fn join_task<T>(slot: &mut Option<JoinHandle<T>>) -> std::result::Result<T, JoinError> {
    match slot {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

async fn wait_session(session: &mut Option<ActiveSession>) {
    match session {
        Some(active) => {
            let _ = (&mut active.task).await;
        }
        None => std::future::pending().await,
    }
}

async fn wait_reconnect(reconnect: &mut Option<Pin<Box<Sleep>>>) {
    match reconnect {
        Some(timer) => timer.as_mut().await,
        None => std::future::pending().await,
    }
}

// ============================================================================
// Tests
// ============================================================================
