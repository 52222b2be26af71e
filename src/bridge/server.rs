//! Bridge server façade.
//!
//! [`BridgeServer`] owns both listeners and the background tasks that connect
//! them:
//!
//! ```text
//! CLI ──HTTP──► BridgeServer::execute ──► Correlator::submit
//!                                              │
//!                                              ▼ execute envelope
//! Browser tab ◄──────────── WebSocket ──── front Connection
//!      │
//!      └── result envelope ──► dispatcher ──► Correlator::resolve
//! ```
//!
//! | Task | Role |
//! |------|------|
//! | accept loop | Upgrades browser sockets into connections |
//! | dispatcher | Routes connection events into the correlator |
//! | sweeper | Expires requests whose callers went away |
//! | HTTP server | Serves the CLI endpoint |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use crate::identifiers::ConnectionId;
use crate::protocol::{BridgeStatus, Envelope, ExecuteRequest, ExecuteResponse, ExecutionOutput};
use crate::transport::{BrowserListener, ConnectionEvent, EventReceiver};

use super::correlator::Correlator;
use super::http;

// ============================================================================
// Constants
// ============================================================================

/// How long shutdown waits for background tasks before aborting them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Poll period of [`BridgeServer::wait_for_browser`].
const FRONT_POLL_INTERVAL: Duration = Duration::from_millis(20);

// ============================================================================
// BridgeInner
// ============================================================================

/// Shared state behind every [`BridgeServer`] handle.
struct BridgeInner {
    /// Validated configuration.
    config: BridgeConfig,
    /// Registry plus pending table.
    correlator: Arc<Correlator>,
    /// Bound browser listener address.
    browser_addr: SocketAddr,
    /// Bound CLI listener address.
    cli_addr: SocketAddr,
    /// Flipped to `true` once to stop every task.
    shutdown_tx: watch::Sender<bool>,
    /// Background task handles, taken on shutdown.
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Set by the first shutdown call.
    closed: AtomicBool,
}

// ============================================================================
// BridgeServer
// ============================================================================

/// Process-facing bridge between CLI callers and the front browser tab.
///
/// Cheap to clone; all clones share one server.
///
/// # Example
///
/// ```no_run
/// use tab_bridge::{BridgeConfig, BridgeServer, Result};
///
/// # async fn example() -> Result<()> {
/// let server = BridgeServer::start(BridgeConfig::default()).await?;
/// println!("tabs dial {}", server.browser_url());
///
/// let output = server.execute("document.title", None).await?;
/// println!("{}", output.value);
///
/// server.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct BridgeServer {
    inner: Arc<BridgeInner>,
}

impl fmt::Debug for BridgeServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeServer")
            .field("browser_addr", &self.inner.browser_addr)
            .field("cli_addr", &self.inner.cli_addr)
            .field("connections", &self.inner.correlator.connection_count())
            .field("pending", &self.inner.correlator.pending_count())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// BridgeServer - Startup
// ============================================================================

impl BridgeServer {
    /// Binds both listeners and spawns the background tasks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if either listener fails to bind.
    pub async fn start(config: BridgeConfig) -> Result<Self> {
        let listener = BrowserListener::bind(config.bind_ip, config.browser_port).await?;
        let cli_listener =
            TcpListener::bind(SocketAddr::new(config.bind_ip, config.cli_port)).await?;

        let browser_addr = listener.local_addr();
        let cli_addr = cli_listener.local_addr()?;

        let correlator = Arc::new(Correlator::new(config.max_pending));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sweep_interval = config.sweep_interval;

        let server = Self {
            inner: Arc::new(BridgeInner {
                config,
                correlator: Arc::clone(&correlator),
                browser_addr,
                cli_addr,
                shutdown_tx,
                tasks: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        };

        let tasks = vec![
            tokio::spawn(listener.run(events_tx, shutdown_rx.clone())),
            tokio::spawn(dispatch(
                Arc::clone(&correlator),
                events_rx,
                shutdown_rx.clone(),
            )),
            tokio::spawn(sweep(correlator, sweep_interval, shutdown_rx.clone())),
            tokio::spawn(http::serve(cli_listener, server.clone(), shutdown_rx)),
        ];
        *server.inner.tasks.lock() = tasks;

        info!(
            browser = %browser_addr,
            cli = %cli_addr,
            "Bridge server started"
        );

        Ok(server)
    }
}

// ============================================================================
// BridgeServer - Execution
// ============================================================================

impl BridgeServer {
    /// Runs `code` in the front tab and returns its value.
    ///
    /// `timeout` defaults to the configured default timeout.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if `code` is blank or `timeout` is zero
    ///   or above the configured maximum
    /// - [`Error::NoBrowserConnected`] if no tab is front
    /// - [`Error::Timeout`] if no result arrives in time
    /// - [`Error::ExecutionError`] if the code threw or its promise rejected
    /// - [`Error::ConnectionLost`] if the tab went away first
    pub async fn execute(
        &self,
        code: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Result<ExecutionOutput> {
        let code = code.into();
        let timeout = self.validate(&code, timeout)?;

        let result = self.inner.correlator.submit(code, timeout).await?;

        if !result.ok {
            return Err(Error::execution(result.error_message()));
        }

        Ok(ExecutionOutput {
            value: result.result,
            url: non_empty(result.url),
            title: non_empty(result.title),
        })
    }

    /// Runs a CLI request and maps every outcome to the response shape.
    pub async fn handle(&self, request: ExecuteRequest) -> ExecuteResponse {
        let timeout = request.timeout_ms.map(Duration::from_millis);
        ExecuteResponse::from(self.execute(request.code, timeout).await)
    }

    /// Checks caller input and resolves the effective timeout.
    fn validate(&self, code: &str, timeout: Option<Duration>) -> Result<Duration> {
        if code.trim().is_empty() {
            return Err(Error::invalid_argument("code must not be empty"));
        }

        let max = self.inner.config.max_timeout;
        let timeout = timeout.unwrap_or(self.inner.config.default_timeout);

        if timeout.is_zero() {
            return Err(Error::invalid_argument("timeoutMs must be at least 1"));
        }
        if timeout > max {
            return Err(Error::invalid_argument(format!(
                "timeoutMs must not exceed {}",
                max.as_millis()
            )));
        }

        Ok(timeout)
    }
}

// ============================================================================
// BridgeServer - Connections
// ============================================================================

impl BridgeServer {
    /// Makes a registered connection the front connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the connection is unknown or
    /// not open.
    pub fn promote(&self, connection_id: ConnectionId) -> Result<()> {
        self.inner.correlator.promote(connection_id)
    }

    /// Waits until some tab is front.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoBrowserConnected`] if none appears within `timeout`.
    pub async fn wait_for_browser(&self, timeout: Duration) -> Result<ConnectionId> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(front) = self.inner.correlator.front() {
                return Ok(front.id());
            }
            if Instant::now() >= deadline {
                return Err(Error::NoBrowserConnected);
            }
            tokio::time::sleep(FRONT_POLL_INTERVAL).await;
        }
    }

    /// Returns a status snapshot.
    #[inline]
    #[must_use]
    pub fn status(&self) -> BridgeStatus {
        self.inner.correlator.status()
    }
}

// ============================================================================
// BridgeServer - Accessors
// ============================================================================

impl BridgeServer {
    /// Returns the WebSocket URL tabs dial.
    #[inline]
    #[must_use]
    pub fn browser_url(&self) -> String {
        format!("ws://{}", self.inner.browser_addr)
    }

    /// Returns the base URL of the CLI endpoint.
    #[inline]
    #[must_use]
    pub fn cli_url(&self) -> String {
        format!("http://{}", self.inner.cli_addr)
    }

    /// Returns the bound browser listener address.
    #[inline]
    #[must_use]
    pub fn browser_addr(&self) -> SocketAddr {
        self.inner.browser_addr
    }

    /// Returns the bound CLI listener address.
    #[inline]
    #[must_use]
    pub fn cli_addr(&self) -> SocketAddr {
        self.inner.cli_addr
    }

    /// Returns the active configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Returns the number of requests awaiting a result.
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.correlator.pending_count()
    }

    /// Returns `true` once shutdown has started.
    #[inline]
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

// ============================================================================
// BridgeServer - Shutdown
// ============================================================================

impl BridgeServer {
    /// Stops both listeners, closes every connection and fails every
    /// outstanding request with [`Error::ConnectionLost`]. Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        info!("Bridge server shutting down");

        let _ = self.inner.shutdown_tx.send(true);

        // Fail waiters first so in-flight HTTP calls can complete.
        self.inner.correlator.shutdown();

        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for mut task in tasks {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                warn!("Background task did not stop in time, aborting");
                task.abort();
            }
        }

        // Anything registered while the tasks wound down.
        self.inner.correlator.shutdown();

        info!("Bridge server stopped");
    }
}

// ============================================================================
// Background Tasks
// ============================================================================

/// Routes connection events into the correlator until shutdown.
async fn dispatch(
    correlator: Arc<Correlator>,
    mut events: EventReceiver,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        handle_event(&correlator, event);
    }

    debug!("Dispatcher terminated");
}

/// Applies one connection event.
fn handle_event(correlator: &Correlator, event: ConnectionEvent) {
    match event {
        ConnectionEvent::Opened(connection) => {
            let connection_id = connection.id();
            if let Err(e) = correlator.register(connection.clone()) {
                warn!(%connection_id, error = %e, "Browser connection not registered");
                connection.shutdown();
            }
        }

        ConnectionEvent::Envelope {
            connection_id,
            envelope,
        } => {
            correlator.touch(connection_id);

            match envelope {
                Envelope::Result(result) => {
                    correlator.resolve(connection_id, result);
                }

                Envelope::Ping => {
                    trace!(%connection_id, "Ping");
                    if let Err(e) = correlator.send_to(connection_id, Envelope::Pong) {
                        debug!(%connection_id, error = %e, "Pong not sent");
                    }
                }

                Envelope::Pong => {
                    trace!(%connection_id, "Pong");
                }

                Envelope::BrowserInfo(info) => {
                    info!(
                        %connection_id,
                        browser_name = %info.browser_name,
                        url = %info.url,
                        "Browser info received"
                    );
                    correlator.update_info(connection_id, info);
                }

                Envelope::Execute(execute) => {
                    warn!(
                        %connection_id,
                        request_id = %execute.request_id,
                        "Ignoring execute envelope sent by a browser"
                    );
                }
            }
        }

        ConnectionEvent::Closed { connection_id } => {
            correlator.retire(connection_id);
        }
    }
}

/// Expires abandoned requests every `period` until shutdown.
async fn sweep(correlator: Arc<Correlator>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                correlator.sweep_expired(Instant::now());
            }

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    debug!("Sweeper terminated");
}

/// Maps an empty page field to `None`.
fn non_empty(value: String) -> Option<String> {
    if value.is_empty() { None } else { Some(value) }
}

// ============================================================================
// Tests
// ============================================================================
