//! Request correlation between CLI callers and browser results.
//!
//! The correlator owns the [`ConnectionRegistry`] and the pending-request
//! table behind one mutex. Every front change and every resolution happens
//! under that lock, which gives the two core guarantees:
//!
//! - at most one front connection at any instant
//! - each pending request resolves exactly once, by whichever of
//!   result, timeout, or connection loss removes it from the table first
//!
//! The lock never spans an await. Envelopes are queued to the connection and
//! resolution slots are fired after the guard is dropped.

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::identifiers::{ConnectionId, RequestId};
use crate::protocol::{BridgeStatus, BrowserInfo, Envelope, FrontStatus, ResultEnvelope};
use crate::transport::{Connection, ConnectionRegistry};

// ============================================================================
// Types
// ============================================================================

/// Resolution slot of one pending request.
type Slot = oneshot::Sender<Result<ResultEnvelope>>;

// ============================================================================
// PendingRequest
// ============================================================================

/// One in-flight execution.
#[derive(Debug)]
struct PendingRequest {
    /// Connection the `execute` envelope went to.
    connection_id: ConnectionId,
    /// Submitted source.
    code: String,
    /// Submission time.
    created_at: Instant,
    /// Timeout instant.
    deadline: Instant,
    /// Fired once, then gone.
    slot: Slot,
}

impl PendingRequest {
    fn resolve(self, request_id: RequestId, outcome: Result<ResultEnvelope>) {
        let elapsed_ms = self.created_at.elapsed().as_millis() as u64;
        debug!(
            %request_id,
            connection_id = %self.connection_id,
            code_len = self.code.len(),
            elapsed_ms,
            ok = outcome.as_ref().is_ok_and(|r| r.ok),
            "Request resolved"
        );

        // Caller may have given up already; nothing else to do.
        let _ = self.slot.send(outcome);
    }
}

// ============================================================================
// CorrelatorState
// ============================================================================

/// Everything guarded by the correlator lock.
#[derive(Debug, Default)]
struct CorrelatorState {
    registry: ConnectionRegistry,
    pending: FxHashMap<RequestId, PendingRequest>,
}

impl CorrelatorState {
    /// Removes every pending request bound to `connection_id`.
    fn take_bound(&mut self, connection_id: ConnectionId) -> Vec<(RequestId, PendingRequest)> {
        let ids: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.connection_id == connection_id)
            .map(|(id, _)| *id)
            .collect();

        ids.into_iter()
            .filter_map(|id| self.pending.remove(&id).map(|pending| (id, pending)))
            .collect()
    }
}

// ============================================================================
// Correlator
// ============================================================================

/// Matches asynchronous browser results back to waiting callers.
///
/// # Example
///
/// ```ignore
/// let correlator = Correlator::new(100);
/// correlator.register(connection)?;
///
/// let result = correlator.submit("1 + 1".into(), Duration::from_secs(5)).await?;
/// assert!(result.ok);
/// ```
#[derive(Debug)]
pub struct Correlator {
    /// Registry and pending table.
    state: Mutex<CorrelatorState>,
    /// Pending-table bound.
    max_pending: usize,
}

// ============================================================================
// Correlator - Submission
// ============================================================================

impl Correlator {
    /// Creates a correlator with the given pending-request bound.
    #[must_use]
    pub fn new(max_pending: usize) -> Self {
        Self {
            state: Mutex::new(CorrelatorState::default()),
            max_pending,
        }
    }

    /// Sends `code` to the front connection and waits for its result.
    ///
    /// Returns the raw `result` envelope, `ok` or not.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if `request_timeout` overflows the clock
    /// - [`Error::NoBrowserConnected`] if there is no open front connection
    /// - [`Error::TooManyPending`] if the pending table is full
    /// - [`Error::Timeout`] if no result arrives before `request_timeout`
    /// - [`Error::ConnectionLost`] if the connection closes first
    pub async fn submit(&self, code: String, request_timeout: Duration) -> Result<ResultEnvelope> {
        let created_at = Instant::now();
        let deadline = created_at
            .checked_add(request_timeout)
            .ok_or_else(|| Error::invalid_argument("timeout is too large"))?;
        let (slot, mut rx) = oneshot::channel();

        let (request_id, connection) = {
            let mut state = self.state.lock();

            let connection = state
                .registry
                .front()
                .cloned()
                .ok_or(Error::NoBrowserConnected)?;

            if state.pending.len() >= self.max_pending {
                warn!(
                    pending = state.pending.len(),
                    max = self.max_pending,
                    "Too many pending requests"
                );
                return Err(Error::too_many_pending(state.pending.len(), self.max_pending));
            }

            let mut request_id = RequestId::generate();
            while state.pending.contains_key(&request_id) {
                request_id = RequestId::generate();
            }

            state.pending.insert(
                request_id,
                PendingRequest {
                    connection_id: connection.id(),
                    code: code.clone(),
                    created_at,
                    deadline,
                    slot,
                },
            );

            (request_id, connection)
        };

        debug!(
            %request_id,
            connection_id = %connection.id(),
            timeout_ms = request_timeout.as_millis() as u64,
            "Request submitted"
        );

        if let Err(e) = connection.send(Envelope::execute(request_id, code)) {
            warn!(%request_id, error = %e, "Front connection refused envelope");
            self.resolve_with(request_id, Err(Error::connection_lost(connection.id())));
        }

        match timeout_at(deadline, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::connection_lost(connection.id())),
            Err(_) => {
                let expired = self.state.lock().pending.remove(&request_id);
                match expired {
                    Some(pending) => {
                        let timeout_ms = request_timeout.as_millis() as u64;
                        pending.resolve(request_id, Err(Error::timeout(request_id, timeout_ms)));
                        warn!(%request_id, timeout_ms, "Request timed out");
                        Err(Error::timeout(request_id, timeout_ms))
                    }
                    // Resolved between the deadline firing and the lock.
                    None => rx.try_recv().unwrap_or_else(|_| {
                        Err(Error::timeout(request_id, request_timeout.as_millis() as u64))
                    }),
                }
            }
        }
    }
}

// ============================================================================
// Correlator - Resolution
// ============================================================================

impl Correlator {
    /// Delivers a `result` envelope to its waiting caller.
    ///
    /// Returns `false` for unknown, late, or duplicate results, which are
    /// discarded.
    pub fn resolve(&self, from: ConnectionId, result: ResultEnvelope) -> bool {
        let request_id = result.request_id;

        let pending = {
            let mut state = self.state.lock();
            state.registry.update_page(from, &result.url, &result.title);
            state.pending.remove(&request_id)
        };

        match pending {
            Some(pending) => {
                if pending.connection_id != from {
                    debug!(
                        %request_id,
                        expected = %pending.connection_id,
                        actual = %from,
                        "Result arrived on a different connection"
                    );
                }
                pending.resolve(request_id, Ok(result));
                true
            }
            None => {
                debug!(%request_id, connection_id = %from, "Discarding unmatched result");
                false
            }
        }
    }

    /// Resolves every request whose deadline has passed with a timeout.
    ///
    /// Covers callers that stopped waiting. Never fires before a deadline.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let expired: Vec<(RequestId, PendingRequest)> = {
            let mut state = self.state.lock();
            let ids: Vec<RequestId> = state
                .pending
                .iter()
                .filter(|(_, pending)| pending.deadline <= now)
                .map(|(id, _)| *id)
                .collect();

            ids.into_iter()
                .filter_map(|id| state.pending.remove(&id).map(|pending| (id, pending)))
                .collect()
        };

        let count = expired.len();
        for (request_id, pending) in expired {
            let timeout_ms = pending.deadline.duration_since(pending.created_at).as_millis() as u64;
            pending.resolve(request_id, Err(Error::timeout(request_id, timeout_ms)));
        }

        if count > 0 {
            debug!(count, "Swept expired requests");
        }

        count
    }

    /// Resolves one request, if still pending.
    fn resolve_with(&self, request_id: RequestId, outcome: Result<ResultEnvelope>) -> bool {
        let pending = self.state.lock().pending.remove(&request_id);
        match pending {
            Some(pending) => {
                pending.resolve(request_id, outcome);
                true
            }
            None => false,
        }
    }
}

// ============================================================================
// Correlator - Connections
// ============================================================================

impl Correlator {
    /// Registers a connection as the new front connection.
    ///
    /// # Errors
    ///
    /// See [`ConnectionRegistry::register`].
    pub fn register(&self, connection: Connection) -> Result<()> {
        self.state.lock().registry.register(connection)
    }

    /// Retires a connection and fails its outstanding requests with
    /// [`Error::ConnectionLost`]. Idempotent.
    ///
    /// Returns the number of requests failed.
    pub fn retire(&self, connection_id: ConnectionId) -> usize {
        let (retired, bound) = {
            let mut state = self.state.lock();
            let retired = state.registry.retire(connection_id);
            let bound = state.take_bound(connection_id);
            (retired, bound)
        };

        let count = bound.len();
        for (request_id, pending) in bound {
            pending.resolve(request_id, Err(Error::connection_lost(connection_id)));
        }

        if let Some(retired) = retired {
            info!(
                %connection_id,
                was_front = retired.was_front,
                failed = count,
                "Browser connection retired"
            );
        }

        count
    }

    /// Makes a registered connection the front connection.
    ///
    /// # Errors
    ///
    /// See [`ConnectionRegistry::promote`].
    pub fn promote(&self, connection_id: ConnectionId) -> Result<()> {
        self.state.lock().registry.promote(connection_id)
    }

    /// Returns the open front connection, if any.
    #[must_use]
    pub fn front(&self) -> Option<Connection> {
        self.state.lock().registry.front().cloned()
    }

    /// Sends an envelope to a specific registered connection.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if the connection is unknown or closed
    pub fn send_to(&self, connection_id: ConnectionId, envelope: Envelope) -> Result<()> {
        let connection = self
            .state
            .lock()
            .registry
            .get(connection_id)
            .map(|entry| entry.connection.clone())
            .ok_or(Error::ConnectionClosed)?;

        connection.send(envelope)
    }

    /// Records inbound activity on a connection.
    pub fn touch(&self, connection_id: ConnectionId) {
        self.state.lock().registry.touch(connection_id);
    }

    /// Stores the metadata a tab reported on connect.
    pub fn update_info(&self, connection_id: ConnectionId, info: BrowserInfo) {
        self.state.lock().registry.update_info(connection_id, info);
    }

    /// Retires every connection and fails every outstanding request.
    pub fn shutdown(&self) {
        let (connections, pending) = {
            let mut state = self.state.lock();
            let connections = state.registry.drain();
            let pending: Vec<_> = state.pending.drain().collect();
            (connections, pending)
        };

        let count = pending.len();
        for (request_id, pending) in pending {
            let connection_id = pending.connection_id;
            pending.resolve(request_id, Err(Error::connection_lost(connection_id)));
        }

        info!(
            connections = connections.len(),
            failed = count,
            "Correlator shut down"
        );
    }
}

// ============================================================================
// Correlator - Introspection
// ============================================================================

impl Correlator {
    /// Returns the number of requests awaiting a result.
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Returns the number of registered connections.
    #[inline]
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.state.lock().registry.len()
    }

    /// Returns metadata of the open front connection, if any.
    #[must_use]
    pub fn front_info(&self) -> Option<FrontStatus> {
        Self::front_status(&self.state.lock())
    }

    /// Returns a status snapshot.
    #[must_use]
    pub fn status(&self) -> BridgeStatus {
        let state = self.state.lock();
        let front = Self::front_status(&state);

        BridgeStatus {
            connected: front.is_some(),
            connections: state.registry.len(),
            pending: state.pending.len(),
            front,
        }
    }

    fn front_status(state: &CorrelatorState) -> Option<FrontStatus> {
        state.registry.front_entry().map(|entry| FrontStatus {
            connection_id: entry.connection.id(),
            user_agent: entry.info.user_agent.clone(),
            browser_name: entry.info.browser_name.clone(),
            url: entry.info.url.clone(),
            title: entry.info.title.clone(),
            connected_ms: entry.connected_at.elapsed().as_millis() as u64,
            idle_ms: entry.last_seen.elapsed().as_millis() as u64,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
