//! WebSocket connection to one browser tab.
//!
//! Each connection spawns a tokio task that owns the WebSocket stream and
//! handles:
//!
//! - Incoming frames from the tab, decoded into [`Envelope`] values and
//!   forwarded in arrival order as [`ConnectionEvent`]s
//! - Outgoing envelopes queued through the cloneable [`Connection`] handle
//! - Shutdown, after which the connection reports [`ConnectionEvent::Closed`]
//!
//! Correlation of results to requests does not happen here; the event
//! consumer owns that.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::ConnectionId;
use crate::protocol::Envelope;

// ============================================================================
// Types
// ============================================================================

/// Sender half of the shared inbound event channel.
pub type EventSender = mpsc::UnboundedSender<ConnectionEvent>;

/// Receiver half of the shared inbound event channel.
pub type EventReceiver = mpsc::UnboundedReceiver<ConnectionEvent>;

// ============================================================================
// ConnectionState
// ============================================================================

/// Transport state of a browser connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Upgraded, not yet registered.
    Connecting = 0,
    /// Registered and accepting envelopes.
    Open = 1,
    /// Transport gone. Terminal.
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            _ => Self::Closed,
        }
    }
}

// ============================================================================
// ConnectionEvent
// ============================================================================

/// Notifications produced by connection tasks.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A tab finished its WebSocket handshake.
    Opened(Connection),
    /// A decoded envelope from a tab.
    Envelope {
        /// Source connection.
        connection_id: ConnectionId,
        /// The envelope.
        envelope: Envelope,
    },
    /// The transport closed.
    Closed {
        /// The connection that closed.
        connection_id: ConnectionId,
    },
}

// ============================================================================
// ConnectionCommand
// ============================================================================

/// Internal commands for the event loop.
#[derive(Debug)]
pub(crate) enum ConnectionCommand {
    /// Serialize and write an envelope.
    Send(Envelope),
    /// Close the WebSocket.
    Shutdown,
}

// ============================================================================
// Connection
// ============================================================================

/// Handle to a browser tab's WebSocket link.
///
/// Cheap to clone; all clones drive the same event loop task.
/// Sending never blocks: envelopes are queued for the writer.
#[derive(Clone)]
pub struct Connection {
    /// Process-unique ID.
    id: ConnectionId,
    /// Remote address, when backed by a socket.
    peer: Option<SocketAddr>,
    /// Channel for sending commands to the event loop.
    command_tx: mpsc::UnboundedSender<ConnectionCommand>,
    /// Shared with the event loop.
    state: Arc<AtomicU8>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Creates a connection from an upgraded WebSocket stream.
    ///
    /// Emits [`ConnectionEvent::Opened`] before the event loop starts, so
    /// consumers always see `Opened` ahead of that connection's envelopes.
    pub(crate) fn new(
        ws_stream: WebSocketStream<TcpStream>,
        peer: SocketAddr,
        events: EventSender,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let connection = Self {
            id: ConnectionId::next(),
            peer: Some(peer),
            command_tx,
            state: Arc::new(AtomicU8::new(ConnectionState::Connecting as u8)),
        };

        let _ = events.send(ConnectionEvent::Opened(connection.clone()));

        tokio::spawn(Self::run_event_loop(
            connection.id,
            ws_stream,
            command_rx,
            Arc::clone(&connection.state),
            events,
        ));

        connection
    }

    /// Creates a connection with no socket behind it.
    ///
    /// Envelopes sent through the handle arrive on the returned receiver.
    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<ConnectionCommand>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let connection = Self {
            id: ConnectionId::next(),
            peer: None,
            command_tx,
            state: Arc::new(AtomicU8::new(ConnectionState::Connecting as u8)),
        };
        (connection, command_rx)
    }

    /// Returns the connection ID.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Returns the remote address.
    #[inline]
    #[must_use]
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Returns the current transport state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Returns `true` if the connection accepts envelopes.
    #[inline]
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Moves `connecting` to `open`. A closed connection stays closed.
    pub(crate) fn mark_open(&self) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Connecting as u8,
                ConnectionState::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
            || self.is_open()
    }

    /// Queues an envelope for the tab.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if the connection is not open
    pub fn send(&self, envelope: Envelope) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ConnectionClosed);
        }

        self.command_tx
            .send(ConnectionCommand::Send(envelope))
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Closes the connection. Idempotent.
    pub fn shutdown(&self) {
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
        let _ = self.command_tx.send(ConnectionCommand::Shutdown);
    }

    /// Event loop that handles WebSocket I/O.
    async fn run_event_loop(
        connection_id: ConnectionId,
        ws_stream: WebSocketStream<TcpStream>,
        mut command_rx: mpsc::UnboundedReceiver<ConnectionCommand>,
        state: Arc<AtomicU8>,
        events: EventSender,
    ) {
        let (mut ws_write, mut ws_read) = ws_stream.split();

        loop {
            tokio::select! {
                // Incoming frames from the tab
                message = ws_read.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            trace!(%connection_id, len = text.len(), "Frame received");
                            match Envelope::decode(text.as_str()) {
                                Ok(envelope) => {
                                    let _ = events.send(ConnectionEvent::Envelope {
                                        connection_id,
                                        envelope,
                                    });
                                }
                                Err(e) => {
                                    warn!(%connection_id, error = %e, "Dropping undecodable frame");
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) => {
                            debug!(%connection_id, "WebSocket closed by remote");
                            break;
                        }

                        Some(Err(e)) => {
                            error!(%connection_id, error = %e, "WebSocket error");
                            break;
                        }

                        None => {
                            debug!(%connection_id, "WebSocket stream ended");
                            break;
                        }

                        // Ignore Binary, Ping, Pong, Frame
                        _ => {}
                    }
                }

                // Commands from the bridge
                command = command_rx.recv() => {
                    match command {
                        Some(ConnectionCommand::Send(envelope)) => {
                            let json = match envelope.encode() {
                                Ok(json) => json,
                                Err(e) => {
                                    error!(%connection_id, error = %e, "Failed to encode envelope");
                                    continue;
                                }
                            };

                            if let Err(e) = ws_write.send(Message::Text(json.into())).await {
                                error!(%connection_id, error = %e, "Failed to write envelope");
                                break;
                            }

                            trace!(%connection_id, kind = envelope.kind(), "Envelope sent");
                        }

                        Some(ConnectionCommand::Shutdown) => {
                            debug!(%connection_id, "Shutdown command received");
                            let _ = ws_write.close().await;
                            break;
                        }

                        None => {
                            debug!(%connection_id, "Command channel closed");
                            break;
                        }
                    }
                }
            }
        }

        state.store(ConnectionState::Closed as u8, Ordering::Release);
        let _ = events.send(ConnectionEvent::Closed { connection_id });

        debug!(%connection_id, "Event loop terminated");
    }
}

// ============================================================================
// Tests
// ============================================================================
