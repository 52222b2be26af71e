//! WebSocket listener that browser tabs connect to.
//!
//! # Connection Flow
//!
//! 1. Bridge binds the listener to a loopback address
//! 2. A tab's content script (or extension) dials `ws://127.0.0.1:{port}`
//! 3. Non-loopback peers are dropped before the upgrade
//! 4. The WebSocket handshake completes and a [`Connection`] is created
//! 5. The connection announces itself with [`ConnectionEvent::Opened`]
//!
//! [`ConnectionEvent::Opened`]: super::ConnectionEvent::Opened

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

use super::Connection;
use super::connection::EventSender;

// ============================================================================
// Constants
// ============================================================================

/// Timeout for the WebSocket upgrade after TCP accept.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// BrowserListener
// ============================================================================

/// A bound WebSocket listener for browser connections.
///
/// # Example
///
/// ```ignore
/// use std::net::{IpAddr, Ipv4Addr};
/// use tab_bridge::transport::BrowserListener;
///
/// let listener = BrowserListener::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).await?;
/// println!("tabs connect to {}", listener.ws_url());
/// ```
pub struct BrowserListener {
    /// TCP listener for incoming connections.
    listener: TcpListener,
    /// Bound address.
    local_addr: SocketAddr,
}

impl BrowserListener {
    /// Binds to the given address. Port 0 picks a free port.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if binding fails.
    pub async fn bind(ip: IpAddr, port: u16) -> Result<Self> {
        let listener = TcpListener::bind(SocketAddr::new(ip, port)).await?;
        let local_addr = listener.local_addr()?;

        debug!(%local_addr, "Browser listener bound");

        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Returns the port the listener is bound to.
    #[inline]
    #[must_use]
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Returns the bound socket address.
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the WebSocket URL tabs should dial.
    #[inline]
    #[must_use]
    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    /// Accepts connections until `shutdown` flips to `true`.
    ///
    /// Each accepted socket is upgraded on its own task; every resulting
    /// [`Connection`] reports through `events`.
    pub async fn run(self, events: EventSender, mut shutdown: watch::Receiver<bool>) {
        info!(addr = %self.local_addr, "Accepting browser connections");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Accept loop shutting down");
                        break;
                    }
                }

                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            let events = events.clone();
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, addr, events).await {
                                    warn!(error = %e, ?addr, "Browser connection handling failed");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Accept failed");
                        }
                    }
                }
            }
        }

        debug!("Accept loop terminated");
    }

    /// Upgrades a single accepted socket.
    async fn handle_connection(stream: TcpStream, addr: SocketAddr, events: EventSender) -> Result<()> {
        if !addr.ip().is_loopback() {
            warn!(?addr, "Rejecting non-loopback browser connection");
            return Err(Error::connection(format!("peer {addr} is not loopback")));
        }

        debug!(?addr, "New TCP connection");

        let ws_stream = timeout(HANDSHAKE_TIMEOUT, tokio_tungstenite::accept_async(stream))
            .await
            .map_err(|_| Error::connection("WebSocket upgrade timed out"))?
            .map_err(|e| Error::connection(format!("WebSocket upgrade failed: {e}")))?;

        let connection = Connection::new(ws_stream, addr, events);
        info!(connection_id = %connection.id(), ?addr, "Browser connection established");

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
