//! Browser-side WebSocket client.
//!
//! # Session Flow
//!
//! 1. [`RelayClient::connect`] dials the bridge within the connect timeout
//! 2. The page's `browser_info` is sent once
//! 3. [`RelaySession::run`] serves `execute` envelopes until the transport
//!    closes or the caller stops it
//!
//! Each `execute` runs on its own task, so results may go out in a
//! different order than the requests came in. Those tasks belong to the
//! session and are aborted when it ends.

// ============================================================================
// Imports
// ============================================================================

use std::future::Future;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, trace, warn};

use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::protocol::{Envelope, ResultEnvelope};

use super::executor::ExecutionRelay;

// ============================================================================
// Types
// ============================================================================

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

// ============================================================================
// SessionEnd
// ============================================================================

/// Why a session loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The local side asked it to stop.
    Stopped,
    /// The transport closed or failed.
    Closed,
}

// ============================================================================
// RelayClient
// ============================================================================

/// Connects an [`ExecutionRelay`] to the bridge.
#[derive(Debug, Clone)]
pub struct RelayClient {
    config: RelayConfig,
    relay: ExecutionRelay,
}

impl RelayClient {
    /// Creates a client. Nothing is dialled until [`connect`](Self::connect).
    #[must_use]
    pub fn new(config: RelayConfig, relay: ExecutionRelay) -> Self {
        Self { config, relay }
    }

    /// Returns the client options.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Returns the relay that serves `execute` envelopes.
    #[inline]
    #[must_use]
    pub fn relay(&self) -> &ExecutionRelay {
        &self.relay
    }

    /// Dials the bridge and announces the page.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the options are invalid
    /// - [`Error::Connection`] if the connect timeout elapses
    /// - [`Error::WebSocket`] if the handshake fails
    pub async fn connect(&self) -> Result<RelaySession> {
        self.config.validate()?;

        let url = self.config.server_url.as_str();
        debug!(%url, "Connecting to bridge");

        let (ws, _) = timeout(self.config.connect_timeout, connect_async(url))
            .await
            .map_err(|_| {
                Error::connection(format!(
                    "connect to {url} timed out after {}ms",
                    self.config.connect_timeout.as_millis()
                ))
            })??;

        let mut session = RelaySession {
            ws,
            relay: self.relay.clone(),
            keepalive_interval: self.config.keepalive_interval,
        };

        let info = Envelope::BrowserInfo(self.relay.page().browser_info());
        session.send(&info).await?;

        info!(%url, mode = self.relay.mode().name(), "Connected to bridge");
        Ok(session)
    }
}

// ============================================================================
// RelaySession
// ============================================================================

/// One open connection to the bridge.
#[derive(Debug)]
pub struct RelaySession {
    ws: WsStream,
    relay: ExecutionRelay,
    keepalive_interval: Duration,
}

impl RelaySession {
    /// Sends one envelope outside the session loop.
    async fn send(&mut self, envelope: &Envelope) -> Result<()> {
        let json = envelope.encode()?;
        self.ws.send(Message::Text(json.into())).await?;
        Ok(())
    }

    /// Serves the connection until the transport ends or `stop` completes.
    ///
    /// On stop, a close frame is sent before returning.
    pub async fn run<S>(self, stop: S) -> SessionEnd
    where
        S: Future<Output = ()>,
    {
        let (mut sink, mut stream) = self.ws.split();
        let mut executions: JoinSet<ResultEnvelope> = JoinSet::new();

        let mut keepalive = interval_at(
            Instant::now() + self.keepalive_interval,
            self.keepalive_interval,
        );
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::pin!(stop);

        let end = loop {
            tokio::select! {
                () = &mut stop => break SessionEnd::Stopped,

                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        let reply = match Envelope::decode(text.as_str()) {
                            Ok(Envelope::Execute(execute)) => {
                                let relay = self.relay.clone();
                                trace!(request_id = %execute.request_id, "Execute received");
                                executions.spawn(async move { relay.execute(execute).await });
                                None
                            }
                            Ok(Envelope::Ping) => Some(Envelope::Pong),
                            Ok(Envelope::Pong) => {
                                trace!("Keepalive acknowledged");
                                None
                            }
                            Ok(other) => {
                                debug!(kind = other.kind(), "Ignoring unexpected envelope");
                                None
                            }
                            Err(e) => {
                                warn!(error = %e, "Dropping undecodable frame");
                                None
                            }
                        };

                        if let Some(reply) = reply
                            && send(&mut sink, &reply).await.is_err()
                        {
                            break SessionEnd::Closed;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break SessionEnd::Closed,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "Bridge transport failed");
                        break SessionEnd::Closed;
                    }
                },

                Some(joined) = executions.join_next(), if !executions.is_empty() => match joined {
                    Ok(result) => {
                        if send(&mut sink, &Envelope::Result(result)).await.is_err() {
                            break SessionEnd::Closed;
                        }
                    }
                    Err(e) => warn!(error = %e, "Execution task failed"),
                },

                _ = keepalive.tick() => {
                    trace!("Sending keepalive");
                    if send(&mut sink, &Envelope::Ping).await.is_err() {
                        break SessionEnd::Closed;
                    }
                }
            }
        };

        if !executions.is_empty() {
            debug!(abandoned = executions.len(), "Aborting unfinished executions");
            executions.abort_all();
        }

        if end == SessionEnd::Stopped {
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        }

        info!(?end, "Bridge session ended");
        end
    }
}

/// Encodes and writes one envelope.
async fn send(sink: &mut WsSink, envelope: &Envelope) -> Result<()> {
    let json = envelope.encode()?;
    sink.send(Message::Text(json.into())).await?;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio_tungstenite::accept_async;

    use crate::identifiers::RequestId;
    use crate::relay::executor::{Completion, ScriptResult, StaticPage};

    fn relay() -> ExecutionRelay {
        ExecutionRelay::direct(
            Arc::new(|code: &str| match code {
                "throw" => Err("boom".to_string()),
                other => Ok(Completion::ready(json!(other.len()))),
            }),
            Arc::new(StaticPage::new("https://example.com/", "Example").with_browser("Test", "UA")),
        )
    }

    async fn bridge() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let url = format!("ws://{}", listener.local_addr().expect("addr"));
        (listener, url)
    }

    async fn next_envelope(ws: &mut WebSocketStream<TcpStream>) -> Envelope {
        loop {
            match ws.next().await.expect("frame").expect("ok") {
                Message::Text(text) => return Envelope::decode(text.as_str()).expect("decode"),
                _ => continue,
            }
        }
    }

    async fn send_envelope(ws: &mut WebSocketStream<TcpStream>, envelope: &Envelope) {
        let json = envelope.encode().expect("encode");
        ws.send(Message::Text(json.into())).await.expect("send");
    }

    #[tokio::test]
    async fn test_session_announces_and_executes() {
        let (listener, url) = bridge().await;
        let client = RelayClient::new(RelayConfig::new(url), relay());

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = accept_async(stream).await.expect("upgrade");

            let Envelope::BrowserInfo(info) = next_envelope(&mut ws).await else {
                panic!("expected browser_info first");
            };
            assert_eq!(info.browser_name, "Test");

            let request_id = RequestId::generate();
            send_envelope(&mut ws, &Envelope::execute(request_id, "abcd")).await;
            let Envelope::Result(result) = next_envelope(&mut ws).await else {
                panic!("expected result");
            };
            assert_eq!(result.request_id, request_id);
            assert_eq!(result.result, json!(4));
            assert_eq!(result.url, "https://example.com/");

            send_envelope(&mut ws, &Envelope::Ping).await;
            assert_eq!(next_envelope(&mut ws).await, Envelope::Pong);

            ws.close(None).await.expect("close");
        });

        let session = client.connect().await.expect("connect");
        let end = session.run(std::future::pending()).await;

        assert_eq!(end, SessionEnd::Closed);
        server.await.expect("server");
    }

    #[tokio::test]
    async fn test_keepalive_pings() {
        let (listener, url) = bridge().await;
        let config = RelayConfig::new(url).with_keepalive_interval(Duration::from_millis(50));
        let client = RelayClient::new(config, relay());

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = accept_async(stream).await.expect("upgrade");
            next_envelope(&mut ws).await;
            assert_eq!(next_envelope(&mut ws).await, Envelope::Ping);
        });

        let session = client.connect().await.expect("connect");
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let run = tokio::spawn(session.run(async move {
            let _ = stop_rx.await;
        }));

        server.await.expect("server saw a ping");
        let _ = stop_tx.send(());
        let _ = run.await.expect("join");
    }

    #[tokio::test]
    async fn test_stop_ends_session() {
        let (listener, url) = bridge().await;
        let client = RelayClient::new(RelayConfig::new(url), relay());

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = accept_async(stream).await.expect("upgrade");
            next_envelope(&mut ws).await;
            // Drain until the close frame arrives.
            while let Some(Ok(frame)) = ws.next().await {
                if frame.is_close() {
                    break;
                }
            }
        });

        let session = client.connect().await.expect("connect");
        let end = session.run(async {}).await;

        assert_eq!(end, SessionEnd::Stopped);
        server.await.expect("server");
    }

    /// Fires when dropped.
    struct DropSignal(Option<oneshot::Sender<()>>);

    impl Drop for DropSignal {
        fn drop(&mut self) {
            if let Some(tx) = self.0.take() {
                let _ = tx.send(());
            }
        }
    }

    #[tokio::test]
    async fn test_unfinished_executions_aborted_on_close() {
        let (listener, url) = bridge().await;
        let (started_tx, started_rx) = oneshot::channel::<()>();
        let (dropped_tx, dropped_rx) = oneshot::channel::<()>();
        let started = Arc::new(parking_lot::Mutex::new(Some(started_tx)));
        let signal = Arc::new(parking_lot::Mutex::new(Some(dropped_tx)));

        let hanging = ExecutionRelay::direct(
            Arc::new(move |_: &str| -> std::result::Result<Completion, String> {
                if let Some(tx) = started.lock().take() {
                    let _ = tx.send(());
                }
                let guard = DropSignal(signal.lock().take());
                Ok(Completion::deferred(async move {
                    let _guard = guard;
                    std::future::pending::<ScriptResult>().await
                }))
            }),
            Arc::new(StaticPage::new("https://example.com/", "Example")),
        );
        let client = RelayClient::new(RelayConfig::new(url), hanging);

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = accept_async(stream).await.expect("upgrade");
            next_envelope(&mut ws).await;
            send_envelope(&mut ws, &Envelope::execute(RequestId::generate(), "hang")).await;
            started_rx.await.expect("execute started");
            ws.close(None).await.expect("close");
        });

        let session = client.connect().await.expect("connect");
        assert_eq!(session.run(std::future::pending()).await, SessionEnd::Closed);
        server.await.expect("server");

        tokio::time::timeout(Duration::from_secs(1), dropped_rx)
            .await
            .expect("continuation outlived the session")
            .expect("signal");
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let (listener, url) = bridge().await;
        drop(listener);

        let client = RelayClient::new(
            RelayConfig::new(url).with_connect_timeout(Duration::from_secs(1)),
            relay(),
        );
        assert!(client.connect().await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_url_is_config_error() {
        let client = RelayClient::new(RelayConfig::new("http://127.0.0.1:1"), relay());
        assert!(matches!(client.connect().await, Err(Error::Config { .. })));
    }
}
