//! End-to-end tests: a real bridge server on loopback, driven by the crate's
//! own relay clients and lifecycle managers.

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use serde_json::{Value, json};
use reqwest::StatusCode;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use tab_bridge::relay::ScriptResult;
use tab_bridge::{
    BridgeConfig, BridgeServer, Completion, Error, ExecuteResponse, ExecutionRelay,
    LifecycleManager, LifecycleState, PermissionGate, RelayClient, RelayConfig, StaticPage,
};

// ============================================================================
// Fixtures
// ============================================================================

/// Evaluator standing in for a page's script engine.
///
/// - `sleep:<ms>:<value>` resolves to `<value>` after `<ms>`
/// - `hang` never settles
/// - anything containing `throw` fails with `Error: boom`
fn evaluate(code: &str) -> std::result::Result<Completion, String> {
    if let Some(rest) = code.strip_prefix("sleep:") {
        let (ms, value) = rest
            .split_once(':')
            .ok_or_else(|| "malformed sleep".to_string())?;
        let ms: u64 = ms.parse().map_err(|_| "malformed delay".to_string())?;
        let value = value.to_string();
        return Ok(Completion::deferred(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!(value))
        }));
    }

    match code {
        "1+1" => Ok(Completion::ready(json!(2))),
        "hang" => Ok(Completion::deferred(std::future::pending::<ScriptResult>())),
        c if c.contains("throw") => Err("Error: boom".to_string()),
        other => Ok(Completion::ready(Value::String(other.to_string()))),
    }
}

/// A relay running under a lifecycle manager.
struct Tab {
    visibility: watch::Sender<bool>,
    stop: watch::Sender<bool>,
    state: watch::Receiver<LifecycleState>,
    task: JoinHandle<()>,
}

impl Tab {
    fn spawn(config: RelayConfig, title: &str, gate: Option<Arc<PermissionGate>>) -> Self {
        let page = StaticPage::new(format!("https://{title}.test/"), title)
            .with_browser("TestBrowser", "TestAgent/1.0");
        let relay = ExecutionRelay::direct(Arc::new(evaluate), Arc::new(page));

        let mut manager = LifecycleManager::new(RelayClient::new(config, relay));
        if let Some(gate) = gate {
            manager = manager.with_permission_gate(gate);
        }
        let state = manager.subscribe();

        let (visibility, visibility_rx) = watch::channel(true);
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(manager.run(visibility_rx, stop_rx));

        Self {
            visibility,
            stop,
            state,
            task,
        }
    }

    async fn open(server: &BridgeServer, title: &str) -> Result<Self> {
        let tab = Self::spawn(RelayConfig::new(server.browser_url()), title, None);
        wait_for_front(server, title).await?;
        Ok(tab)
    }

    async fn wait_for(&mut self, state: LifecycleState) -> Result<()> {
        tokio::time::timeout(Duration::from_secs(3), self.state.wait_for(|s| *s == state))
            .await
            .with_context(|| format!("relay never reached {state}"))??;
        Ok(())
    }

    async fn close(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }
}

async fn start_server() -> Result<BridgeServer> {
    let config = BridgeConfig::builder()
        .browser_port(0)
        .cli_port(0)
        .build()?;
    Ok(BridgeServer::start(config).await?)
}

/// Waits until the front tab reports `title`.
async fn wait_for_front(server: &BridgeServer, title: &str) -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        let front_title = server.status().front.map(|front| front.title);
        if front_title.as_deref() == Some(title) {
            return Ok(());
        }
        if Instant::now() > deadline {
            return Err(anyhow!("{title} never became front (front: {front_title:?})"));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Posts one request to the CLI endpoint.
async fn post_execute(addr: SocketAddr, body: &Value) -> Result<(StatusCode, ExecuteResponse)> {
    let client = reqwest::Client::builder().no_proxy().build()?;
    let response = client
        .post(format!("http://{addr}/execute"))
        .json(body)
        .send()
        .await?;

    let status = response.status();
    Ok((status, response.json::<ExecuteResponse>().await?))
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn one_plus_one_over_http() -> Result<()> {
    let server = start_server().await?;
    let tab = Tab::open(&server, "calc").await?;

    let (status, response) =
        post_execute(server.cli_addr(), &json!({"code": "1+1", "timeoutMs": 5000})).await?;

    assert_eq!(status, StatusCode::OK);
    assert!(response.ok);
    assert_eq!(response.value, json!(2));
    assert_eq!(response.error, None);
    assert_eq!(response.title.as_deref(), Some("calc"));

    tab.close().await;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn thrown_error_reaches_caller() -> Result<()> {
    let server = start_server().await?;
    let tab = Tab::open(&server, "thrower").await?;

    let (status, response) =
        post_execute(server.cli_addr(), &json!({"code": "throw new Error('boom')"})).await?;

    assert_eq!(status, StatusCode::OK);
    assert!(!response.ok);
    assert!(response.error.as_deref().is_some_and(|e| e.contains("boom")));

    tab.close().await;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn no_browser_fails_immediately() -> Result<()> {
    let server = start_server().await?;
    let started = Instant::now();

    let (status, response) =
        post_execute(server.cli_addr(), &json!({"code": "1+1", "timeoutMs": 5000})).await?;

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(status, StatusCode::OK);
    assert!(!response.ok);
    assert_eq!(response.error.as_deref(), Some("no browser connected"));

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn invalid_timeout_is_bad_request() -> Result<()> {
    let server = start_server().await?;

    let (status, response) =
        post_execute(server.cli_addr(), &json!({"code": "1+1", "timeoutMs": 0})).await?;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(!response.ok);

    server.shutdown().await;
    Ok(())
}

// ============================================================================
// Properties
// ============================================================================

#[tokio::test]
async fn timeout_fires_on_time_and_late_result_is_dropped() -> Result<()> {
    let server = start_server().await?;
    let tab = Tab::open(&server, "slow").await?;

    let started = Instant::now();
    let result = server
        .execute("sleep:400:late", Some(Duration::from_millis(200)))
        .await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(Error::Timeout { .. })));
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_millis(1000));

    // The late result arrives and is discarded without disturbing anything.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(server.pending_count(), 0);
    let output = server.execute("1+1", None).await?;
    assert_eq!(output.value, json!(2));

    tab.close().await;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn out_of_order_results_match_their_callers() -> Result<()> {
    let server = start_server().await?;
    let tab = Tab::open(&server, "pipeline").await?;

    let slow = {
        let server = server.clone();
        tokio::spawn(async move { server.execute("sleep:300:slow", None).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let fast = server.execute("sleep:10:fast", None).await?;

    assert_eq!(fast.value, json!("fast"));
    assert!(!slow.is_finished());
    assert_eq!(slow.await??.value, json!("slow"));

    tab.close().await;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn hiding_front_tab_fails_outstanding_requests() -> Result<()> {
    let server = start_server().await?;
    let tab = Tab::open(&server, "hidden").await?;

    let calls: Vec<_> = (0..3)
        .map(|_| {
            let server = server.clone();
            tokio::spawn(async move { server.execute("hang", Some(Duration::from_secs(30))).await })
        })
        .collect();

    let deadline = Instant::now() + Duration::from_secs(2);
    while server.pending_count() < 3 {
        assert!(Instant::now() < deadline, "requests never became pending");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    tab.visibility.send(false)?;

    for call in calls {
        let result = tokio::time::timeout(Duration::from_secs(2), call).await??;
        assert!(matches!(result, Err(Error::ConnectionLost { .. })));
    }
    assert!(!server.status().connected);

    tab.close().await;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn promote_moves_execution_to_that_tab_only() -> Result<()> {
    let server = start_server().await?;
    let first = Tab::open(&server, "first").await?;
    let first_id = server
        .status()
        .front
        .ok_or_else(|| anyhow!("no front"))?
        .connection_id;
    let second = Tab::open(&server, "second").await?;

    let output = server.execute("who", None).await?;
    assert_eq!(output.title.as_deref(), Some("second"));

    server.promote(first_id)?;
    for _ in 0..3 {
        let output = server.execute("who", None).await?;
        assert_eq!(output.title.as_deref(), Some("first"));
    }

    first.close().await;
    second.close().await;
    server.shutdown().await;
    Ok(())
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn relay_reconnects_once_server_appears() -> Result<()> {
    // Reserve a port, then free it so the first attempt fails.
    let reserved = TcpListener::bind("127.0.0.1:0").await?;
    let port = reserved.local_addr()?.port();
    drop(reserved);

    let config = RelayConfig::new(format!("ws://127.0.0.1:{port}"))
        .with_reconnect_delay(Duration::from_millis(100))
        .with_connect_timeout(Duration::from_secs(1));
    let mut tab = Tab::spawn(config, "patient", None);

    tokio::time::sleep(Duration::from_millis(50)).await;

    let server = BridgeServer::start(
        BridgeConfig::builder()
            .browser_port(port)
            .cli_port(0)
            .build()?,
    )
    .await?;

    tab.wait_for(LifecycleState::Open).await?;
    wait_for_front(&server, "patient").await?;
    assert_eq!(server.execute("1+1", None).await?.value, json!(2));

    tab.close().await;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn visibility_round_trip_reconnects() -> Result<()> {
    let server = start_server().await?;
    let mut tab = Tab::open(&server, "flicker").await?;

    tab.visibility.send(false)?;
    tab.wait_for(LifecycleState::Disconnected).await?;

    let deadline = Instant::now() + Duration::from_secs(2);
    while server.status().connections > 0 {
        assert!(Instant::now() < deadline, "server kept the hidden tab");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    tab.visibility.send(true)?;
    tab.wait_for(LifecycleState::Open).await?;
    wait_for_front(&server, "flicker").await?;

    tab.close().await;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn denied_domain_never_connects() -> Result<()> {
    let server = start_server().await?;
    let dir = tempfile::TempDir::new()?;
    let gate = Arc::new(PermissionGate::open(
        dir.path().join("allow.json"),
        |_: &str| false,
    )?);

    let tab = Tab::spawn(
        RelayConfig::new(server.browser_url()),
        "blocked",
        Some(gate),
    );

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(*tab.state.borrow(), LifecycleState::Disconnected);
    assert_eq!(server.status().connections, 0);

    tab.close().await;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn approved_domain_connects() -> Result<()> {
    let server = start_server().await?;
    let dir = tempfile::TempDir::new()?;
    let gate = Arc::new(PermissionGate::open(
        dir.path().join("allow.json"),
        |_: &str| true,
    )?);

    let tab = Tab::spawn(
        RelayConfig::new(server.browser_url()),
        "welcome",
        Some(Arc::clone(&gate)),
    );

    wait_for_front(&server, "welcome").await?;
    assert!(gate.allowed("welcome.test"));

    tab.close().await;
    server.shutdown().await;
    Ok(())
}
