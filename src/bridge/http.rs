//! CLI-facing HTTP endpoint.
//!
//! | Route | Body | Response |
//! |-------|------|----------|
//! | `POST /execute` | [`ExecuteRequest`] | [`ExecuteResponse`] |
//! | `GET /status` | none | [`BridgeStatus`] |
//!
//! Every terminal outcome of an execution, including "no browser
//! connected" and "timeout", is a `200` with `ok: false`. Only malformed
//! or invalid input is a `400`.

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::error::Error;
use crate::protocol::{BridgeStatus, ExecuteRequest, ExecuteResponse};

use super::server::BridgeServer;

// ============================================================================
// Router
// ============================================================================

/// Builds the CLI router around a running server.
pub fn router(server: BridgeServer) -> Router {
    Router::new()
        .route("/execute", post(handle_execute))
        .route("/status", get(handle_status))
        .with_state(server)
}

/// Serves the router until `shutdown` flips to `true`.
pub(crate) async fn serve(
    listener: TcpListener,
    server: BridgeServer,
    mut shutdown: watch::Receiver<bool>,
) {
    let addr = listener.local_addr().ok();
    info!(?addr, "Accepting CLI requests");

    let result = axum::serve(listener, router(server))
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await;

    if let Err(e) = result {
        error!(error = %e, "CLI endpoint failed");
    }

    debug!("CLI endpoint terminated");
}

// ============================================================================
// Handlers
// ============================================================================

async fn handle_execute(
    State(server): State<BridgeServer>,
    body: Result<Json<ExecuteRequest>, JsonRejection>,
) -> (StatusCode, Json<ExecuteResponse>) {
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            debug!(error = %rejection.body_text(), "Malformed execute request");
            let error = Error::invalid_argument(rejection.body_text());
            return (StatusCode::BAD_REQUEST, Json(ExecuteResponse::failure(&error)));
        }
    };

    let timeout = request.timeout_ms.map(Duration::from_millis);
    let outcome = server.execute(request.code, timeout).await;

    let status = match &outcome {
        Err(e) if e.is_invalid_input() => StatusCode::BAD_REQUEST,
        _ => StatusCode::OK,
    };

    (status, Json(ExecuteResponse::from(outcome)))
}

async fn handle_status(State(server): State<BridgeServer>) -> Json<BridgeStatus> {
    Json(server.status())
}

// ============================================================================
// Tests
// ============================================================================
