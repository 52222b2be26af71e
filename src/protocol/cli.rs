//! CLI-facing request and response schema.
//!
//! The CLI talks JSON over HTTP and shares no wire format with the browser
//! channel.
//!
//! # Format
//!
//! Request:
//! ```json
//! { "code": "document.title", "timeoutMs": 5000 }
//! ```
//!
//! Response:
//! ```json
//! { "ok": true, "value": "Example Domain", "error": null, "url": "https://example.com/", "title": "Example Domain" }
//! { "ok": false, "value": null, "error": "no browser connected" }
//! ```

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::identifiers::ConnectionId;

// ============================================================================
// ExecuteRequest
// ============================================================================

/// An execution request from a CLI caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    /// JavaScript source to run in the front tab.
    pub code: String,

    /// Deadline in milliseconds. Server default when absent.
    #[serde(rename = "timeoutMs", default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl ExecuteRequest {
    /// Creates a request using the server's default timeout.
    #[inline]
    #[must_use]
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            timeout_ms: None,
        }
    }

    /// Sets an explicit timeout.
    #[inline]
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

// ============================================================================
// ExecutionOutput
// ============================================================================

/// Successful outcome of one execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutput {
    /// Evaluated value.
    pub value: Value,
    /// Page URL reported with the result, if any.
    pub url: Option<String>,
    /// Page title reported with the result, if any.
    pub title: Option<String>,
}

// ============================================================================
// ExecuteResponse
// ============================================================================

/// Terminal outcome returned to a CLI caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResponse {
    /// `true` when the code ran and produced a value.
    pub ok: bool,

    /// Evaluated value, `null` on failure.
    #[serde(default)]
    pub value: Value,

    /// Failure description, `null` on success.
    #[serde(default)]
    pub error: Option<String>,

    /// Page URL, when the browser reported one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Page title, when the browser reported one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl ExecuteResponse {
    /// Builds a success response.
    #[must_use]
    pub fn success(output: ExecutionOutput) -> Self {
        Self {
            ok: true,
            value: output.value,
            error: None,
            url: output.url,
            title: output.title,
        }
    }

    /// Builds a failure response from any crate error.
    #[must_use]
    pub fn failure(error: &Error) -> Self {
        Self {
            ok: false,
            value: Value::Null,
            error: Some(error.to_string()),
            url: None,
            title: None,
        }
    }
}

impl From<Result<ExecutionOutput>> for ExecuteResponse {
    fn from(outcome: Result<ExecutionOutput>) -> Self {
        match outcome {
            Ok(output) => Self::success(output),
            Err(e) => Self::failure(&e),
        }
    }
}

// ============================================================================
// BridgeStatus
// ============================================================================

/// Snapshot returned by `GET /status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStatus {
    /// Whether a front connection is available.
    pub connected: bool,
    /// Registered browser connections (front or not).
    pub connections: usize,
    /// Requests currently awaiting a result.
    pub pending: usize,
    /// Front connection details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub front: Option<FrontStatus>,
}

/// Details of the front connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrontStatus {
    /// Connection ID.
    pub connection_id: ConnectionId,
    /// Browser user agent.
    pub user_agent: String,
    /// Browser name.
    pub browser_name: String,
    /// Last known page URL.
    pub url: String,
    /// Last known page title.
    pub title: String,
    /// Milliseconds since the connection registered.
    pub connected_ms: u64,
    /// Milliseconds since the last inbound envelope.
    pub idle_ms: u64,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use crate::identifiers::RequestId;

    #[test]
    fn test_request_parses_camel_case_timeout() {
        let request: ExecuteRequest =
            serde_json::from_str(r#"{"code":"1+1","timeoutMs":5000}"#).expect("parse");
        assert_eq!(request, ExecuteRequest::new("1+1").with_timeout_ms(5000));
    }

    #[test]
    fn test_request_timeout_is_optional() {
        let request: ExecuteRequest = serde_json::from_str(r#"{"code":"1"}"#).expect("parse");
        assert_eq!(request.timeout_ms, None);
    }

    #[test]
    fn test_success_response_shape() {
        let response = ExecuteResponse::success(ExecutionOutput {
            value: json!(2),
            url: None,
            title: None,
        });
        let value = serde_json::to_value(&response).expect("serialize");
        assert_eq!(value, json!({"ok": true, "value": 2, "error": null}));
    }

    #[test]
    fn test_failure_response_uses_error_strings() {
        let response: ExecuteResponse = Err(Error::NoBrowserConnected).into();
        assert_eq!(
            serde_json::to_value(&response).expect("serialize"),
            json!({"ok": false, "value": null, "error": "no browser connected"})
        );

        let response: ExecuteResponse = Err(Error::timeout(RequestId::generate(), 10)).into();
        assert_eq!(response.error.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_status_serializes_camel_case() {
        let status = BridgeStatus {
            connected: false,
            connections: 0,
            pending: 0,
            front: None,
        };
        let value = serde_json::to_value(&status).expect("serialize");
        assert_eq!(value, json!({"connected": false, "connections": 0, "pending": 0}));
    }
}
