//! Browser-facing envelope types.
//!
//! Every WebSocket text frame between the bridge and a browser tab carries
//! exactly one [`Envelope`], tagged by `type`.
//!
//! # Format
//!
//! ```json
//! {"type": "execute", "request_id": "uuid", "code": "1 + 1"}
//! {"type": "result", "request_id": "uuid", "ok": true, "result": 2, "error": null, "url": "...", "title": "..."}
//! {"type": "ping"}
//! {"type": "pong"}
//! {"type": "browser_info", "userAgent": "...", "browserName": "...", "url": "...", "title": "..."}
//! ```
//!
//! The `code` field carries the caller's source verbatim. It is never
//! spliced into a wrapper script, so no escaping is applied anywhere.

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::{Value, from_str, to_string};

use crate::error::Result;
use crate::identifiers::RequestId;

// ============================================================================
// Envelope
// ============================================================================

/// A typed message on the browser channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// Bridge → browser: run code in the page.
    Execute(ExecuteEnvelope),
    /// Browser → bridge: outcome of one `execute`.
    Result(ResultEnvelope),
    /// Keepalive ping (either direction).
    Ping,
    /// Keepalive answer (either direction).
    Pong,
    /// Browser → bridge, once per connection. Informational only.
    BrowserInfo(BrowserInfo),
}

impl Envelope {
    /// Creates an `execute` envelope.
    #[inline]
    #[must_use]
    pub fn execute(request_id: RequestId, code: impl Into<String>) -> Self {
        Self::Execute(ExecuteEnvelope {
            request_id,
            code: code.into(),
        })
    }

    /// Returns the wire tag of this envelope.
    #[inline]
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Execute(_) => "execute",
            Self::Result(_) => "result",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::BrowserInfo(_) => "browser_info",
        }
    }

    /// Serializes to a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`](crate::Error::Json) if serialization fails.
    pub fn encode(&self) -> Result<String> {
        Ok(to_string(self)?)
    }

    /// Parses a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`](crate::Error::Json) for malformed JSON, an
    /// unknown `type`, or missing required fields.
    pub fn decode(text: &str) -> Result<Self> {
        Ok(from_str(text)?)
    }
}

// ============================================================================
// ExecuteEnvelope
// ============================================================================

/// Payload of an `execute` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteEnvelope {
    /// Correlation identifier, echoed back in the `result`.
    pub request_id: RequestId,
    /// Source to evaluate, untouched.
    pub code: String,
}

// ============================================================================
// ResultEnvelope
// ============================================================================

/// Payload of a `result` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    /// Matches the `execute` request ID.
    pub request_id: RequestId,

    /// Whether evaluation completed without throwing.
    pub ok: bool,

    /// Evaluated value (`null` when absent or on error).
    #[serde(default)]
    pub result: Value,

    /// Error description when `ok` is false.
    #[serde(default)]
    pub error: Option<String>,

    /// Page URL at the time of evaluation.
    #[serde(default)]
    pub url: String,

    /// Page title at the time of evaluation.
    #[serde(default)]
    pub title: String,
}

impl ResultEnvelope {
    /// Creates a successful result.
    #[must_use]
    pub fn success(request_id: RequestId, value: Value) -> Self {
        Self {
            request_id,
            ok: true,
            result: value,
            error: None,
            url: String::new(),
            title: String::new(),
        }
    }

    /// Creates a failed result.
    #[must_use]
    pub fn failure(request_id: RequestId, error: impl Into<String>) -> Self {
        Self {
            request_id,
            ok: false,
            result: Value::Null,
            error: Some(error.into()),
            url: String::new(),
            title: String::new(),
        }
    }

    /// Stamps the page location onto the result.
    #[must_use]
    pub fn with_page(mut self, url: impl Into<String>, title: impl Into<String>) -> Self {
        self.url = url.into();
        self.title = title.into();
        self
    }

    /// Returns the error text, falling back to a generic message.
    #[must_use]
    pub fn error_message(&self) -> &str {
        self.error.as_deref().unwrap_or("unknown error")
    }
}

// ============================================================================
// BrowserInfo
// ============================================================================

/// Descriptive metadata a tab sends when it connects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserInfo {
    /// Navigator user agent string.
    #[serde(rename = "userAgent", default)]
    pub user_agent: String,

    /// Short browser name (e.g. "Chrome").
    #[serde(rename = "browserName", default)]
    pub browser_name: String,

    /// Page URL.
    #[serde(default)]
    pub url: String,

    /// Page title.
    #[serde(default)]
    pub title: String,
}

// ============================================================================
// Tests
// ============================================================================
