//! Browser-side execution of `execute` envelopes.
//!
//! The page is abstracted behind three traits so the relay can run against
//! a real page binding, a companion process, or a test double:
//!
//! | Trait | Role |
//! |-------|------|
//! | [`Evaluator`] | Direct in-page evaluation |
//! | [`Injector`] | Privileged injection that ignores page script policy |
//! | [`PageContext`] | Page url, title and browser metadata |
//!
//! Whatever the mode, [`ExecutionRelay::execute`] always produces exactly one
//! [`ResultEnvelope`]. Thrown errors, rejected continuations and panics all
//! become `ok: false`.

// ============================================================================
// Imports
// ============================================================================

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::result::Result as StdResult;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::protocol::{BrowserInfo, ExecuteEnvelope, ResultEnvelope};

// ============================================================================
// Types
// ============================================================================

/// Outcome of running script: a value, or the error's string description.
pub type ScriptResult = StdResult<Value, String>;

/// Queue depth of the companion channel.
const COMPANION_QUEUE: usize = 64;

// ============================================================================
// Completion
// ============================================================================

/// Immediate result of a direct evaluation.
pub enum Completion {
    /// The code evaluated to a plain value.
    Ready(Value),
    /// The code evaluated to a then-able; await it for the final value.
    Deferred(BoxFuture<'static, ScriptResult>),
}

impl Completion {
    /// Wraps a plain value.
    #[inline]
    #[must_use]
    pub fn ready(value: Value) -> Self {
        Self::Ready(value)
    }

    /// Wraps a continuation.
    #[inline]
    #[must_use]
    pub fn deferred<F>(future: F) -> Self
    where
        F: Future<Output = ScriptResult> + Send + 'static,
    {
        Self::Deferred(future.boxed())
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(value) => f.debug_tuple("Ready").field(value).finish(),
            Self::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Evaluates code inside the page's own script context.
///
/// Subject to the page's script policy.
pub trait Evaluator: Send + Sync {
    /// Evaluates `code`. `Err` carries the thrown error's description.
    fn evaluate(&self, code: &str) -> StdResult<Completion, String>;
}

impl<F> Evaluator for F
where
    F: Fn(&str) -> StdResult<Completion, String> + Send + Sync,
{
    fn evaluate(&self, code: &str) -> StdResult<Completion, String> {
        self(code)
    }
}

/// Runs code through a higher-trust channel attached to the browser.
///
/// Not subject to the page's script policy.
#[async_trait]
pub trait Injector: Send + Sync {
    /// Injects `code` and awaits its final value.
    async fn inject(&self, code: &str) -> ScriptResult;
}

/// Describes the page a relay runs in.
pub trait PageContext: Send + Sync {
    /// Current page URL.
    fn url(&self) -> String;

    /// Current page title.
    fn title(&self) -> String;

    /// Browser user agent.
    fn user_agent(&self) -> String;

    /// Short browser name.
    fn browser_name(&self) -> String;

    /// `false` inside embedded frames.
    fn is_top_level(&self) -> bool {
        true
    }

    /// Metadata announced once per connection.
    fn browser_info(&self) -> BrowserInfo {
        BrowserInfo {
            user_agent: self.user_agent(),
            browser_name: self.browser_name(),
            url: self.url(),
            title: self.title(),
        }
    }
}

// ============================================================================
// StaticPage
// ============================================================================

/// A [`PageContext`] with fixed values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticPage {
    /// Page URL.
    pub url: String,
    /// Page title.
    pub title: String,
    /// User agent string.
    pub user_agent: String,
    /// Browser name.
    pub browser_name: String,
    /// Top-level flag.
    pub top_level: bool,
}

impl StaticPage {
    /// Creates a top-level page.
    #[must_use]
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            user_agent: String::new(),
            browser_name: String::new(),
            top_level: true,
        }
    }

    /// Sets browser metadata.
    #[must_use]
    pub fn with_browser(
        mut self,
        browser_name: impl Into<String>,
        user_agent: impl Into<String>,
    ) -> Self {
        self.browser_name = browser_name.into();
        self.user_agent = user_agent.into();
        self
    }

    /// Marks the page as an embedded frame.
    #[must_use]
    pub fn embedded(mut self) -> Self {
        self.top_level = false;
        self
    }
}

impl PageContext for StaticPage {
    fn url(&self) -> String {
        self.url.clone()
    }

    fn title(&self) -> String {
        self.title.clone()
    }

    fn user_agent(&self) -> String {
        self.user_agent.clone()
    }

    fn browser_name(&self) -> String {
        self.browser_name.clone()
    }

    fn is_top_level(&self) -> bool {
        self.top_level
    }
}

// ============================================================================
// CompanionHandle
// ============================================================================

/// One injection handed to the companion task.
struct CompanionJob {
    code: String,
    reply: oneshot::Sender<ScriptResult>,
}

/// Sending half of the privileged companion channel.
#[derive(Clone)]
pub struct CompanionHandle {
    tx: mpsc::Sender<CompanionJob>,
}

impl fmt::Debug for CompanionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompanionHandle")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl CompanionHandle {
    /// Spawns the companion task that owns `injector`.
    ///
    /// Each job runs on its own task, so injections may finish out of order.
    /// The task ends once every handle is dropped.
    pub fn spawn(injector: Arc<dyn Injector>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<CompanionJob>(COMPANION_QUEUE);

        let task = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let injector = Arc::clone(&injector);
                tokio::spawn(async move {
                    let outcome = AssertUnwindSafe(injector.inject(&job.code))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|payload| Err(panic_message(payload.as_ref())));
                    let _ = job.reply.send(outcome);
                });
            }
            debug!("Companion channel closed");
        });

        (Self { tx }, task)
    }

    /// Sends `code` to the companion and awaits its result.
    ///
    /// A dead companion yields `Err`, never a hang.
    pub async fn inject(&self, code: String) -> ScriptResult {
        let (reply, rx) = oneshot::channel();

        self.tx
            .send(CompanionJob { code, reply })
            .await
            .map_err(|_| "privileged companion is not running".to_string())?;

        rx.await
            .map_err(|_| "privileged companion dropped the request".to_string())?
    }
}

// ============================================================================
// ExecutionMode
// ============================================================================

/// How a relay runs code. Fixed per deployment.
#[derive(Clone)]
pub enum ExecutionMode {
    /// Evaluate in the page's script context.
    Direct(Arc<dyn Evaluator>),
    /// Inject through the privileged companion.
    Privileged(CompanionHandle),
}

impl ExecutionMode {
    /// Returns `"direct"` or `"privileged"`.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Direct(_) => "direct",
            Self::Privileged(_) => "privileged",
        }
    }
}

impl fmt::Debug for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// ExecutionRelay
// ============================================================================

/// Turns `execute` envelopes into `result` envelopes.
///
/// # Example
///
/// ```ignore
/// let relay = ExecutionRelay::direct(Arc::new(evaluator), Arc::new(page));
/// let result = relay.execute(execute).await;
/// assert_eq!(result.request_id, execute_id);
/// ```
#[derive(Clone)]
pub struct ExecutionRelay {
    mode: ExecutionMode,
    page: Arc<dyn PageContext>,
}

impl fmt::Debug for ExecutionRelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionRelay")
            .field("mode", &self.mode)
            .field("url", &self.page.url())
            .finish()
    }
}

impl ExecutionRelay {
    /// Creates a relay with an explicit mode.
    #[must_use]
    pub fn new(mode: ExecutionMode, page: Arc<dyn PageContext>) -> Self {
        Self { mode, page }
    }

    /// Creates a relay that evaluates in-page.
    #[must_use]
    pub fn direct(evaluator: Arc<dyn Evaluator>, page: Arc<dyn PageContext>) -> Self {
        Self::new(ExecutionMode::Direct(evaluator), page)
    }

    /// Creates a relay that injects through the companion.
    #[must_use]
    pub fn privileged(companion: CompanionHandle, page: Arc<dyn PageContext>) -> Self {
        Self::new(ExecutionMode::Privileged(companion), page)
    }

    /// Returns the execution mode.
    #[inline]
    #[must_use]
    pub fn mode(&self) -> &ExecutionMode {
        &self.mode
    }

    /// Returns the page context.
    #[inline]
    #[must_use]
    pub fn page(&self) -> &Arc<dyn PageContext> {
        &self.page
    }

    /// Runs one `execute` envelope. Always returns its `result` envelope.
    pub async fn execute(&self, execute: ExecuteEnvelope) -> ResultEnvelope {
        let ExecuteEnvelope { request_id, code } = execute;

        let outcome = match &self.mode {
            ExecutionMode::Direct(evaluator) => run_direct(evaluator.as_ref(), &code).await,
            ExecutionMode::Privileged(companion) => companion.inject(code).await,
        };

        let result = match outcome {
            Ok(value) => ResultEnvelope::success(request_id, value),
            Err(message) => {
                debug!(%request_id, mode = self.mode.name(), error = %message, "Script failed");
                ResultEnvelope::failure(request_id, message)
            }
        };

        result.with_page(self.page.url(), self.page.title())
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Evaluates, then awaits any continuation, catching panics on both legs.
async fn run_direct(evaluator: &dyn Evaluator, code: &str) -> ScriptResult {
    let completion = match panic::catch_unwind(AssertUnwindSafe(|| evaluator.evaluate(code))) {
        Ok(completion) => completion?,
        Err(payload) => return Err(panic_message(payload.as_ref())),
    };

    match completion {
        Completion::Ready(value) => Ok(value),
        Completion::Deferred(future) => AssertUnwindSafe(future)
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(panic_message(payload.as_ref()))),
    }
}

/// Extracts a readable message from a panic payload.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "evaluation panicked".to_string()
    };

    warn!(%message, "Evaluation panicked");
    message
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use serde_json::json;

    use crate::identifiers::RequestId;

    /// Tiny evaluator understanding a handful of fixed snippets.
    fn toy_evaluator(code: &str) -> StdResult<Completion, String> {
        match code {
            "1+1" => Ok(Completion::ready(json!(2))),
            "throw 'boom'" => Err("boom".into()),
            "Promise.resolve(7)" => Ok(Completion::deferred(async { Ok(json!(7)) })),
            "Promise.reject('nope')" => Ok(Completion::deferred(async { Err("nope".into()) })),
            "panic" => panic!("evaluator blew up"),
            "deferred panic" => Ok(Completion::deferred(explode())),
            other => Ok(Completion::ready(Value::String(other.to_string()))),
        }
    }

    async fn explode() -> ScriptResult {
        panic!("continuation blew up")
    }

    struct EchoInjector;

    #[async_trait]
    impl Injector for EchoInjector {
        async fn inject(&self, code: &str) -> ScriptResult {
            match code {
                "throw 'boom'" => Err("boom".into()),
                "slow" => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(json!("slow"))
                }
                "1+1" => Ok(json!(2)),
                other => Ok(Value::String(other.to_string())),
            }
        }
    }

    fn page() -> Arc<dyn PageContext> {
        Arc::new(StaticPage::new("https://example.com/", "Example"))
    }

    fn direct() -> ExecutionRelay {
        ExecutionRelay::direct(Arc::new(toy_evaluator), page())
    }

    async fn run(relay: &ExecutionRelay, code: &str) -> ResultEnvelope {
        let request_id = RequestId::generate();
        let result = relay
            .execute(ExecuteEnvelope {
                request_id,
                code: code.into(),
            })
            .await;
        assert_eq!(result.request_id, request_id);
        result
    }

    #[tokio::test]
    async fn test_direct_value() {
        let result = run(&direct(), "1+1").await;
        assert!(result.ok);
        assert_eq!(result.result, json!(2));
        assert_eq!(result.url, "https://example.com/");
        assert_eq!(result.title, "Example");
    }

    #[tokio::test]
    async fn test_direct_throw() {
        let result = run(&direct(), "throw 'boom'").await;
        assert!(!result.ok);
        assert_eq!(result.error_message(), "boom");
    }

    #[tokio::test]
    async fn test_deferred_is_awaited() {
        let resolved = run(&direct(), "Promise.resolve(7)").await;
        assert!(resolved.ok);
        assert_eq!(resolved.result, json!(7));

        let rejected = run(&direct(), "Promise.reject('nope')").await;
        assert!(!rejected.ok);
        assert_eq!(rejected.error_message(), "nope");
    }

    #[tokio::test]
    async fn test_panics_become_failures() {
        let sync = run(&direct(), "panic").await;
        assert!(!sync.ok);
        assert!(sync.error_message().contains("evaluator blew up"));

        let deferred = run(&direct(), "deferred panic").await;
        assert!(!deferred.ok);
        assert!(deferred.error_message().contains("continuation blew up"));
    }

    #[tokio::test]
    async fn test_modes_produce_identical_envelopes() {
        let (companion, _task) = CompanionHandle::spawn(Arc::new(EchoInjector));
        let privileged = ExecutionRelay::privileged(companion, page());
        let direct = direct();

        for code in ["1+1", "throw 'boom'", "document.title"] {
            let request_id = RequestId::generate();
            let execute = ExecuteEnvelope {
                request_id,
                code: code.into(),
            };
            let a = direct.execute(execute.clone()).await;
            let b = privileged.execute(execute).await;
            assert_eq!(a, b, "mismatch for {code}");
        }
    }

    #[tokio::test]
    async fn test_companion_runs_jobs_concurrently() {
        let (companion, _task) = CompanionHandle::spawn(Arc::new(EchoInjector));

        let slow = {
            let companion = companion.clone();
            tokio::spawn(async move { companion.inject("slow".into()).await })
        };
        let fast = companion.inject("fast".into()).await;

        assert_eq!(fast, Ok(json!("fast")));
        assert!(!slow.is_finished());
        assert_eq!(slow.await.expect("join"), Ok(json!("slow")));
    }

    #[tokio::test]
    async fn test_dead_companion_reports_failure() {
        let (companion, task) = CompanionHandle::spawn(Arc::new(EchoInjector));
        task.abort();
        let _ = task.await;

        let relay = ExecutionRelay::privileged(companion, page());
        let result = run(&relay, "1+1").await;
        assert!(!result.ok);
        assert!(result.error_message().contains("companion"));
    }

    #[test]
    fn test_static_page_info() {
        let page = StaticPage::new("https://a.test/", "A").with_browser("Firefox", "UA/1.0");
        let info = page.browser_info();
        assert_eq!(info.browser_name, "Firefox");
        assert_eq!(info.user_agent, "UA/1.0");
        assert!(page.is_top_level());
        assert!(!page.embedded().is_top_level());
    }
}
