//! Per-domain allow-list for the privileged deployment.
//!
//! The gate only decides whether the lifecycle may open a connection for a
//! page. Once a connection is open it has no further say.
//!
//! Approved domains persist as a JSON array:
//!
//! ```json
//! ["example.com", "github.com"]
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Directory under the user config dir.
const CONFIG_DIR_NAME: &str = "tab-bridge";

/// Allow-list file name.
const ALLOW_LIST_FILE: &str = "allowed-domains.json";

// ============================================================================
// PermissionPrompt
// ============================================================================

/// Asks the user whether a domain may connect.
///
/// Called synchronously; the gate blocks until it answers.
pub trait PermissionPrompt: Send + Sync {
    /// Returns `true` if the user approves `domain`.
    fn ask(&self, domain: &str) -> bool;
}

impl<F> PermissionPrompt for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn ask(&self, domain: &str) -> bool {
        self(domain)
    }
}

// ============================================================================
// PermissionGate
// ============================================================================

/// Persisted set of user-approved domains.
///
/// # Example
///
/// ```ignore
/// let gate = PermissionGate::open(path, |domain: &str| confirm(domain))?;
/// if gate.check_and_request("example.com")? {
///     // connect
/// }
/// ```
pub struct PermissionGate {
    /// Allow-list file.
    path: PathBuf,
    /// Lower-cased approved domains.
    domains: Mutex<BTreeSet<String>>,
    /// User decision source.
    prompt: Box<dyn PermissionPrompt>,
}

impl fmt::Debug for PermissionGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionGate")
            .field("path", &self.path)
            .field("domains", &*self.domains.lock())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// PermissionGate - Construction
// ============================================================================

impl PermissionGate {
    /// Loads the allow-list at `path`. A missing file is an empty list.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] if the file exists but cannot be read
    /// - [`Error::Json`] if it is not a JSON array of strings
    pub fn open(path: impl Into<PathBuf>, prompt: impl PermissionPrompt + 'static) -> Result<Self> {
        let path = path.into();
        let domains = load(&path)?;

        debug!(path = %path.display(), count = domains.len(), "Allow-list loaded");

        Ok(Self {
            path,
            domains: Mutex::new(domains),
            prompt: Box::new(prompt),
        })
    }

    /// Loads the allow-list from the user config directory.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the platform has no config directory
    /// - Anything [`open`](Self::open) returns
    pub fn open_default(prompt: impl PermissionPrompt + 'static) -> Result<Self> {
        let path = default_path()
            .ok_or_else(|| Error::config("no user config directory on this platform"))?;
        Self::open(path, prompt)
    }

    /// Returns the allow-list file path.
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

// ============================================================================
// PermissionGate - Queries
// ============================================================================

impl PermissionGate {
    /// Returns `true` if `domain` is approved.
    #[must_use]
    pub fn allowed(&self, domain: &str) -> bool {
        normalize(domain).is_some_and(|domain| self.domains.lock().contains(&domain))
    }

    /// Returns `true` if the host of `url` is approved.
    #[must_use]
    pub fn allowed_url(&self, url: &str) -> bool {
        domain_of(url).is_some_and(|domain| self.allowed(&domain))
    }

    /// Returns `true` at once if approved; otherwise asks the user and
    /// remembers a yes.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if `domain` is blank
    /// - [`Error::Io`] if persisting an approval fails
    pub fn check_and_request(&self, domain: &str) -> Result<bool> {
        let domain =
            normalize(domain).ok_or_else(|| Error::invalid_argument("domain must not be empty"))?;

        if self.domains.lock().contains(&domain) {
            return Ok(true);
        }

        if !self.prompt.ask(&domain) {
            info!(%domain, "User denied domain");
            return Ok(false);
        }

        self.grant(&domain)?;
        Ok(true)
    }

    /// Returns the approved domains in sorted order.
    #[must_use]
    pub fn domains(&self) -> Vec<String> {
        self.domains.lock().iter().cloned().collect()
    }
}

// ============================================================================
// PermissionGate - Mutation
// ============================================================================

impl PermissionGate {
    /// Approves `domain` and persists the list.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if `domain` is blank
    /// - [`Error::Io`] if writing the file fails
    pub fn grant(&self, domain: &str) -> Result<()> {
        let domain =
            normalize(domain).ok_or_else(|| Error::invalid_argument("domain must not be empty"))?;

        let mut domains = self.domains.lock();
        if domains.contains(&domain) {
            return Ok(());
        }

        let mut updated = domains.clone();
        updated.insert(domain.clone());
        save(&self.path, &updated)?;
        *domains = updated;

        info!(%domain, "Domain allowed");
        Ok(())
    }

    /// Withdraws approval for `domain`. Returns `false` if it was not listed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if writing the file fails.
    pub fn revoke(&self, domain: &str) -> Result<bool> {
        let Some(domain) = normalize(domain) else {
            return Ok(false);
        };

        let mut domains = self.domains.lock();
        if !domains.contains(&domain) {
            return Ok(false);
        }

        let mut updated = domains.clone();
        updated.remove(&domain);
        save(&self.path, &updated)?;
        *domains = updated;

        info!(%domain, "Domain revoked");
        Ok(true)
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Default allow-list location under the user config directory.
#[must_use]
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(ALLOW_LIST_FILE))
}

/// Extracts the lower-cased host of a page URL.
///
/// Returns `None` for URLs without a host, such as `about:blank`.
#[must_use]
pub fn domain_of(url: &str) -> Option<String> {
    let url = Url::parse(url).ok()?;
    url.host_str().and_then(normalize)
}

fn normalize(domain: &str) -> Option<String> {
    let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();
    (!domain.is_empty()).then_some(domain)
}

fn load(path: &Path) -> Result<BTreeSet<String>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
        Err(e) => return Err(e.into()),
    };

    let listed: Vec<String> = serde_json::from_slice(&bytes)?;
    Ok(listed.iter().filter_map(|domain| normalize(domain)).collect())
}

fn save(path: &Path, domains: &BTreeSet<String>) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_vec_pretty(domains)?;
    fs::write(path, json).inspect_err(|e| {
        warn!(path = %path.display(), error = %e, "Failed to persist allow-list");
    })?;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tempfile::TempDir;

    fn deny(_: &str) -> bool {
        false
    }

    fn approve(_: &str) -> bool {
        true
    }

    #[test]
    fn test_domain_of() {
        assert_eq!(
            domain_of("https://Example.COM/path?q=1").as_deref(),
            Some("example.com")
        );
        assert_eq!(
            domain_of("http://localhost:8080/").as_deref(),
            Some("localhost")
        );
        assert_eq!(domain_of("about:blank"), None);
        assert_eq!(domain_of("not a url"), None);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().expect("tempdir");
        let gate = PermissionGate::open(dir.path().join("allow.json"), deny).expect("open");

        assert!(gate.domains().is_empty());
        assert!(!gate.allowed("example.com"));
    }

    #[test]
    fn test_check_and_request_denied() {
        let dir = TempDir::new().expect("tempdir");
        let gate = PermissionGate::open(dir.path().join("allow.json"), deny).expect("open");

        assert!(!gate.check_and_request("example.com").expect("check"));
        assert!(!gate.allowed("example.com"));
        assert!(!dir.path().join("allow.json").exists());
    }

    #[test]
    fn test_approval_is_persisted() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("nested").join("allow.json");

        let gate = PermissionGate::open(&path, approve).expect("open");
        assert!(gate.check_and_request("Example.com").expect("check"));
        assert!(gate.allowed("example.com"));
        assert!(gate.allowed_url("https://example.com/page"));

        let reopened = PermissionGate::open(&path, deny).expect("reopen");
        assert_eq!(reopened.domains(), vec!["example.com".to_string()]);
    }

    #[test]
    fn test_allowed_domain_skips_prompt() {
        let dir = TempDir::new().expect("tempdir");
        let asked = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&asked);

        let gate = PermissionGate::open(dir.path().join("allow.json"), move |_: &str| {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        })
        .expect("open");

        assert!(gate.check_and_request("a.test").expect("first"));
        assert!(gate.check_and_request("a.test").expect("second"));
        assert_eq!(asked.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_revoke() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("allow.json");
        let gate = PermissionGate::open(&path, deny).expect("open");

        gate.grant("a.test").expect("grant");
        gate.grant("b.test").expect("grant");
        assert!(gate.revoke("a.test").expect("revoke"));
        assert!(!gate.revoke("a.test").expect("revoke again"));

        let reopened = PermissionGate::open(&path, deny).expect("reopen");
        assert_eq!(reopened.domains(), vec!["b.test".to_string()]);
    }

    #[test]
    fn test_failed_persist_leaves_domain_unapproved() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("blocker").join("allow.json");
        let asked = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&asked);

        let gate = PermissionGate::open(&path, move |_: &str| {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        })
        .expect("open");

        // A regular file where the parent directory should be.
        fs::write(dir.path().join("blocker"), "x").expect("write blocker");

        assert!(gate.check_and_request("evil.test").is_err());
        assert!(!gate.allowed("evil.test"));
        assert!(gate.check_and_request("evil.test").is_err());
        assert_eq!(asked.load(Ordering::SeqCst), 2);
        assert!(gate.domains().is_empty());
    }

    #[test]
    fn test_failed_persist_keeps_revoked_domain() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("blocker").join("allow.json");
        let gate = PermissionGate::open(&path, deny).expect("open");
        gate.grant("a.test").expect("grant");

        fs::remove_dir_all(dir.path().join("blocker")).expect("remove dir");
        fs::write(dir.path().join("blocker"), "x").expect("write blocker");

        assert!(gate.revoke("a.test").is_err());
        assert!(gate.allowed("a.test"));
    }

    #[test]
    fn test_blank_domain_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let gate = PermissionGate::open(dir.path().join("allow.json"), approve).expect("open");

        assert!(gate.check_and_request("  ").is_err());
        assert!(gate.grant("").is_err());
        assert!(!gate.allowed(""));
    }

    #[test]
    fn test_corrupt_file_is_error() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("allow.json");
        fs::write(&path, "{not json").expect("write");

        assert!(PermissionGate::open(&path, deny).is_err());
    }
}
