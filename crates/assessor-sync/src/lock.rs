//! Cross-process run lock
//!
//! A single [`LockToken`] marks "a run is active". Every invoker, scheduled
//! or manual, in this process or another, goes through
//! [`LockCoordinator::acquire`]. The store behind it must offer an atomic
//! create-if-absent so two invokers can never both observe "no lock" and
//! both write one.
//!
//! Tokens older than the staleness threshold, and tokens that cannot be
//! decoded, are presumed abandoned by a crashed run and are reclaimed with
//! a compare-and-remove: the token is only discarded if it is still the one
//! that was judged stale.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};

/// Persisted marker of an active run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockToken {
    pub holder_id: Uuid,
    /// ISO-8601 acquisition timestamp
    pub acquired_at: DateTime<Utc>,
    pub pid: u32,
    pub hostname: String,
    pub operation: String,
}

impl LockToken {
    pub fn new(operation: &str) -> Self {
        Self {
            holder_id: Uuid::new_v4(),
            acquired_at: Utc::now(),
            pid: std::process::id(),
            hostname: local_hostname(),
            operation: operation.to_string(),
        }
    }

    /// Age relative to `now`; a token from the future counts as brand new
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.acquired_at).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn holder(&self) -> String {
        format!("{} (pid {} on {}, {})", self.holder_id, self.pid, self.hostname, self.operation)
    }
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Token as found in the store
///
/// `raw` is the exact stored representation and is what compare-and-remove
/// compares against. `token` is `None` when `raw` does not decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedToken {
    pub raw: String,
    pub token: Option<LockToken>,
}

/// Storage for the single lock token
pub trait LockStore: Send + Sync {
    /// Atomically write `token` unless one already exists
    ///
    /// Returns `false` when a token is already present.
    fn create_if_absent(&self, token: &LockToken) -> SyncResult<bool>;

    fn read(&self) -> SyncResult<Option<ObservedToken>>;

    /// Remove the token only if it is still exactly `observed`
    fn remove_if(&self, observed: &ObservedToken) -> SyncResult<bool>;

    /// Human-readable location, for logs
    fn describe(&self) -> String;
}

/// Lock token stored as a JSON file
///
/// Creation writes a private temp file and hard-links it into place, which
/// fails with `AlreadyExists` if a token is present. Readers therefore
/// never see a half-written token.
#[derive(Debug, Clone)]
pub struct FileLockStore {
    path: PathBuf,
}

impl FileLockStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sibling(&self, tag: &str) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "sync.lock".to_string());
        self.path
            .with_file_name(format!("{}.{}.{}", name, tag, Uuid::new_v4().simple()))
    }

    /// Link a token moved aside back into place
    ///
    /// The aside copy is only deleted once the link exists; if the link
    /// fails the token is left at `aside` for an operator to inspect.
    fn restore(&self, aside: &Path) -> bool {
        match fs::hard_link(aside, &self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "Restored lock token changed during removal");
                if let Err(e) = fs::remove_file(aside) {
                    debug!(path = %aside.display(), error = %e, "Could not remove restored lock token copy");
                }
                true
            },
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    kept_at = %aside.display(),
                    error = %e,
                    "Could not restore lock token changed during removal"
                );
                false
            },
        }
    }
}

impl LockStore for FileLockStore {
    fn create_if_absent(&self, token: &LockToken) -> SyncResult<bool> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp = self.sibling("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(token)?)?;
        let linked = fs::hard_link(&tmp, &self.path);
        let _ = fs::remove_file(&tmp);

        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(SyncError::storage(format!(
                "failed to create lock token {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    fn read(&self) -> SyncResult<Option<ObservedToken>> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => {
                let token = serde_json::from_str(&raw).ok();
                Ok(Some(ObservedToken { raw, token }))
            },
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn remove_if(&self, observed: &ObservedToken) -> SyncResult<bool> {
        // Move the token aside first; whatever we moved is then ours to judge.
        let aside = self.sibling("reclaim");
        match fs::rename(&self.path, &aside) {
            Ok(()) => {},
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        let moved = fs::read_to_string(&aside).unwrap_or_default();
        if moved == observed.raw {
            fs::remove_file(&aside)?;
            return Ok(true);
        }

        // Replaced between read and rename: put the newer token back.
        self.restore(&aside);
        Ok(false)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-process lock store for tests and single-process embedding
#[derive(Debug, Default)]
pub struct MemoryLockStore {
    slot: Mutex<Option<String>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place an arbitrary raw token, bypassing acquisition
    pub fn put_raw(&self, raw: impl Into<String>) -> SyncResult<()> {
        *self.lock_slot()? = Some(raw.into());
        Ok(())
    }

    fn lock_slot(&self) -> SyncResult<std::sync::MutexGuard<'_, Option<String>>> {
        self.slot
            .lock()
            .map_err(|_| SyncError::storage("lock store mutex poisoned"))
    }
}

impl LockStore for MemoryLockStore {
    fn create_if_absent(&self, token: &LockToken) -> SyncResult<bool> {
        let mut slot = self.lock_slot()?;
        if slot.is_some() {
            return Ok(false);
        }
        *slot = Some(serde_json::to_string_pretty(token)?);
        Ok(true)
    }

    fn read(&self) -> SyncResult<Option<ObservedToken>> {
        Ok(self.lock_slot()?.clone().map(|raw| ObservedToken {
            token: serde_json::from_str(&raw).ok(),
            raw,
        }))
    }

    fn remove_if(&self, observed: &ObservedToken) -> SyncResult<bool> {
        let mut slot = self.lock_slot()?;
        if slot.as_deref() == Some(observed.raw.as_str()) {
            *slot = None;
            return Ok(true);
        }
        Ok(false)
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// Snapshot of the lock for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct LockStatus {
    pub location: String,
    pub token: Option<LockToken>,
    /// Present but undecodable
    pub corrupt: bool,
    pub age_secs: Option<u64>,
    pub stale: bool,
}

/// Acquires and reclaims the run lock
#[derive(Clone)]
pub struct LockCoordinator {
    store: Arc<dyn LockStore>,
    stale_after: Duration,
}

impl LockCoordinator {
    pub fn new(store: Arc<dyn LockStore>, stale_after: Duration) -> Self {
        Self { store, stale_after }
    }

    /// Coordinator over a lock file at `path`
    pub fn file(path: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self::new(Arc::new(FileLockStore::new(path)), stale_after)
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// [`Self::acquire`] on the blocking pool, for async callers
    pub async fn acquire_async(&self, operation: &str) -> SyncResult<LockGuard> {
        let locks = self.clone();
        let operation = operation.to_string();
        off_runtime(move || locks.acquire(&operation)).await
    }

    fn is_stale(&self, token: &LockToken) -> bool {
        token.age(Utc::now()) >= self.stale_after
    }

    /// Acquire the lock for `operation`
    ///
    /// Fails with [`SyncError::LockConflict`] when a fresh token exists.
    /// Stale or corrupt tokens are reclaimed and acquisition is retried.
    pub fn acquire(&self, operation: &str) -> SyncResult<LockGuard> {
        const MAX_ROUNDS: usize = 3;

        for _ in 0..MAX_ROUNDS {
            let token = LockToken::new(operation);
            if self.store.create_if_absent(&token)? {
                info!(
                    lock = %self.store.describe(),
                    holder = %token.holder_id,
                    operation,
                    "Acquired run lock"
                );
                return Ok(LockGuard {
                    store: Arc::clone(&self.store),
                    token,
                    released: false,
                });
            }

            let Some(observed) = self.store.read()? else {
                // Released between our create attempt and the read.
                continue;
            };

            match &observed.token {
                Some(existing) if !self.is_stale(existing) => {
                    warn!(
                        lock = %self.store.describe(),
                        holder = %existing.holder(),
                        acquired_at = %existing.acquired_at.to_rfc3339(),
                        "Run lock held by another invocation"
                    );
                    return Err(SyncError::LockConflict {
                        holder: existing.holder(),
                        acquired_at: existing.acquired_at,
                    });
                },
                Some(existing) => {
                    warn!(
                        lock = %self.store.describe(),
                        holder = %existing.holder(),
                        age_secs = existing.age(Utc::now()).as_secs(),
                        "Reclaiming stale run lock"
                    );
                    self.store.remove_if(&observed)?;
                },
                None => {
                    warn!(lock = %self.store.describe(), "Reclaiming corrupt run lock");
                    self.store.remove_if(&observed)?;
                },
            }
        }

        Err(SyncError::storage(format!(
            "could not acquire run lock at {} after {} attempts",
            self.store.describe(),
            MAX_ROUNDS
        )))
    }

    pub fn status(&self) -> SyncResult<LockStatus> {
        let observed = self.store.read()?;
        let now = Utc::now();
        let (token, corrupt) = match observed {
            Some(observed) => {
                let corrupt = observed.token.is_none();
                (observed.token, corrupt)
            },
            None => (None, false),
        };

        Ok(LockStatus {
            location: self.store.describe(),
            age_secs: token.as_ref().map(|t| t.age(now).as_secs()),
            stale: corrupt || token.as_ref().map(|t| self.is_stale(t)).unwrap_or(false),
            token,
            corrupt,
        })
    }
}

/// Held run lock; released on [`LockGuard::release`] or drop
pub struct LockGuard {
    store: Arc<dyn LockStore>,
    token: LockToken,
    released: bool,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("token", &self.token)
            .field("released", &self.released)
            .finish()
    }
}

impl LockGuard {
    pub fn token(&self) -> &LockToken {
        &self.token
    }

    pub fn release(mut self) -> SyncResult<()> {
        self.released = true;
        release_token(self.store.as_ref(), &self.token)
    }

    /// [`Self::release`] on the blocking pool, for async callers
    pub async fn release_async(self) -> SyncResult<()> {
        off_runtime(move || self.release()).await
    }
}

/// Run lock store I/O where it cannot stall the async runtime
async fn off_runtime<R, F>(op: F) -> SyncResult<R>
where
    R: Send + 'static,
    F: FnOnce() -> SyncResult<R> + Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| SyncError::storage(format!("run lock task failed: {}", e)))?
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            if let Err(e) = release_token(self.store.as_ref(), &self.token) {
                warn!(error = %e, "Failed to release run lock");
            }
        }
    }
}

/// Remove the stored token if it is still ours
fn release_token(store: &dyn LockStore, token: &LockToken) -> SyncResult<()> {
    match store.read()? {
        Some(observed)
            if observed
                .token
                .as_ref()
                .map(|t| t.holder_id == token.holder_id)
                .unwrap_or(false) =>
        {
            if store.remove_if(&observed)? {
                info!(lock = %store.describe(), holder = %token.holder_id, "Released run lock");
            }
        },
        Some(_) => warn!(
            lock = %store.describe(),
            holder = %token.holder_id,
            "Run lock was taken over by another invocation; leaving it in place"
        ),
        None => warn!(lock = %store.describe(), "Run lock already removed"),
    }
    Ok(())
}
