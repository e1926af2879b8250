//! Priority lease lock — best-effort mutual exclusion between cooperating
//! processes that share a lease store.
//!
//! A lease record is `(priority, owner, expiry, held)`. Acquisition polls:
//!
//!   1. absent, expired, or a pending lower-priority claim → write our claim
//!   2. our claim still there after the settle window     → mark it held
//!   3. anything else                                      → wait and retry
//!
//! A held lease is never preempted; only expiry frees it without a release.
//! Reads and writes are not atomic with respect to each other, so two
//! contenders of equal priority can both settle in a narrow window. The
//! lock is for coordination, not for safety-critical exclusion.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ── Records ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub priority: i64,
    pub owner: Uuid,
    /// Unix milliseconds.
    pub expiry_ms: u64,
    /// False while the claim is settling.
    #[serde(default)]
    pub held: bool,
}

impl LeaseRecord {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expiry_ms
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── Stores ────────────────────────────────────────────────────────────────────

/// Where lease records live. One record per lease name.
pub trait LeaseStore: Send + Sync {
    fn read(&self, name: &str) -> Result<Option<LeaseRecord>, LeaseError>;
    fn write(&self, name: &str, record: &LeaseRecord) -> Result<(), LeaseError>;
    fn remove(&self, name: &str) -> Result<(), LeaseError>;
}

/// One JSON file per lease under a shared directory.
#[derive(Debug, Clone)]
pub struct FileLeaseStore {
    dir: PathBuf,
}

impl FileLeaseStore {
    /// Creates the directory if it does not exist.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, LeaseError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, name: &str) -> Result<PathBuf, LeaseError> {
        let valid = !name.is_empty()
            && !name.starts_with('.')
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(LeaseError::InvalidName(name.to_string()));
        }
        Ok(self.dir.join(format!("{name}.lease")))
    }
}

impl LeaseStore for FileLeaseStore {
    fn read(&self, name: &str) -> Result<Option<LeaseRecord>, LeaseError> {
        let path = self.path(name)?;
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                // Unreadable records are treated as free so they can be reclaimed.
                tracing::warn!(path = %path.display(), error = %e, "ignoring corrupt lease record");
                Ok(None)
            }
        }
    }

    fn write(&self, name: &str, record: &LeaseRecord) -> Result<(), LeaseError> {
        let path = self.path(name)?;
        let json = serde_json::to_vec(record)?;

        // Atomic write: tmp file → rename. Readers never see a partial record.
        let tmp_path = self.dir.join(format!(".{name}.{}.tmp", Uuid::new_v4()));
        std::fs::write(&tmp_path, &json)?;
        if let Err(e) = std::fs::rename(&tmp_path, &path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<(), LeaseError> {
        match std::fs::remove_file(self.path(name)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process store, for contenders that share one address space.
#[derive(Debug, Default)]
pub struct MemoryLeaseStore {
    records: DashMap<String, LeaseRecord>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LeaseStore for MemoryLeaseStore {
    fn read(&self, name: &str) -> Result<Option<LeaseRecord>, LeaseError> {
        Ok(self.records.get(name).map(|r| r.value().clone()))
    }

    fn write(&self, name: &str, record: &LeaseRecord) -> Result<(), LeaseError> {
        self.records.insert(name.to_string(), record.clone());
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<(), LeaseError> {
        self.records.remove(name);
        Ok(())
    }
}

// ── Lock ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct LeaseOptions {
    /// How long a claim or hold stays valid without renewal.
    pub ttl: Duration,
    /// Pause between polls of the store.
    pub poll: Duration,
    /// How long a claim must survive before it becomes a hold.
    pub settle: Duration,
}

impl Default for LeaseOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            poll: Duration::from_millis(50),
            settle: Duration::from_millis(250),
        }
    }
}

/// One contender for one named lease. Each lock has its own owner code.
pub struct LeaseLock<S: LeaseStore> {
    store: Arc<S>,
    name: String,
    priority: i64,
    owner: Uuid,
    options: LeaseOptions,
}

impl<S: LeaseStore> LeaseLock<S> {
    pub fn new(store: Arc<S>, name: impl Into<String>, priority: i64) -> Self {
        Self {
            store,
            name: name.into(),
            priority,
            owner: Uuid::new_v4(),
            options: LeaseOptions::default(),
        }
    }

    pub fn with_options(mut self, options: LeaseOptions) -> Self {
        self.options = options;
        self
    }

    pub fn owner(&self) -> Uuid {
        self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Block until the lease is held. Blocks the calling thread; from async
    /// code run it under `spawn_blocking`.
    pub fn acquire(&self) -> Result<LeaseGuard<'_, S>, LeaseError> {
        let mut claimed_at = None;
        while !self.step(&mut claimed_at)? {
            std::thread::sleep(self.options.poll);
        }
        Ok(self.hold())
    }

    /// [`LeaseLock::acquire`], giving up after `timeout`.
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<Option<LeaseGuard<'_, S>>, LeaseError> {
        let deadline = Instant::now() + timeout;
        let mut claimed_at = None;
        while !self.step(&mut claimed_at)? {
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(self.options.poll);
        }
        Ok(Some(self.hold()))
    }

    fn record(&self, held: bool) -> LeaseRecord {
        LeaseRecord {
            priority: self.priority,
            owner: self.owner,
            expiry_ms: now_ms() + self.options.ttl.as_millis() as u64,
            held,
        }
    }

    fn hold(&self) -> LeaseGuard<'_, S> {
        tracing::debug!(lease = %self.name, priority = self.priority, "lease held");
        LeaseGuard { lock: self }
    }

    /// One poll of the store. True once our claim has settled and the
    /// record is marked held.
    fn step(&self, claimed_at: &mut Option<Instant>) -> Result<bool, LeaseError> {
        let now = now_ms();
        match self.store.read(&self.name)? {
            Some(current) if current.owner == self.owner => match *claimed_at {
                Some(at) if at.elapsed() >= self.options.settle => {
                    self.store.write(&self.name, &self.record(true))?;
                    return Ok(true);
                }
                Some(_) => {}
                None => *claimed_at = Some(Instant::now()),
            },
            Some(current) if current.is_expired(now) || (!current.held && current.priority < self.priority) => {
                tracing::debug!(
                    lease = %self.name,
                    priority = self.priority,
                    displaced = current.priority,
                    expired = current.is_expired(now),
                    "claiming lease"
                );
                self.store.write(&self.name, &self.record(false))?;
                *claimed_at = Some(Instant::now());
            }
            Some(_) => *claimed_at = None,
            None => {
                self.store.write(&self.name, &self.record(false))?;
                *claimed_at = Some(Instant::now());
            }
        }
        Ok(false)
    }
}

/// A held lease. Released when dropped.
pub struct LeaseGuard<'a, S: LeaseStore> {
    lock: &'a LeaseLock<S>,
}

impl<S: LeaseStore> LeaseGuard<'_, S> {
    /// Push the expiry out by another ttl. Fails if the lease was lost.
    pub fn renew(&self) -> Result<(), LeaseError> {
        self.check_owner()?;
        self.lock.store.write(&self.lock.name, &self.lock.record(true))
    }

    /// Release now, reporting store errors that `drop` would swallow.
    pub fn release(self) -> Result<(), LeaseError> {
        let result = self.release_inner();
        std::mem::forget(self);
        result
    }

    fn check_owner(&self) -> Result<(), LeaseError> {
        match self.lock.store.read(&self.lock.name)? {
            Some(record) if record.owner == self.lock.owner => Ok(()),
            _ => Err(LeaseError::Lost(self.lock.name.clone())),
        }
    }

    fn release_inner(&self) -> Result<(), LeaseError> {
        // Someone may have reclaimed an expired hold; leave theirs alone.
        if self.check_owner().is_ok() {
            self.lock.store.remove(&self.lock.name)?;
            tracing::debug!(lease = %self.lock.name, "lease released");
        }
        Ok(())
    }
}

impl<S: LeaseStore> Drop for LeaseGuard<'_, S> {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            tracing::warn!(lease = %self.lock.name, error = %e, "lease release failed");
        }
    }
}

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("lease store I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("lease record encoding: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("invalid lease name `{0}`")]
    InvalidName(String),

    #[error("lease `{0}` is no longer ours")]
    Lost(String),
}
