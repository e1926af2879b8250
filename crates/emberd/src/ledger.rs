//! Peer ledger — one JSON line per admitted peer.
//!
//! Several daemons may share a ledger file, so every append happens under
//! the `peer-ledger` lease.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use ember_core::config::LeaseConfig;
use ember_core::message::Identity;
use ember_services::{FileLeaseStore, LeaseLock, LeaseOptions, PeerEntry};
use serde::Serialize;

pub const LEDGER_LEASE: &str = "peer-ledger";

#[derive(Debug, Serialize)]
struct LedgerLine<'a> {
    mac: &'a str,
    address: String,
    kind: &'a str,
    identity: Option<&'a Identity>,
    public_key_pem: Option<&'a str>,
    network_size: usize,
    admitted_unix_ms: u64,
}

impl<'a> LedgerLine<'a> {
    fn from_entry(entry: &'a PeerEntry) -> Self {
        Self {
            mac: &entry.mac,
            address: entry.addr.to_string(),
            kind: entry.kind.as_str(),
            identity: entry.identity.as_ref(),
            public_key_pem: entry.public_key_pem.as_deref(),
            network_size: entry.network.len(),
            admitted_unix_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
        }
    }
}

#[derive(Clone)]
pub struct PeerLedger {
    path: PathBuf,
    store: Arc<FileLeaseStore>,
    priority: i64,
    options: LeaseOptions,
}

impl PeerLedger {
    pub fn new(path: PathBuf, lease: &LeaseConfig) -> Result<Self> {
        let store = FileLeaseStore::new(&lease.dir)
            .with_context(|| format!("failed to prepare lease dir {}", lease.dir.display()))?;
        Ok(Self {
            path,
            store: Arc::new(store),
            priority: lease.priority,
            options: LeaseOptions {
                ttl: Duration::from_millis(lease.ttl_ms),
                poll: Duration::from_millis(lease.poll_ms),
                settle: Duration::from_millis(lease.settle_ms),
            },
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Append `entry`. Lease polling blocks, so the write runs off the runtime.
    pub async fn record(&self, entry: &PeerEntry) -> Result<()> {
        let line = serde_json::to_string(&LedgerLine::from_entry(entry))?;
        let ledger = self.clone();
        tokio::task::spawn_blocking(move || ledger.append(&line))
            .await
            .context("ledger task panicked")?
    }

    fn append(&self, line: &str) -> Result<()> {
        let lock = LeaseLock::new(self.store.clone(), LEDGER_LEASE, self.priority).with_options(self.options);
        // One ttl is long enough for any well-behaved holder to finish.
        let wait = self.options.ttl + self.options.settle;
        let _guard = lock
            .acquire_timeout(wait)?
            .with_context(|| format!("ledger lease not acquired within {wait:?}"))?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open ledger {}", self.path.display()))?;
        writeln!(file, "{line}")?;
        file.sync_data()?;
        Ok(())
    }
}
