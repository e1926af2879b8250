//! Configuration system for Ember.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $EMBER_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/ember/config.toml
//!   3. ~/.config/ember/config.toml

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::message::{Identity, NodeKind};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EmberConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub security: SecurityConfig,
    pub lease: LeaseConfig,
    pub ledger: LedgerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// RSA private key, PKCS#8 or PKCS#1 PEM. Never generated by Ember.
    pub private_key_path: PathBuf,
    pub username: String,
    pub os_version: String,
    /// Empty = read $HOSTNAME.
    pub hostname: String,
    pub country: String,
    pub city: String,
    /// `xx:xx:xx:xx:xx:xx`; sent as the first message of every session.
    pub mac: String,
    pub node_kind: NodeKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Listen address for `emberd`.
    pub listen: String,
    /// Text carried by `info{welcome}` on admission.
    pub welcome: String,
    /// Outbound connect + handshake deadline in seconds. 0 = none.
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Shared password. When set, every frame is a salted block.
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    pub dir: PathBuf,
    /// Higher wins contested claims.
    pub priority: i64,
    pub ttl_ms: u64,
    pub poll_ms: u64,
    pub settle_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// JSON-lines record of admitted peers.
    pub path: PathBuf,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            private_key_path: config_dir().join("private_key.pem"),
            username: std::env::var("USER").unwrap_or_default(),
            os_version: std::env::consts::OS.to_string(),
            hostname: String::new(),
            country: String::new(),
            city: String::new(),
            mac: "00:00:00:00:00:00".to_string(),
            node_kind: NodeKind::Server,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:7460".to_string(),
            welcome: "welcome".to_string(),
            connect_timeout_secs: 120,
        }
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            dir: data_dir().join("leases"),
            priority: 0,
            ttl_ms: 30_000,
            poll_ms: 50,
            settle_ms: 250,
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: data_dir().join("peers.jsonl"),
        }
    }
}

impl IdentityConfig {
    /// The identity record this node answers with.
    pub fn identity(&self) -> Identity {
        let hostname = if self.hostname.is_empty() {
            std::env::var("HOSTNAME").unwrap_or_default()
        } else {
            self.hostname.clone()
        };
        Identity {
            username: self.username.clone(),
            os_version: self.os_version.clone(),
            hostname,
            country: self.country.clone(),
            city: self.city.clone(),
            mac: self.mac.clone(),
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("ember")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("ember")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl EmberConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_file(&Self::file_path())?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Read one file, falling back to defaults when it does not exist.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(EmberConfig::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("EMBER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        Self::write_default_to(&path)?;
        Ok(path)
    }

    fn write_default_to(path: &Path) -> Result<(), ConfigError> {
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let text = toml::to_string_pretty(&EmberConfig::default())
            .map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, text).map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))
    }

    /// Apply EMBER_* overrides read through `lookup`.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("EMBER_IDENTITY__PRIVATE_KEY_PATH") {
            self.identity.private_key_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("EMBER_IDENTITY__MAC") {
            self.identity.mac = v;
        }
        if let Some(v) = lookup("EMBER_IDENTITY__HOSTNAME") {
            self.identity.hostname = v;
        }
        if let Some(kind) = lookup("EMBER_IDENTITY__NODE_KIND").and_then(|v| NodeKind::parse(&v)) {
            self.identity.node_kind = kind;
        }
        if let Some(v) = lookup("EMBER_NETWORK__LISTEN") {
            self.network.listen = v;
        }
        if let Some(v) = lookup("EMBER_SECURITY__PASSWORD") {
            self.security.password = if v.is_empty() { None } else { Some(v) };
        }
        if let Some(v) = lookup("EMBER_LEASE__DIR") {
            self.lease.dir = PathBuf::from(v);
        }
        if let Some(p) = lookup("EMBER_LEASE__PRIORITY").and_then(|v| v.parse().ok()) {
            self.lease.priority = p;
        }
        if let Some(v) = lookup("EMBER_LEDGER__PATH") {
            self.ledger.path = PathBuf::from(v);
        }
    }
}
