//! emberd — Ember node daemon.
//!
//!   emberd                  listen and admit peers
//!   emberd connect <addr>   handshake with a listening node, then leave

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use ember_core::cipher::KeyPair;
use ember_core::config::EmberConfig;
use ember_services::LocalNode;

mod admission;
mod client;
mod ledger;
mod listener;

use admission::Admission;
use ledger::PeerLedger;
use listener::Listener;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = EmberConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = EmberConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        EmberConfig::default()
    });

    // Keys are provisioned out of band, never generated here.
    let key_path = &config.identity.private_key_path;
    let pem = std::fs::read_to_string(key_path)
        .with_context(|| format!("failed to read private key {}", key_path.display()))?;
    let keys = KeyPair::from_pem(&pem).with_context(|| format!("invalid private key {}", key_path.display()))?;

    let identity = config.identity.identity();
    tracing::info!(
        mac = %identity.mac,
        hostname = %identity.hostname,
        kind = config.identity.node_kind.as_str(),
        encrypted = config.security.password.is_some(),
        "identity ready"
    );
    let node = Arc::new(LocalNode::new(identity, config.identity.node_kind, keys));
    let password = config.security.password.clone();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.as_slice() {
        [] => listen(&config, node, password).await,
        [cmd, addr] if cmd == "connect" => {
            let timeout = Duration::from_secs(config.network.connect_timeout_secs);
            client::connect(addr, node, password.as_deref(), timeout).await
        }
        _ => anyhow::bail!("usage: emberd [connect <addr>]"),
    }
}

async fn listen(config: &EmberConfig, node: Arc<LocalNode>, password: Option<String>) -> Result<()> {
    let ledger = match PeerLedger::new(config.ledger.path.clone(), &config.lease) {
        Ok(ledger) => {
            tracing::info!(path = %ledger.path().display(), lease_dir = %config.lease.dir.display(), "peer ledger ready");
            Some(ledger)
        }
        Err(e) => {
            tracing::warn!(error = %format!("{e:#}"), "peer ledger disabled");
            None
        }
    };
    let admission = Arc::new(Admission::new(node, password, config.network.welcome.clone(), ledger));

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    let listener = Listener::bind(&config.network.listen, admission, shutdown_tx.clone()).await?;
    listener.run().await?;

    // Let admission tasks send their goodbyes.
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok(())
}
