//! Server-side admission of one inbound connection.
//!
//!   accept (info{mac}) → public_key → challenge → identity → network → welcome
//!
//! A missing public key or a failed challenge rejects the peer. Identity and
//! network are informational; the peer is admitted without them.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use ember_core::cipher::{public_key_to_pem, CipherContext};
use ember_core::message::NodeKind;
use ember_services::protocol::{ask_challenge, ask_identity, ask_network, ask_public_key};
use ember_services::{LocalNode, PeerEntry, Session, SessionOptions};
use tokio::net::TcpStream;
use tokio::sync::broadcast;

use crate::ledger::PeerLedger;

pub const NO_PUBLIC_KEY: &str = "public key required";

pub struct Admission {
    node: Arc<LocalNode>,
    password: Option<String>,
    welcome: String,
    ledger: Option<PeerLedger>,
}

impl Admission {
    pub fn new(node: Arc<LocalNode>, password: Option<String>, welcome: String, ledger: Option<PeerLedger>) -> Self {
        Self {
            node,
            password,
            welcome,
            ledger,
        }
    }

    /// Run admission, then hold the session until the peer leaves or the
    /// daemon shuts down.
    pub async fn admit(&self, stream: TcpStream, addr: SocketAddr, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let options = SessionOptions::new(addr.to_string()).with_envelope(envelope(self.password.as_deref()));
        let session = Session::accept(stream, self.node.clone(), options)
            .await
            .context("peer did not announce itself")?;
        let mac = session.peer_mac().unwrap_or_default().to_string();

        let Some(public_key) = ask_public_key(&session).await else {
            session.reject(NO_PUBLIC_KEY).await;
            anyhow::bail!("{mac} gave no usable public key");
        };
        if !ask_challenge(&session, &public_key).await {
            anyhow::bail!("{mac} failed the challenge");
        }

        let identity = ask_identity(&session).await;
        if let Some(id) = &identity {
            if id.mac != mac {
                tracing::warn!(peer = %addr, announced = %mac, identity = %id.mac, "identity MAC differs from announced MAC");
            }
        }
        let network = ask_network(&session).await;

        session.welcome(self.welcome.as_str()).await.context("welcome not delivered")?;

        let mut entry = PeerEntry::new(mac.as_str(), addr, network.first().map_or(NodeKind::Client, |n| n.kind));
        entry.public_key_pem = public_key_to_pem(&public_key).ok();
        entry.identity = identity;
        entry.network = network;

        tracing::info!(
            peer = %addr,
            mac = %mac,
            kind = entry.kind.as_str(),
            hostname = entry.identity.as_ref().map_or("", |id| id.hostname.as_str()),
            visible_nodes = entry.network.len(),
            "peer admitted"
        );
        if let Some(ledger) = &self.ledger {
            if let Err(e) = ledger.record(&entry).await {
                tracing::warn!(peer = %addr, error = %e, "failed to record peer in ledger");
            }
        }
        self.node.peers.insert(mac.clone(), entry);

        tokio::select! {
            _ = session.closed() => {}
            _ = shutdown.recv() => session.close().await,
        }

        self.node.forget_peer(&mac, addr);
        match session.failure().await {
            Some(reason) => tracing::info!(peer = %addr, mac = %mac, reason = %reason, "peer dropped"),
            None => tracing::info!(peer = %addr, mac = %mac, "peer left"),
        }
        Ok(())
    }
}

/// Fresh envelope for one session: salted when a password is configured.
pub fn envelope(password: Option<&str>) -> CipherContext {
    match password {
        Some(password) => CipherContext::salted(password.as_bytes()),
        None => CipherContext::Plain,
    }
}
