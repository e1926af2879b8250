//! Ember integration test harness.
//!
//! Most tests run both ends of a session in-process over loopback TCP.
//! `daemon` tests drive a built `emberd` binary and skip when it is absent:
//!
//!   cargo build -p emberd
//!   cargo test --test integration

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use ember_core::cipher::{CipherContext, KeyPair};
use ember_core::message::{Identity, NodeKind};
use ember_services::protocol::{ask_challenge, ask_identity, ask_network, ask_public_key};
use ember_services::{LocalNode, PeerEntry, Session, SessionError, SessionOptions};
use rsa::RsaPrivateKey;
use tokio::net::{TcpListener, TcpStream};

// ── Harness ───────────────────────────────────────────────────────────────────

pub const SERVER_MAC: &str = "5e:5e:5e:5e:5e:5e";
pub const CLIENT_MAC: &str = "cc:cc:cc:cc:cc:cc";

/// Two 1024-bit keys, generated once per test binary.
pub fn private_key(slot: usize) -> RsaPrivateKey {
    static KEYS: OnceLock<Vec<RsaPrivateKey>> = OnceLock::new();
    KEYS.get_or_init(|| {
        (0..2)
            .map(|_| RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap())
            .collect()
    })[slot]
        .clone()
}

pub fn identity(mac: &str, hostname: &str) -> Identity {
    Identity {
        username: "ada".into(),
        os_version: "linux 6.1".into(),
        hostname: hostname.into(),
        country: "GB".into(),
        city: "London".into(),
        mac: mac.into(),
    }
}

pub fn node(mac: &str, hostname: &str, kind: NodeKind, key_slot: usize) -> Arc<LocalNode> {
    Arc::new(LocalNode::new(
        identity(mac, hostname),
        kind,
        KeyPair::from_private(private_key(key_slot)),
    ))
}

pub fn server_node() -> Arc<LocalNode> {
    node(SERVER_MAC, "hub", NodeKind::Server, 1)
}

pub fn client_node() -> Arc<LocalNode> {
    node(CLIENT_MAC, "laptop", NodeKind::Client, 0)
}

pub async fn loopback() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// Start a client connecting to `addr` in the background.
pub fn spawn_client(
    addr: SocketAddr,
    local: Arc<LocalNode>,
    envelope: CipherContext,
) -> tokio::task::JoinHandle<Result<Session, SessionError>> {
    tokio::spawn(async move {
        let stream = TcpStream::connect(addr).await.map_err(|_| SessionError::Disconnected)?;
        Session::connect(stream, local, SessionOptions::new(addr.to_string()).with_envelope(envelope)).await
    })
}

/// What the server side learned while admitting a peer.
#[derive(Debug)]
pub struct Admitted {
    pub identity: Option<Identity>,
    pub network_size: usize,
}

/// The daemon's admission sequence, run against an accepted session.
/// `None` if the peer was rejected.
pub async fn admit(session: &Session, addr: SocketAddr) -> Option<Admitted> {
    let key = ask_public_key(session).await?;
    if !ask_challenge(session, &key).await {
        return None;
    }
    let identity = ask_identity(session).await;
    let network = ask_network(session).await;
    session.welcome("welcome to ember").await.ok()?;

    let mac = session.peer_mac()?.to_string();
    let mut entry = PeerEntry::new(mac.as_str(), addr, network.first().map_or(NodeKind::Client, |n| n.kind));
    entry.identity = identity.clone();
    entry.network = network.clone();
    session.local().peers.insert(mac, entry);

    Some(Admitted {
        identity,
        network_size: network.len(),
    })
}

// ── Test modules ──────────────────────────────────────────────────────────────

mod admission;
mod daemon;
mod envelope;
