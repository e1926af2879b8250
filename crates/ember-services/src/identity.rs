//! Local node identity and the registry of admitted peers.
//!
//! `LocalNode` is everything `answering` needs to reply to a peer's
//! questions: the identity record, the RSA key pair, and the topology this
//! node can see.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use ember_core::cipher::KeyPair;
use ember_core::message::{Identity, NetworkNode, NodeKind};

/// What an admission learned about a peer.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    /// MAC announced in the peer's opening `info{mac}`.
    pub mac: String,

    pub addr: SocketAddr,

    pub kind: NodeKind,

    /// Public key PEM, as answered to `question{public_key}`.
    pub public_key_pem: Option<String>,

    pub identity: Option<Identity>,

    /// The peer's own view of the network.
    pub network: Vec<NetworkNode>,

    pub admitted_at: Instant,
}

impl PeerEntry {
    pub fn new(mac: impl Into<String>, addr: SocketAddr, kind: NodeKind) -> Self {
        Self {
            mac: mac.into(),
            addr,
            kind,
            public_key_pem: None,
            identity: None,
            network: Vec::new(),
            admitted_at: Instant::now(),
        }
    }

    /// Topology entry for this peer.
    pub fn as_node(&self) -> NetworkNode {
        let mut node = NetworkNode::new(self.kind)
            .with("mac", self.mac.as_str())
            .with("address", self.addr.to_string());
        if let Some(id) = &self.identity {
            node = node.with("hostname", id.hostname.as_str());
        }
        node
    }
}

/// Admitted peers, shared between the listener and admission tasks.
/// Keyed on the MAC the peer announced; a later admission under the same MAC
/// replaces the entry.
pub type PeerRegistry = Arc<DashMap<String, PeerEntry>>;

/// Create a new empty peer registry.
pub fn new_registry() -> PeerRegistry {
    Arc::new(DashMap::new())
}

/// This node, as it presents itself to peers.
#[derive(Debug)]
pub struct LocalNode {
    pub identity: Identity,
    pub kind: NodeKind,
    keys: KeyPair,
    pub peers: PeerRegistry,
}

impl LocalNode {
    pub fn new(identity: Identity, kind: NodeKind, keys: KeyPair) -> Self {
        Self {
            identity,
            kind,
            keys,
            peers: new_registry(),
        }
    }

    pub fn keys(&self) -> &KeyPair {
        &self.keys
    }

    pub fn mac(&self) -> &str {
        &self.identity.mac
    }

    /// Drop the peer admitted as `mac` from `addr`. An entry that a later
    /// connection has since taken over under the same MAC is left alone.
    pub fn forget_peer(&self, mac: &str, addr: SocketAddr) -> bool {
        self.peers.remove_if(mac, |_, entry| entry.addr == addr).is_some()
    }

    /// This node first, then every admitted peer.
    pub fn topology(&self) -> Vec<NetworkNode> {
        let own = NetworkNode::new(self.kind)
            .with("mac", self.identity.mac.as_str())
            .with("hostname", self.identity.hostname.as_str());
        std::iter::once(own)
            .chain(self.peers.iter().map(|entry| entry.value().as_node()))
            .collect()
    }
}
