//! Outbound mode: connect, get welcomed, say goodbye.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ember_services::protocol::ask_identity;
use ember_services::{LocalNode, Session, SessionOptions};
use tokio::net::TcpStream;

use crate::admission::envelope;

pub async fn connect(addr: &str, node: Arc<LocalNode>, password: Option<&str>, timeout: Duration) -> Result<()> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .with_context(|| format!("connect to {addr} timed out"))?
        .with_context(|| format!("failed to connect to {addr}"))?;

    let options = SessionOptions::new(addr).with_envelope(envelope(password));
    let session = tokio::time::timeout(timeout, Session::connect(stream, node, options))
        .await
        .with_context(|| format!("handshake with {addr} timed out"))?
        .with_context(|| format!("handshake with {addr} failed"))?;

    match ask_identity(&session).await {
        Some(id) => tracing::info!(peer = %addr, mac = %id.mac, hostname = %id.hostname, "connected"),
        None => tracing::info!(peer = %addr, "connected"),
    }

    session.close().await;
    Ok(())
}
