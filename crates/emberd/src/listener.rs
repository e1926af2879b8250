//! Inbound TCP listener. Each accepted connection runs admission in its own task.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::admission::Admission;

pub struct Listener {
    tcp: TcpListener,
    admission: Arc<Admission>,
    shutdown: broadcast::Sender<()>,
}

impl Listener {
    pub async fn bind(addr: &str, admission: Arc<Admission>, shutdown: broadcast::Sender<()>) -> Result<Self> {
        let tcp = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        Ok(Self {
            tcp,
            admission,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.tcp.local_addr()?)
    }

    pub async fn run(self) -> Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        tracing::info!(addr = %self.local_addr()?, "listening");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("listener shutting down");
                    return Ok(());
                }

                result = self.tcp.accept() => {
                    let (stream, peer_addr) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    tracing::debug!(peer = %peer_addr, "connection accepted");

                    let admission = self.admission.clone();
                    let shutdown = self.shutdown.subscribe();
                    tokio::spawn(async move {
                        if let Err(e) = admission.admit(stream, peer_addr, shutdown).await {
                            tracing::warn!(peer = %peer_addr, error = %format!("{e:#}"), "admission failed");
                        }
                    });
                }
            }
        }
    }
}
