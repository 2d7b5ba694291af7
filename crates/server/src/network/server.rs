//! TCP acceptor
//!
//! Listens on the USB/IP port and spawns a connection handler per client.
//! Any number of clients may run op-phase queries; the engine admits one
//! of them at a time into the URB phase.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::engine::Engine;

use super::connection::ClientConnection;

pub struct TcpServer {
    engine: Arc<Engine>,
    listener: TcpListener,
}

impl TcpServer {
    pub async fn bind(engine: Arc<Engine>, bind_addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("bind to {}", bind_addr))?;
        info!("listening on {}", listener.local_addr()?);
        Ok(Self { engine, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, peer) = self.listener.accept().await.context("accept")?;
            // URB traffic is small and latency-bound
            if let Err(e) = stream.set_nodelay(true) {
                warn!("could not set TCP_NODELAY for {}: {}", peer, e);
            }

            info!("client connected from {}", peer);
            let engine = self.engine.clone();
            tokio::spawn(async move {
                let connection = ClientConnection::new(engine, peer);
                if let Err(e) = connection.run(stream).await {
                    warn!("connection {} ended with error: {:#}", peer, e);
                }
                info!("client {} disconnected", peer);
            });
        }
    }
}
