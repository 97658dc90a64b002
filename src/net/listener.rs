//! Session Listener
//!
//! Accepts satellite connections and hands each one to a
//! [`ConnectionHandler`] on its own task.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Serves one accepted connection until it ends
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    async fn serve(&self, stream: TcpStream, peer: SocketAddr);
}

pub struct SessionListener {
    listener: TcpListener,
}

impl SessionListener {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Internal(format!("Failed to bind session listener on {}: {}", addr, e)))?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept until cancelled. Accept errors are logged and do not stop
    /// the listener.
    pub async fn run<H: ConnectionHandler>(self, handler: Arc<H>, token: CancellationToken) {
        match self.listener.local_addr() {
            Ok(addr) => info!("Session listener accepting on {}", addr),
            Err(e) => warn!("Session listener address unknown: {}", e),
        }

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Accepted connection from {}", peer);
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("TCP_NODELAY on {} failed: {}", peer, e);
                        }
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            handler.serve(stream, peer).await;
                        });
                    }
                    Err(e) => {
                        error!("Accept failed: {}", e);
                    }
                },
            }
        }
        info!("Session listener stopped");
    }
}
