//! Reconnection
//!
//! The controller side remembers peers that were refused or lost until they
//! come back online. The satellite side owns the dialing loop: it connects
//! with a bounded timeout, runs the link until it drops, and backs off
//! exponentially between attempts.

use crate::config::SatelliteConfig;
use crate::error::{Error, Result};
use crate::session::{PeerEvent, PeerRegistry};
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// =============================================================================
// Controller Side
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LossReason {
    /// The handshake was refused
    Refused(String),
    Disconnected,
    Stale,
    FullSyncFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LostPeer {
    pub node: String,
    pub reason: LossReason,
    pub since: DateTime<Utc>,
    /// Losses recorded since the peer was last online
    pub occurrences: u32,
}

/// Peers expected to reconnect
#[derive(Debug, Default)]
pub struct ReconnectSupervisor {
    lost: Mutex<BTreeMap<String, LostPeer>>,
}

impl ReconnectSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, node: &str, reason: LossReason) {
        let key = node.to_lowercase();
        let mut lost = self.lost.lock();
        match lost.get_mut(&key) {
            Some(peer) => {
                peer.occurrences += 1;
                peer.reason = reason;
            }
            None => {
                lost.insert(
                    key,
                    LostPeer {
                        node: node.to_string(),
                        reason,
                        since: Utc::now(),
                        occurrences: 1,
                    },
                );
            }
        }
        debug!("Awaiting reconnect of {}", node);
    }

    /// The peer is back; returns whether it had been lost
    pub fn recovered(&self, node: &str) -> bool {
        self.lost.lock().remove(&node.to_lowercase()).is_some()
    }

    pub fn is_lost(&self, node: &str) -> bool {
        self.lost.lock().contains_key(&node.to_lowercase())
    }

    pub fn lost(&self) -> Vec<LostPeer> {
        self.lost.lock().values().cloned().collect()
    }

    pub fn handle_event(&self, event: &PeerEvent) {
        match event {
            PeerEvent::PeerDeregistered { node, .. } => self.record(node, LossReason::Disconnected),
            PeerEvent::PeerWentStale { node } => self.record(node, LossReason::Stale),
            PeerEvent::FullSyncFailed { node } => self.record(node, LossReason::FullSyncFailed),
            PeerEvent::PeerOnline { node } => {
                if self.recovered(node) {
                    info!("Peer {} reconnected", node);
                }
            }
            PeerEvent::PeerRegistered { .. } => {}
        }
    }

    /// Follow registry events until cancelled
    pub async fn run(&self, registry: Arc<PeerRegistry>, token: CancellationToken) {
        let mut events = registry.subscribe();
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => self.handle_event(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Reconnect supervisor skipped {} peer events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    }
}

// =============================================================================
// Satellite Side
// =============================================================================

/// Dials the controller and redials with exponential backoff
#[derive(Debug, Clone)]
pub struct ControllerConnector {
    addr: SocketAddr,
    connect_timeout: Duration,
    initial_delay: Duration,
    max_delay: Duration,
}

impl ControllerConnector {
    pub fn new(
        addr: SocketAddr,
        connect_timeout: Duration,
        initial_delay: Duration,
        max_delay: Duration,
    ) -> Self {
        Self {
            addr,
            connect_timeout,
            initial_delay,
            max_delay,
        }
    }

    pub fn from_config(config: &SatelliteConfig) -> Result<Self> {
        Ok(Self::new(
            config.controller()?,
            config.connect_timeout(),
            config.reconnect_initial(),
            config.reconnect_max(),
        ))
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_delay)
            .with_max_interval(self.max_delay)
            .with_max_elapsed_time(None)
            .build()
    }

    /// One connection attempt bounded by the connect timeout
    pub async fn connect_once(&self) -> Result<TcpStream> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| Error::ConnectTimeout {
                addr: self.addr.to_string(),
            })??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Connect, hand the stream to `link` until it returns, and start over
    /// until cancelled. The backoff restarts after every established link.
    pub async fn run<F, Fut>(&self, token: CancellationToken, mut link: F)
    where
        F: FnMut(TcpStream) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut backoff = self.backoff();
        loop {
            let attempt = tokio::select! {
                _ = token.cancelled() => break,
                attempt = self.connect_once() => attempt,
            };

            match attempt {
                Ok(stream) => {
                    info!("Connected to controller at {}", self.addr);
                    backoff.reset();
                    link(stream).await;
                    if token.is_cancelled() {
                        break;
                    }
                    warn!("Connection to controller at {} lost", self.addr);
                }
                Err(e) => debug!("Connecting to {} failed: {}", self.addr, e),
            }

            let delay = backoff.next_backoff().unwrap_or(self.max_delay);
            debug!("Redialing {} in {:?}", self.addr, delay);
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!("Stopped dialing {}", self.addr);
    }
}
