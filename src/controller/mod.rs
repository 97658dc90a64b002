//! Controller
//!
//! Owns the authoritative model and every satellite session. Satellites dial
//! in and authenticate; each accepted one gets a full sync, then a sequenced
//! stream of incremental updates driven by the mutation API.

pub mod authenticator;
pub mod full_sync;
pub mod handler;
pub mod mutations;
pub mod responses;
pub mod shared_pool;
pub mod update_caller;

pub use authenticator::{Accepted, Authenticator};
pub use full_sync::FullSyncDispatcher;
pub use responses::{DeliveryEntry, DeliveryReport, ReportLevel};
pub use shared_pool::{required_shared_pools, LockRequester, SharedPoolLockManager};
pub use update_caller::{FanOut, PushOutcome, SatelliteUpdateCaller};

use crate::config::ControllerConfig;
use crate::error::Result;
use crate::metrics::SyncMetrics;
use crate::model::CoreModel;
use crate::net::SessionListener;
use crate::protocol::{ControllerMessage, Frame};
use crate::session::{PeerRegistry, PeerSession};
use crate::supervisor::{KeepAlive, LostPeer, ReconnectSupervisor, RetrySupervisor};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone, Serialize)]
pub struct PeerStatus {
    pub node: String,
    pub session_id: u64,
    pub status: String,
    pub epoch: u64,
    pub next_sequence: u64,
    pub last_seen: DateTime<Utc>,
}

/// Snapshot for the health endpoints
#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub peers: Vec<PeerStatus>,
    pub lost: Vec<LostPeer>,
    pub held_shared_pools: usize,
    pub waiting_lock_requests: usize,
    pub pending_retries: usize,
}

pub struct Controller {
    config: ControllerConfig,
    model: Arc<CoreModel>,
    registry: Arc<PeerRegistry>,
    locks: Arc<SharedPoolLockManager>,
    retry: Arc<RetrySupervisor>,
    reconnect: Arc<ReconnectSupervisor>,
    metrics: SyncMetrics,
    authenticator: Authenticator,
    full_sync: FullSyncDispatcher,
    updates: SatelliteUpdateCaller,
    next_session_id: AtomicU64,
    shutdown: CancellationToken,
}

impl Controller {
    pub fn new(config: ControllerConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let metrics = SyncMetrics::new()?;
        let model = Arc::new(CoreModel::new());
        let registry = PeerRegistry::new();
        let locks = Arc::new(SharedPoolLockManager::new());
        let retry = Arc::new(RetrySupervisor::new(config.retry_interval(), metrics.clone()));
        let reconnect = Arc::new(ReconnectSupervisor::new());

        let authenticator = Authenticator::new(
            model.clone(),
            registry.clone(),
            reconnect.clone(),
            config.match_peer_address,
        );
        let full_sync = FullSyncDispatcher::new(
            model.clone(),
            locks.clone(),
            registry.clone(),
            retry.clone(),
            metrics.clone(),
            config.full_sync_awaits_response,
            config.call_timeout(),
        );
        let updates = SatelliteUpdateCaller::new(
            model.clone(),
            registry.clone(),
            locks.clone(),
            retry.clone(),
            metrics.clone(),
            config.call_timeout(),
        );

        Ok(Arc::new(Self {
            config,
            model,
            registry,
            locks,
            retry,
            reconnect,
            metrics,
            authenticator,
            full_sync,
            updates,
            next_session_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        }))
    }

    pub fn metrics(&self) -> &SyncMetrics {
        &self.metrics
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn locks(&self) -> &Arc<SharedPoolLockManager> {
        &self.locks
    }

    /// Create the session for a new connection
    pub fn accept_session(
        &self,
        remote_addr: Option<SocketAddr>,
    ) -> (Arc<PeerSession>, mpsc::UnboundedReceiver<Frame<ControllerMessage>>) {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        PeerSession::new(id, remote_addr)
    }

    /// Tear down a session whose link ended
    pub fn session_closed(&self, session: &Arc<PeerSession>) {
        session.close();
        if let Some(node) = session.node_name() {
            if self.registry.deregister(&node, session.id()) {
                info!("Satellite {} disconnected (session {})", node, session.id());
            }
        }
        self.metrics
            .peers_online
            .set(self.registry.online_nodes().len() as i64);
    }

    pub fn status(&self) -> ControllerStatus {
        let peers = self
            .registry
            .sessions()
            .into_iter()
            .map(|session| PeerStatus {
                node: session.label(),
                session_id: session.id(),
                status: session.status().to_string(),
                epoch: session.epoch(),
                next_sequence: session.next_sequence(),
                last_seen: session.last_seen(),
            })
            .collect();

        ControllerStatus {
            peers,
            lost: self.reconnect.lost(),
            held_shared_pools: self.locks.held_count(),
            waiting_lock_requests: self.locks.waiting_count(),
            pending_retries: self.retry.len(),
        }
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = SessionListener::bind(self.config.listen()?).await?;
        self.run_on(listener).await;
        Ok(())
    }

    /// Serve on a bound listener with the background supervisors
    pub async fn run_on(self: Arc<Self>, listener: SessionListener) {
        let token = self.shutdown.clone();
        let mut tasks = Vec::new();

        let keepalive = KeepAlive::new(
            self.registry.clone(),
            self.config.keepalive_interval(),
            self.config.keepalive_timeout_secs,
        );
        let keepalive_token = token.clone();
        tasks.push(tokio::spawn(async move { keepalive.run(keepalive_token).await }));

        let retry = self.retry.clone();
        let delivery: crate::domain::RetryDeliveryRef = Arc::new(self.updates.clone());
        let retry_token = token.clone();
        tasks.push(tokio::spawn(async move { retry.run(delivery, retry_token).await }));

        let reconnect = self.reconnect.clone();
        let registry = self.registry.clone();
        let reconnect_token = token.clone();
        tasks.push(tokio::spawn(async move {
            reconnect.run(registry, reconnect_token).await
        }));

        listener.run(self.clone(), token).await;
        futures::future::join_all(tasks).await;
        info!("Controller stopped");
    }

    /// Stop accepting, close every session and end the supervisors
    pub fn shutdown(&self) {
        info!("Controller shutting down");
        self.shutdown.cancel();
        for session in self.registry.sessions() {
            session.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ClusterNode, NodeType};
    use std::time::Duration;

    #[tokio::test]
    async fn test_status_lists_sessions() {
        let controller = Controller::new(ControllerConfig::default()).unwrap();
        controller
            .upsert_node(ClusterNode::new("node-a", NodeType::Satellite))
            .await
            .unwrap();

        let (session, _rx) = controller.accept_session(None);
        session
            .transition(crate::session::ConnectionStatus::Authenticating)
            .unwrap();
        session.mark_authenticated("node-a".into()).unwrap();
        controller.registry.register(session.clone()).unwrap();

        let status = controller.status();
        assert_eq!(status.peers.len(), 1);
        assert_eq!(status.peers[0].node, "node-a");

        controller.session_closed(&session);
        assert!(controller.status().peers.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_run() {
        let controller = Controller::new(ControllerConfig::default()).unwrap();
        let listener = SessionListener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let task = tokio::spawn(controller.clone().run_on(listener));

        tokio::time::sleep(Duration::from_millis(20)).await;
        controller.shutdown();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
