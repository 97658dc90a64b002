//! Satellite
//!
//! Holds the projection of the cluster model the controller sends this
//! node. The satellite dials the controller, authenticates, installs the
//! full sync and then applies incremental updates strictly in sequence
//! order.

pub mod applier;
pub mod changes;
pub mod full_sync;
pub mod handler;
pub mod runtime;
pub mod update_monitor;

pub use applier::UpdateApplier;
pub use changes::{from_envelope, lock_request, ApplyChange, ApplyEffects, Header};
pub use full_sync::FullSyncInstaller;
pub use runtime::{LoggingReconciler, ProcessLifecycle, StaticProbe};
pub use update_monitor::{SatelliteStatus, UpdateMonitor};

use crate::config::SatelliteConfig;
use crate::domain::{
    DeviceReconcilerRef, EnvironmentProbeRef, Fingerprint, LifecycleControl,
    LifecycleControlRef, NodeName,
};
use crate::error::{Error, ErrorAction, Result};
use crate::metrics::SyncMetrics;
use crate::model::CoreModel;
use crate::net::{read_frames, write_frames, ReadEnd};
use crate::protocol::{AuthRequest, Frame, SatelliteMessage, PROTOCOL_VERSION};
use crate::supervisor::ControllerConnector;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Snapshot for the health endpoints
#[derive(Debug, Clone, Serialize)]
pub struct SatelliteState {
    pub node: String,
    pub status: SatelliteStatus,
    pub epoch: u64,
    pub awaited_sequence: Option<u64>,
    pub pending_updates: usize,
}

// =============================================================================
// Link
// =============================================================================

/// Outbound half of the current controller connection
pub(crate) struct Link {
    tx: mpsc::UnboundedSender<Frame<SatelliteMessage>>,
    token: CancellationToken,
}

impl Link {
    fn push(&self, frame: Frame<SatelliteMessage>) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Error::SendFailed {
                node: "controller".into(),
                reason: "link closed".into(),
            });
        }
        self.tx.send(frame).map_err(|_| Error::SendFailed {
            node: "controller".into(),
            reason: "writer stopped".into(),
        })
    }

    pub(crate) fn send(&self, message: SatelliteMessage) -> Result<()> {
        self.push(Frame::oneway(message))
    }

    pub(crate) fn respond(&self, call_id: u64, message: SatelliteMessage) -> Result<()> {
        self.push(Frame::response(call_id, message))
    }
}

/// Routes lifecycle requests of the applier to the current link before
/// handing them to the process lifecycle
struct LinkControl {
    inner: LifecycleControlRef,
    current: Mutex<Option<CancellationToken>>,
    shutdown: CancellationToken,
}

impl LinkControl {
    fn attach(&self, token: CancellationToken) {
        *self.current.lock() = Some(token);
    }

    fn detach(&self) {
        self.current.lock().take();
    }
}

impl LifecycleControl for LinkControl {
    fn request_shutdown(&self, reason: &str) {
        self.shutdown.cancel();
        self.inner.request_shutdown(reason);
    }

    fn drop_controller_connection(&self, reason: &str) {
        if let Some(token) = self.current.lock().as_ref() {
            token.cancel();
        }
        self.inner.drop_controller_connection(reason);
    }
}

// =============================================================================
// Satellite
// =============================================================================

pub struct Satellite {
    config: SatelliteConfig,
    local_node: NodeName,
    model: Arc<CoreModel>,
    monitor: Arc<UpdateMonitor>,
    applier: UpdateApplier,
    installer: FullSyncInstaller,
    reconciler: DeviceReconcilerRef,
    probe: EnvironmentProbeRef,
    link: Arc<LinkControl>,
    metrics: SyncMetrics,
    /// Presented on every handshake; nil until the controller accepted us once
    fingerprint: Mutex<Fingerprint>,
    shutdown: CancellationToken,
}

impl Satellite {
    pub fn new(
        config: SatelliteConfig,
        reconciler: DeviceReconcilerRef,
        probe: EnvironmentProbeRef,
        lifecycle: LifecycleControlRef,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let local_node = NodeName::new(config.node_name.trim());
        let metrics = SyncMetrics::new()?;
        let model = Arc::new(CoreModel::new());
        let monitor = Arc::new(UpdateMonitor::new());
        let shutdown = CancellationToken::new();
        let link = Arc::new(LinkControl {
            inner: lifecycle,
            current: Mutex::new(None),
            shutdown: shutdown.clone(),
        });

        let applier = UpdateApplier::new(
            local_node.clone(),
            model.clone(),
            monitor.clone(),
            link.clone(),
            metrics.clone(),
        );
        let installer = FullSyncInstaller::new(local_node.clone(), model.clone(), monitor.clone());

        Ok(Arc::new(Self {
            config,
            local_node,
            model,
            monitor,
            applier,
            installer,
            reconciler,
            probe,
            link,
            metrics,
            fingerprint: Mutex::new(Fingerprint::nil()),
            shutdown,
        }))
    }

    pub fn local_node(&self) -> &NodeName {
        &self.local_node
    }

    pub fn model(&self) -> &Arc<CoreModel> {
        &self.model
    }

    pub fn monitor(&self) -> &Arc<UpdateMonitor> {
        &self.monitor
    }

    pub fn metrics(&self) -> &SyncMetrics {
        &self.metrics
    }

    pub fn state(&self) -> SatelliteState {
        SatelliteState {
            node: self.local_node.to_string(),
            status: self.monitor.status(),
            epoch: self.monitor.current_epoch(),
            awaited_sequence: self.monitor.awaited(),
            pending_updates: self.applier.pending_len(),
        }
    }

    /// Run one controller connection until it ends
    pub async fn serve_link<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.monitor.connected()?;
        let (reader, writer) = tokio::io::split(stream);
        let token = self.shutdown.child_token();
        let (tx, outbound) = mpsc::unbounded_channel();
        let link = Link {
            tx,
            token: token.clone(),
        };
        self.link.attach(token.clone());
        let writer = tokio::spawn(write_frames(writer, outbound, token.clone()));

        let fingerprint = *self.fingerprint.lock();
        let result = match link.send(SatelliteMessage::Authenticate(AuthRequest {
            node_name: self.local_node.clone(),
            fingerprint,
            version: PROTOCOL_VERSION,
        })) {
            Ok(()) => {
                read_frames(reader, token.clone(), |frame| self.handle_frame(&link, frame)).await
            }
            Err(e) => Err(e),
        };

        token.cancel();
        self.link.detach();
        match writer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Controller link writer ended: {}", e),
            Err(e) => warn!("Controller link writer panicked: {}", e),
        }
        self.applier.clear();
        self.monitor.disconnected();

        match result? {
            ReadEnd::Eof => info!("Controller closed the connection"),
            ReadEnd::Cancelled => debug!("Controller connection closed locally"),
        }
        Ok(())
    }

    /// Dial the controller and keep the link up until shutdown
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let connector = ControllerConnector::from_config(&self.config)?;
        info!(
            "Satellite {} connecting to {}",
            self.local_node, self.config.controller_addr
        );
        connector
            .run(self.shutdown.clone(), |stream| {
                let satellite = self.clone();
                async move {
                    if let Err(e) = satellite.serve_link(stream).await {
                        match e.action() {
                            ErrorAction::Fatal => error!("Controller link: {}", e),
                            _ => warn!("Controller link: {}", e),
                        }
                    }
                }
            })
            .await;
        info!("Satellite {} stopped", self.local_node);
        Ok(())
    }

    pub fn shutdown(&self) {
        info!("Satellite shutting down");
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerConfig;
    use crate::controller::Controller;
    use crate::domain::{
        ClusterNode, NodeType, Resource, ResourceDefinition, ResourceGroupRef, ResourceName,
        StoragePool,
    };
    use crate::model::LockRequest;
    use std::time::Duration;

    fn satellite(node: &str) -> (Arc<Satellite>, Arc<ProcessLifecycle>) {
        let config = SatelliteConfig {
            node_name: node.into(),
            ..Default::default()
        };
        let lifecycle = Arc::new(ProcessLifecycle::new());
        let satellite = Satellite::new(
            config.clone(),
            Arc::new(LoggingReconciler),
            Arc::new(StaticProbe::from_config(&config)),
            lifecycle.clone(),
        )
        .unwrap();
        (satellite, lifecycle)
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[test]
    fn test_new_requires_node_name() {
        let result = Satellite::new(
            SatelliteConfig::default(),
            Arc::new(LoggingReconciler),
            Arc::new(StaticProbe::from_config(&SatelliteConfig::default())),
            Arc::new(ProcessLifecycle::new()),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_controller_and_satellite_converge() {
        let controller = Controller::new(ControllerConfig {
            match_peer_address: false,
            ..Default::default()
        })
        .unwrap();
        controller
            .upsert_node(ClusterNode::new("node-a", NodeType::Satellite))
            .await
            .unwrap();
        controller
            .upsert_storage_pool(StoragePool::new("pool-1", "node-a", "LVM"))
            .await
            .unwrap();

        let (satellite, _lifecycle) = satellite("node-a");
        let (near, far) = tokio::io::duplex(256 * 1024);
        let serving = controller.clone();
        tokio::spawn(async move { serving.serve_stream(far, None).await });
        let linked = satellite.clone();
        let link = tokio::spawn(async move { linked.serve_link(near).await });

        assert!(eventually(|| satellite.monitor().is_online()).await);
        assert!(eventually(|| controller.registry().online_nodes().len() == 1).await);

        let definition = ResourceDefinition::new("rsc-1", ResourceGroupRef::new("rg"))
            .with_resource(Resource::new("node-a").with_volume(0, "pool-1"));
        controller.upsert_resource_definition(definition).await.unwrap();

        let model = satellite.model().clone();
        assert!(
            eventually(|| {
                let guard = model.lock(&LockRequest::shared());
                guard
                    .resource_definitions()
                    .map(|d| d.contains(&ResourceName::new("rsc-1")))
                    .unwrap_or(false)
            })
            .await
        );
        assert_eq!(satellite.state().awaited_sequence, Some(2));

        satellite.shutdown();
        let ended = tokio::time::timeout(Duration::from_secs(5), link).await.unwrap().unwrap();
        assert!(ended.is_ok());
        assert_eq!(satellite.monitor().status(), SatelliteStatus::Disconnected);
    }
}
