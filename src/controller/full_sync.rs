//! Full Synchronization
//!
//! Builds everything one satellite must know and enqueues it while the
//! model read locks are still held. A mutation committed before the locks
//! were taken is part of the snapshot; one committed after is numbered
//! after it.

use super::shared_pool::{required_shared_pools, LockRequester, SharedPoolLockManager};
use crate::domain::{CapabilityReport, NodeName};
use crate::error::{Error, Result};
use crate::metrics::SyncMetrics;
use crate::model::{CoreModel, LockRequest, ModelGuard};
use crate::protocol::{FullSyncData, FullSyncResult, SatelliteMessage};
use crate::session::{PeerEvent, PeerRegistry, PeerSession};
use crate::supervisor::RetrySupervisor;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Entities `node` must know about, tagged with `epoch`.
///
/// The closure is the node itself, every definition with an instance on it
/// together with the nodes of all its instances, every storage pool of the
/// node, in-progress snapshots present on the node, and the cluster-wide
/// remotes, external files, properties and secret.
///
/// An instance on a shared storage pool is only included once `node` holds
/// its shared pool locks. One that has to wait is left out and pushed as an
/// update when its lock is granted.
pub fn collect(
    guard: &ModelGuard<'_>,
    locks: &SharedPoolLockManager,
    node: &NodeName,
    epoch: u64,
) -> Result<FullSyncData> {
    let nodes = guard.nodes()?;
    let definitions = guard.resource_definitions()?;
    let pools = guard.storage_pools()?;
    let config = guard.config()?;

    if !nodes.contains_key(node) {
        return Err(Error::EntityNotFound {
            kind: "node".into(),
            name: node.to_string(),
        });
    }

    let mut related: BTreeSet<&NodeName> = BTreeSet::new();
    related.insert(node);
    let mut resource_definitions = Vec::new();
    for (definition, resource) in definitions.resources_on(node) {
        let required = required_shared_pools(resource, pools)?;
        if !required.is_empty() {
            let requester = LockRequester::new(node.clone(), definition.name.clone());
            if !locks.holds(&requester, &required)
                && !locks.acquire(requester.clone(), &required).contains(&requester)
            {
                debug!(
                    "Full sync of {} leaves out {} until its shared pool lock is granted",
                    node, definition.name
                );
                continue;
            }
        }
        related.extend(definition.node_names());
        resource_definitions.push(definition.clone());
    }

    Ok(FullSyncData {
        epoch,
        sequence: 0,
        nodes: related
            .into_iter()
            .filter_map(|name| nodes.get(name))
            .cloned()
            .collect(),
        storage_pools: pools
            .values()
            .filter(|pool| pool.node_name == *node)
            .cloned()
            .collect(),
        resource_definitions,
        snapshots: definitions
            .snapshots()
            .filter(|s| s.in_progress() && s.snapshots.contains_key(node))
            .cloned()
            .collect(),
        remotes: guard.remotes()?.values().cloned().collect(),
        external_files: guard.external_files()?.values().cloned().collect(),
        cluster_props: config.props.clone(),
        secret: config.secret.clone(),
    })
}

/// The answer to a full sync sent as a call
pub struct PendingFullSync {
    call_id: u64,
    answer: oneshot::Receiver<SatelliteMessage>,
}

#[derive(Clone)]
pub struct FullSyncDispatcher {
    model: Arc<CoreModel>,
    locks: Arc<SharedPoolLockManager>,
    registry: Arc<PeerRegistry>,
    retry: Arc<RetrySupervisor>,
    metrics: SyncMetrics,
    awaits_response: bool,
    call_timeout: Duration,
}

impl FullSyncDispatcher {
    pub fn new(
        model: Arc<CoreModel>,
        locks: Arc<SharedPoolLockManager>,
        registry: Arc<PeerRegistry>,
        retry: Arc<RetrySupervisor>,
        metrics: SyncMetrics,
        awaits_response: bool,
        call_timeout: Duration,
    ) -> Self {
        Self {
            model,
            locks,
            registry,
            retry,
            metrics,
            awaits_response,
            call_timeout,
        }
    }

    /// Enqueue the full sync of `epoch` for an authenticated session.
    ///
    /// Without awaiting a response the session is online right away;
    /// otherwise the returned handle resolves the satellite's answer.
    pub fn send(&self, session: &Arc<PeerSession>, epoch: u64) -> Result<Option<PendingFullSync>> {
        let node = session.node_name().ok_or_else(|| {
            Error::Implementation(format!("full sync for unauthenticated session {}", session.id()))
        })?;

        let pending = {
            let guard = self.model.lock(&LockRequest::shared());
            let data = collect(&guard, &self.locks, &node, epoch)?;
            info!(
                "Sending full sync to {} (epoch {}, {} nodes, {} resources, {} storage pools)",
                node,
                epoch,
                data.nodes.len(),
                data.resource_definitions.len(),
                data.storage_pools.len()
            );
            session.send_full_sync(data, self.awaits_response)?
        };
        self.metrics.full_syncs_sent.inc();

        match pending {
            Some((call_id, answer)) => Ok(Some(PendingFullSync { call_id, answer })),
            None => {
                self.mark_online(session, &node, None)?;
                Ok(None)
            }
        }
    }

    /// Wait for the satellite to report the outcome of its full sync
    pub async fn await_outcome(&self, session: &Arc<PeerSession>, pending: PendingFullSync) -> Result<()> {
        let node = session.node_name().unwrap_or_else(|| NodeName::new(session.label()));
        let answer = session
            .await_answer(pending.call_id, pending.answer, self.call_timeout)
            .await?;

        match answer {
            SatelliteMessage::FullSyncResponse(FullSyncResult::Success(report)) => {
                self.mark_online(session, &node, Some(report))
            }
            SatelliteMessage::FullSyncResponse(FullSyncResult::Failed { reason }) => {
                self.mark_failed(session, &node, &reason)
            }
            other => Err(Error::InvalidPayload(format!(
                "unexpected answer to full sync from {}: {:?}",
                node, other
            ))),
        }
    }

    pub fn mark_online(
        &self,
        session: &Arc<PeerSession>,
        node: &NodeName,
        report: Option<CapabilityReport>,
    ) -> Result<()> {
        session.complete_full_sync(report)?;
        // the snapshot carried everything that was waiting for redelivery
        self.retry.forget_node(node);
        self.metrics.peers_online.set(self.registry.online_nodes().len() as i64);
        self.registry.emit(PeerEvent::PeerOnline {
            node: node.to_string(),
        });
        info!("Satellite {} online (epoch {})", node, session.epoch());
        Ok(())
    }

    pub fn mark_failed(&self, session: &Arc<PeerSession>, node: &NodeName, reason: &str) -> Result<()> {
        warn!(
            "Satellite {} failed to apply full sync of epoch {}: {}",
            node,
            session.epoch(),
            reason
        );
        session.fail_full_sync()?;
        self.metrics.full_syncs_failed.inc();
        self.metrics.peers_online.set(self.registry.online_nodes().len() as i64);
        self.registry.emit(PeerEvent::FullSyncFailed {
            node: node.to_string(),
        });
        Ok(())
    }
}
