//! Satellite Update Caller
//!
//! Turns a committed change into per-peer traffic. Nodes directly affected
//! get the full payload as a sequenced update; other nodes with a related
//! instance get a change notice and pull the entity themselves.
//!
//! Planning runs under the caller's model guard and only enqueues frames.
//! The notices are calls whose answers are collected by [`complete`]
//! after the guard is gone.
//!
//! [`complete`]: SatelliteUpdateCaller::complete

use super::responses::DeliveryReport;
use super::shared_pool::{required_shared_pools, LockRequester, SharedPoolLockManager};
use crate::domain::{
    Fingerprint, NodeName, Resource, ResourceDefinition, ResourceName, RetryDelivery,
    SnapshotKey, StoragePoolKey,
};
use crate::error::Result;
use crate::metrics::SyncMetrics;
use crate::model::{CoreModel, LockObj, LockRequest, ModelGuard, ResourceDefinitions};
use crate::protocol::{
    Change, ChangedNotice, ControllerMessage, EntityRef, ResourcePayload, SatelliteMessage,
};
use crate::session::{PeerRegistry, PeerSession};
use crate::supervisor::RetrySupervisor;
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

// =============================================================================
// Fan-Out
// =============================================================================

/// Traffic planned under the model locks
#[derive(Debug, Default)]
pub struct FanOut {
    report: DeliveryReport,
    notices: Vec<(NodeName, Arc<PeerSession>, ChangedNotice)>,
}

impl FanOut {
    pub fn report(&self) -> &DeliveryReport {
        &self.report
    }

    pub fn notice_count(&self) -> usize {
        self.notices.len()
    }

    pub fn merge(&mut self, other: FanOut) {
        self.report.merge(other.report);
        self.notices.extend(other.notices);
    }
}

/// What happened to one resource push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Sent,
    /// Waiting for a shared pool lock; pushed when granted
    Queued,
    /// Registered for retry
    Unreachable,
}

/// Nodes sharing at least one resource with `node`, `node` excluded
pub fn related_nodes(definitions: &ResourceDefinitions, node: &NodeName) -> BTreeSet<NodeName> {
    definitions
        .resources_on(node)
        .flat_map(|(definition, _)| definition.node_names().cloned())
        .filter(|other| other != node)
        .collect()
}

fn resource_payload(guard: &ModelGuard<'_>, definition: &ResourceDefinition) -> Result<ResourcePayload> {
    let nodes = guard.nodes()?;
    Ok(ResourcePayload {
        definition: definition.clone(),
        nodes: definition
            .node_names()
            .filter_map(|name| nodes.get(name))
            .cloned()
            .collect(),
    })
}

// =============================================================================
// Update Caller
// =============================================================================

#[derive(Clone)]
pub struct SatelliteUpdateCaller {
    model: Arc<CoreModel>,
    registry: Arc<PeerRegistry>,
    locks: Arc<SharedPoolLockManager>,
    retry: Arc<RetrySupervisor>,
    metrics: SyncMetrics,
    call_timeout: Duration,
}

impl SatelliteUpdateCaller {
    pub fn new(
        model: Arc<CoreModel>,
        registry: Arc<PeerRegistry>,
        locks: Arc<SharedPoolLockManager>,
        retry: Arc<RetrySupervisor>,
        metrics: SyncMetrics,
        call_timeout: Duration,
    ) -> Self {
        Self {
            model,
            registry,
            locks,
            retry,
            metrics,
            call_timeout,
        }
    }

    fn reachable(&self, node: &NodeName, report: &mut DeliveryReport) -> Option<Arc<PeerSession>> {
        match self.registry.get(node) {
            Some(session) if session.full_sync_failed() => {
                report.warning(node, "last full sync failed, update not sent");
                None
            }
            Some(session) if session.is_authenticated() => Some(session),
            _ => {
                report.warning(node, "satellite not connected");
                None
            }
        }
    }

    fn push(&self, fan_out: &mut FanOut, node: &NodeName, change: Change) -> bool {
        let session = match self.reachable(node, &mut fan_out.report) {
            Some(session) => session,
            None => return false,
        };
        let kind = change.kind();
        match session.send_update(change) {
            Ok(sequence) => {
                self.metrics.updates_sent.inc();
                trace!("Queued {} update #{} for {}", kind, sequence, node);
                true
            }
            Err(e) => {
                debug!("Update for {} not sent: {}", node, e);
                fan_out.report.warning(node, e.to_string());
                false
            }
        }
    }

    fn notice(
        &self,
        fan_out: &mut FanOut,
        node: &NodeName,
        entity: EntityRef,
        fingerprint: Option<Fingerprint>,
    ) {
        if let Some(session) = self.reachable(node, &mut fan_out.report) {
            fan_out.notices.push((node.clone(), session, ChangedNotice { entity, fingerprint }));
        }
    }

    // =========================================================================
    // Resources
    // =========================================================================

    fn send_resource(
        &self,
        guard: &ModelGuard<'_>,
        fan_out: &mut FanOut,
        definition: &ResourceDefinition,
        node: &NodeName,
    ) -> Result<PushOutcome> {
        let payload = resource_payload(guard, definition)?;
        if self.push(fan_out, node, Change::ApplyResource(payload)) {
            Ok(PushOutcome::Sent)
        } else {
            self.retry.register(node, &definition.name);
            Ok(PushOutcome::Unreachable)
        }
    }

    /// Push one instance, gated by the shared pool locks it needs
    pub fn push_resource(
        &self,
        guard: &ModelGuard<'_>,
        fan_out: &mut FanOut,
        definition: &ResourceDefinition,
        resource: &Resource,
    ) -> Result<PushOutcome> {
        let node = &resource.node_name;
        let required = required_shared_pools(resource, guard.storage_pools()?)?;

        if !required.is_empty() {
            let requester = LockRequester::new(node.clone(), definition.name.clone());
            if !self.locks.holds(&requester, &required) {
                let granted = self.locks.acquire(requester.clone(), &required);
                if !granted.contains(&requester) {
                    self.metrics.lock_queued.inc();
                    debug!("Resource {} waits for shared storage pool lock", requester);
                    fan_out.report.info(
                        node,
                        format!("{} waits for shared storage pool lock", definition.name),
                    );
                    return Ok(PushOutcome::Queued);
                }
                self.metrics.lock_grants.inc();
            }
        }

        self.send_resource(guard, fan_out, definition, node)
    }

    /// Push resources whose shared pool locks were just granted
    pub fn push_granted(
        &self,
        guard: &ModelGuard<'_>,
        fan_out: &mut FanOut,
        granted: Vec<LockRequester>,
    ) -> Result<()> {
        let definitions = guard.resource_definitions()?;
        let mut work: VecDeque<LockRequester> = granted.into();

        while let Some(requester) = work.pop_front() {
            self.metrics.lock_grants.inc();
            match definitions.get(&requester.resource) {
                Some(definition) if definition.has_resource_on(&requester.node) => {
                    debug!("Pushing {} after shared pool grant", requester);
                    self.send_resource(guard, fan_out, definition, &requester.node)?;
                }
                _ => {
                    // gone while waiting; hand the locks on
                    work.extend(self.locks.withdraw(&requester));
                }
            }
        }
        Ok(())
    }

    /// A definition or its instances changed.
    ///
    /// With `primary` only that node gets the payload and the other hosts a
    /// notice; without it every host gets the payload. `removed` nodes lost
    /// their instance.
    pub fn resource_changed(
        &self,
        guard: &ModelGuard<'_>,
        name: &ResourceName,
        primary: Option<&NodeName>,
        removed: &BTreeSet<NodeName>,
    ) -> Result<FanOut> {
        let mut fan_out = FanOut::default();
        let mut granted = Vec::new();

        for node in removed {
            granted.extend(self.locks.withdraw(&LockRequester::new(node.clone(), name.clone())));
            self.push(&mut fan_out, node, Change::DeleteResource { name: name.clone() });
        }

        if let Some(definition) = guard.resource_definitions()?.get(name) {
            for (node, resource) in &definition.resources {
                if primary.map_or(true, |p| p == node) {
                    self.push_resource(guard, &mut fan_out, definition, resource)?;
                } else {
                    self.notice(
                        &mut fan_out,
                        node,
                        EntityRef::ResourceDefinition(name.clone()),
                        Some(definition.fingerprint),
                    );
                }
            }
        }

        self.push_granted(guard, &mut fan_out, granted)?;
        Ok(fan_out)
    }

    pub fn resource_deleted(
        &self,
        guard: &ModelGuard<'_>,
        name: &ResourceName,
        hosts: &BTreeSet<NodeName>,
    ) -> Result<FanOut> {
        self.resource_changed(guard, name, None, hosts)
    }

    // =========================================================================
    // Nodes
    // =========================================================================

    pub fn node_changed(&self, guard: &ModelGuard<'_>, name: &NodeName) -> Result<FanOut> {
        let mut fan_out = FanOut::default();
        let node = match guard.nodes()?.get(name) {
            Some(node) => node.clone(),
            None => return Ok(fan_out),
        };
        let fingerprint = node.fingerprint;
        if node.node_type.runs_satellite() {
            self.push(&mut fan_out, name, Change::ApplyNode(node));
        }
        for peer in related_nodes(guard.resource_definitions()?, name) {
            self.notice(&mut fan_out, &peer, EntityRef::Node(name.clone()), Some(fingerprint));
        }
        Ok(fan_out)
    }

    /// `peers` are the nodes that shared resources with the deleted node
    pub fn node_deleted(
        &self,
        guard: &ModelGuard<'_>,
        name: &NodeName,
        peers: &BTreeSet<NodeName>,
    ) -> Result<FanOut> {
        let mut fan_out = FanOut::default();
        for peer in peers {
            self.push(&mut fan_out, peer, Change::DeleteNode { name: name.clone() });
        }
        let granted = self.locks.release_node(name);
        self.push_granted(guard, &mut fan_out, granted)?;
        Ok(fan_out)
    }

    // =========================================================================
    // Storage Pools and Snapshots
    // =========================================================================

    pub fn storage_pool_changed(&self, guard: &ModelGuard<'_>, key: &StoragePoolKey) -> Result<FanOut> {
        let mut fan_out = FanOut::default();
        if let Some(pool) = guard.storage_pools()?.get(key) {
            self.push(&mut fan_out, &key.0, Change::ApplyStoragePool(pool.clone()));
        }
        Ok(fan_out)
    }

    pub fn storage_pool_deleted(&self, key: &StoragePoolKey) -> FanOut {
        let mut fan_out = FanOut::default();
        self.push(
            &mut fan_out,
            &key.0,
            Change::DeleteStoragePool {
                name: key.1.clone(),
            },
        );
        fan_out
    }

    pub fn snapshot_changed(&self, guard: &ModelGuard<'_>, key: &SnapshotKey) -> Result<FanOut> {
        let mut fan_out = FanOut::default();
        let definitions = guard.resource_definitions()?;
        let snapshot = match definitions.snapshot(key) {
            Some(snapshot) => snapshot,
            None => return Ok(fan_out),
        };

        for node in snapshot.snapshots.keys() {
            self.push(&mut fan_out, node, Change::ApplySnapshot(snapshot.clone()));
        }
        if let Some(definition) = definitions.get(&key.0) {
            for node in definition.node_names() {
                if !snapshot.snapshots.contains_key(node) {
                    self.notice(
                        &mut fan_out,
                        node,
                        EntityRef::Snapshot {
                            resource: key.0.clone(),
                            snapshot: key.1.clone(),
                        },
                        Some(snapshot.fingerprint),
                    );
                }
            }
        }
        Ok(fan_out)
    }

    pub fn snapshot_ended(&self, key: &SnapshotKey, nodes: &BTreeSet<NodeName>) -> FanOut {
        let mut fan_out = FanOut::default();
        for node in nodes {
            self.push(
                &mut fan_out,
                node,
                Change::EndSnapshot {
                    resource: key.0.clone(),
                    snapshot: key.1.clone(),
                },
            );
        }
        fan_out
    }

    // =========================================================================
    // Cluster-Wide
    // =========================================================================

    /// Send a cluster-wide change to every satellite node
    pub fn broadcast(&self, guard: &ModelGuard<'_>, change: Change) -> Result<FanOut> {
        let mut fan_out = FanOut::default();
        for node in guard.nodes()?.values() {
            if node.node_type.runs_satellite() {
                self.push(&mut fan_out, &node.name, change.clone());
            }
        }
        Ok(fan_out)
    }

    // =========================================================================
    // Pull Requests
    // =========================================================================

    /// Answer a satellite asking for an entity after a change notice.
    ///
    /// Entities that are gone or not visible to the node are answered with
    /// their delete variant.
    pub fn answer_request(&self, node: &NodeName, entity: &EntityRef) -> Result<DeliveryReport> {
        let guard = self.model.lock(&LockRequest::shared());
        let definitions = guard.resource_definitions()?;
        let mut fan_out = FanOut::default();

        let change = match entity {
            EntityRef::Node(name) => {
                let visible = name == node || related_nodes(definitions, node).contains(name);
                match guard.nodes()?.get(name) {
                    Some(found) if visible => Change::ApplyNode(found.clone()),
                    _ => Change::DeleteNode { name: name.clone() },
                }
            }
            EntityRef::ResourceDefinition(name) => {
                let definition = definitions.get(name);
                match definition.and_then(|d| d.resource_on(node).map(|r| (d, r))) {
                    Some((definition, resource)) => {
                        self.push_resource(&guard, &mut fan_out, definition, resource)?;
                        return Ok(fan_out.report);
                    }
                    None => Change::DeleteResource { name: name.clone() },
                }
            }
            EntityRef::StoragePool(name) => {
                match guard.storage_pools()?.get(&(node.clone(), name.clone())) {
                    Some(pool) => Change::ApplyStoragePool(pool.clone()),
                    None => Change::DeleteStoragePool { name: name.clone() },
                }
            }
            EntityRef::Snapshot { resource, snapshot } => {
                let key = (resource.clone(), snapshot.clone());
                match definitions.snapshot(&key) {
                    Some(found) if found.snapshots.contains_key(node) => {
                        Change::ApplySnapshot(found.clone())
                    }
                    _ => Change::EndSnapshot {
                        resource: resource.clone(),
                        snapshot: snapshot.clone(),
                    },
                }
            }
            EntityRef::Remote(name) => match guard.remotes()?.get(name) {
                Some(remote) => Change::ApplyRemote(remote.clone()),
                None => Change::DeleteRemote { name: name.clone() },
            },
            EntityRef::ExternalFile(path) => match guard.external_files()?.get(path) {
                Some(file) => Change::ApplyExternalFile(file.clone()),
                None => Change::DeleteExternalFile { path: path.clone() },
            },
        };

        self.push(&mut fan_out, node, change);
        Ok(fan_out.report)
    }

    // =========================================================================
    // Completion
    // =========================================================================

    /// Deliver the planned notices concurrently and merge every answer into
    /// one report; failures become warnings
    pub async fn complete(&self, fan_out: FanOut) -> DeliveryReport {
        let FanOut { mut report, notices } = fan_out;
        let timeout = self.call_timeout;

        let mut calls: FuturesUnordered<_> = notices
            .into_iter()
            .map(|(node, session, notice)| async move {
                let result = session
                    .call(ControllerMessage::Changed(notice), timeout)
                    .await;
                (node, result)
            })
            .collect();

        while let Some((node, result)) = calls.next().await {
            match result {
                Ok(SatelliteMessage::ChangedAck) => trace!("{} acknowledged change notice", node),
                Ok(other) => {
                    report.warning(&node, format!("unexpected answer to change notice: {:?}", other));
                }
                Err(e) => {
                    warn!("Change notice to {} failed: {}", node, e);
                    report.warning(&node, e.to_string());
                }
            }
        }
        report
    }

    fn redeliver_now(&self, node: &NodeName, resource: &ResourceName) -> Result<bool> {
        let guard = self.model.lock(
            &LockRequest::new()
                .read(LockObj::Nodes)
                .read(LockObj::ResourceDefinitions)
                .read(LockObj::StoragePools),
        );
        let definition = match guard.resource_definitions()?.get(resource) {
            Some(definition) => definition,
            None => return Ok(true),
        };
        let instance = match definition.resource_on(node) {
            Some(instance) => instance,
            None => return Ok(true),
        };
        let mut fan_out = FanOut::default();
        let outcome = self.push_resource(&guard, &mut fan_out, definition, instance)?;
        Ok(outcome != PushOutcome::Unreachable)
    }
}

#[async_trait]
impl RetryDelivery for SatelliteUpdateCaller {
    async fn redeliver(&self, node: &NodeName, resource: &ResourceName) -> Result<bool> {
        self.redeliver_now(node, resource)
    }
}
