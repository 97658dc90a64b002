//! Controller Mutations
//!
//! The entry point for collaborators changing the cluster model. Every
//! mutation commits under the write lock of its collection and enqueues the
//! sequenced updates before the locks go; change notices are awaited after.

use super::update_caller::{related_nodes, FanOut};
use super::{responses::DeliveryReport, shared_pool::shared_pools_of, Controller};
use crate::domain::{
    ClusterNode, EntityKind, ExternalFile, NodeName, Props, Remote, RemoteName,
    Resource, ResourceDefinition, ResourceName, SnapshotDefinition, SnapshotKey, StoragePool,
    StoragePoolKey,
};
use crate::error::{Error, Result};
use crate::model::{LockObj, LockRequest};
use crate::protocol::Change;
use std::collections::BTreeSet;
use tracing::info;

fn not_found(kind: EntityKind, name: impl std::fmt::Display) -> Error {
    Error::EntityNotFound {
        kind: kind.to_string(),
        name: name.to_string(),
    }
}

fn resource_locks() -> LockRequest {
    LockRequest::new()
        .read(LockObj::Nodes)
        .write(LockObj::ResourceDefinitions)
        .read(LockObj::StoragePools)
}

impl Controller {
    async fn finish(&self, fan_out: FanOut) -> DeliveryReport {
        let report = self.updates.complete(fan_out).await;
        for entry in report.warnings() {
            info!("Delivery to {}: {}", entry.node, entry.message);
        }
        report
    }

    // =========================================================================
    // Nodes
    // =========================================================================

    pub async fn upsert_node(&self, node: ClusterNode) -> Result<DeliveryReport> {
        let fan_out = {
            let mut guard = self.model.lock(
                &LockRequest::new()
                    .write(LockObj::Nodes)
                    .read(LockObj::ResourceDefinitions),
            );
            let nodes = guard.nodes_mut()?;
            EntityKind::Node.verify_identity(
                node.name.as_str(),
                nodes.get(&node.name).map(|n| n.fingerprint),
                node.fingerprint,
            )?;
            let name = node.name.clone();
            nodes.insert(name.clone(), node);
            self.updates.node_changed(&guard, &name)?
        };
        Ok(self.finish(fan_out).await)
    }

    /// Remove a node with its resource instances and storage pools
    pub async fn delete_node(&self, name: &NodeName) -> Result<DeliveryReport> {
        let fan_out = {
            let mut guard = self.model.lock(
                &LockRequest::new()
                    .write(LockObj::Nodes)
                    .write(LockObj::ResourceDefinitions)
                    .write(LockObj::StoragePools),
            );
            if guard.nodes_mut()?.remove(name).is_none() {
                return Err(not_found(EntityKind::Node, name));
            }
            let peers = related_nodes(guard.resource_definitions()?, name);
            let affected = guard.resource_definitions_mut()?.remove_instances_on(name);
            guard.storage_pools_mut()?.retain(|(node, _), _| node != name);
            self.retry.forget_node(name);
            info!(
                "Deleted node {} ({} resource instances, {} peers to notify)",
                name,
                affected.len(),
                peers.len()
            );
            self.updates.node_deleted(&guard, name, &peers)?
        };
        if let Some(session) = self.registry.get(name) {
            session.close();
        }
        Ok(self.finish(fan_out).await)
    }

    // =========================================================================
    // Resources
    // =========================================================================

    pub async fn upsert_resource_definition(
        &self,
        definition: ResourceDefinition,
    ) -> Result<DeliveryReport> {
        let fan_out = {
            let mut guard = self.model.lock(&resource_locks());
            {
                let nodes = guard.nodes()?;
                let pools = guard.storage_pools()?;
                for resource in definition.resources.values() {
                    if !nodes.contains_key(&resource.node_name) {
                        return Err(not_found(EntityKind::Node, &resource.node_name));
                    }
                    shared_pools_of(resource, pools)?;
                }
            }

            let definitions = guard.resource_definitions_mut()?;
            let existing = definitions.get(&definition.name);
            EntityKind::ResourceDefinition.verify_identity(
                definition.name.as_str(),
                existing.map(|d| d.fingerprint),
                definition.fingerprint,
            )?;
            let removed: BTreeSet<NodeName> = existing
                .map(|old| {
                    old.node_names()
                        .filter(|node| !definition.has_resource_on(node))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();

            let name = definition.name.clone();
            definitions.insert(definition);
            self.updates.resource_changed(&guard, &name, None, &removed)?
        };
        Ok(self.finish(fan_out).await)
    }

    /// Create or replace one instance of an existing definition
    pub async fn upsert_resource(
        &self,
        name: &ResourceName,
        resource: Resource,
    ) -> Result<DeliveryReport> {
        let fan_out = {
            let mut guard = self.model.lock(&resource_locks());
            if !guard.nodes()?.contains_key(&resource.node_name) {
                return Err(not_found(EntityKind::Node, &resource.node_name));
            }
            shared_pools_of(&resource, guard.storage_pools()?)?;

            let definition = guard
                .resource_definitions_mut()?
                .get_mut(name)
                .ok_or_else(|| not_found(EntityKind::ResourceDefinition, name))?;
            EntityKind::ResourceDefinition.verify_identity(
                &format!("{}@{}", name, resource.node_name),
                definition.resource_on(&resource.node_name).map(|r| r.fingerprint),
                resource.fingerprint,
            )?;
            let node = resource.node_name.clone();
            definition.resources.insert(node.clone(), resource);
            self.updates.resource_changed(&guard, name, Some(&node), &BTreeSet::new())?
        };
        Ok(self.finish(fan_out).await)
    }

    /// Remove one instance; the remaining hosts get a change notice
    pub async fn delete_resource(&self, name: &ResourceName, node: &NodeName) -> Result<DeliveryReport> {
        let fan_out = {
            let mut guard = self.model.lock(&resource_locks());
            let definition = guard
                .resource_definitions_mut()?
                .get_mut(name)
                .ok_or_else(|| not_found(EntityKind::ResourceDefinition, name))?;
            if definition.resources.remove(node).is_none() {
                return Err(not_found(EntityKind::ResourceDefinition, format!("{}@{}", name, node)));
            }
            let removed = BTreeSet::from([node.clone()]);
            self.updates.resource_changed(&guard, name, Some(node), &removed)?
        };
        Ok(self.finish(fan_out).await)
    }

    pub async fn delete_resource_definition(&self, name: &ResourceName) -> Result<DeliveryReport> {
        let fan_out = {
            let mut guard = self.model.lock(&resource_locks());
            let removed = guard
                .resource_definitions_mut()?
                .remove(name)
                .ok_or_else(|| not_found(EntityKind::ResourceDefinition, name))?;
            let hosts: BTreeSet<NodeName> = removed.node_names().cloned().collect();
            self.updates.resource_deleted(&guard, name, &hosts)?
        };
        Ok(self.finish(fan_out).await)
    }

    // =========================================================================
    // Storage Pools
    // =========================================================================

    pub async fn upsert_storage_pool(&self, pool: StoragePool) -> Result<DeliveryReport> {
        let fan_out = {
            let mut guard = self.model.lock(
                &LockRequest::new()
                    .read(LockObj::Nodes)
                    .write(LockObj::StoragePools),
            );
            if !guard.nodes()?.contains_key(&pool.node_name) {
                return Err(not_found(EntityKind::Node, &pool.node_name));
            }
            let pools = guard.storage_pools_mut()?;
            let key = pool.key();
            EntityKind::StoragePool.verify_identity(
                &format!("{}@{}", key.1, key.0),
                pools.get(&key).map(|p| p.fingerprint),
                pool.fingerprint,
            )?;
            pools.insert(key.clone(), pool);
            self.updates.storage_pool_changed(&guard, &key)?
        };
        Ok(self.finish(fan_out).await)
    }

    /// Refused while an instance on the node still has a volume in the pool
    pub async fn delete_storage_pool(&self, key: &StoragePoolKey) -> Result<DeliveryReport> {
        let fan_out = {
            let mut guard = self.model.lock(
                &LockRequest::new()
                    .read(LockObj::ResourceDefinitions)
                    .write(LockObj::StoragePools),
            );
            let (node, pool) = key;
            let in_use = guard
                .resource_definitions()?
                .resources_on(node)
                .find(|(_, rsc)| rsc.volumes.iter().any(|v| &v.storage_pool == pool))
                .map(|(definition, _)| definition.name.clone());
            if let Some(resource) = in_use {
                return Err(Error::InvalidPayload(format!(
                    "storage pool {} on {} still backs resource {}",
                    pool, node, resource
                )));
            }
            if guard.storage_pools_mut()?.remove(key).is_none() {
                return Err(not_found(EntityKind::StoragePool, format!("{}@{}", pool, node)));
            }
            self.updates.storage_pool_deleted(key)
        };
        Ok(self.finish(fan_out).await)
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    pub async fn upsert_snapshot(&self, snapshot: SnapshotDefinition) -> Result<DeliveryReport> {
        let fan_out = {
            let mut guard = self.model.lock(&resource_locks());
            let definitions = guard.resource_definitions_mut()?;
            let key = snapshot.key();
            let definition = definitions
                .get(&key.0)
                .ok_or_else(|| not_found(EntityKind::ResourceDefinition, &key.0))?;
            if let Some(node) = snapshot.snapshots.keys().find(|n| !definition.has_resource_on(n)) {
                return Err(not_found(
                    EntityKind::ResourceDefinition,
                    format!("{}@{}", key.0, node),
                ));
            }
            EntityKind::Snapshot.verify_identity(
                &format!("{}/{}", key.0, key.1),
                definitions.snapshot(&key).map(|s| s.fingerprint),
                snapshot.fingerprint,
            )?;
            definitions.insert_snapshot(snapshot);
            self.updates.snapshot_changed(&guard, &key)?
        };
        Ok(self.finish(fan_out).await)
    }

    pub async fn end_snapshot(&self, key: &SnapshotKey) -> Result<DeliveryReport> {
        let fan_out = {
            let mut guard = self.model.lock(&LockRequest::new().write(LockObj::ResourceDefinitions));
            let removed = guard
                .resource_definitions_mut()?
                .remove_snapshot(key)
                .ok_or_else(|| not_found(EntityKind::Snapshot, format!("{}/{}", key.0, key.1)))?;
            let nodes: BTreeSet<NodeName> = removed.snapshots.into_keys().collect();
            self.updates.snapshot_ended(key, &nodes)
        };
        Ok(self.finish(fan_out).await)
    }

    // =========================================================================
    // Cluster-Wide
    // =========================================================================

    pub async fn set_cluster_config(&self, props: Props) -> Result<DeliveryReport> {
        let fan_out = {
            let mut guard = self.model.lock(
                &LockRequest::new()
                    .write(LockObj::Reconfiguration)
                    .read(LockObj::Nodes),
            );
            guard.config_mut()?.props = props.clone();
            self.updates.broadcast(&guard, Change::ApplyClusterConfig { props })?
        };
        Ok(self.finish(fan_out).await)
    }

    /// Distribute the secret material for encrypted volumes
    pub async fn set_crypt_key(&self, secret: Vec<u8>) -> Result<DeliveryReport> {
        let fan_out = {
            let mut guard = self.model.lock(
                &LockRequest::new()
                    .write(LockObj::Reconfiguration)
                    .read(LockObj::Nodes),
            );
            guard.config_mut()?.secret = Some(secret.clone());
            self.updates.broadcast(&guard, Change::SetSecret { secret })?
        };
        Ok(self.finish(fan_out).await)
    }

    pub async fn upsert_remote(&self, remote: Remote) -> Result<DeliveryReport> {
        let fan_out = {
            let mut guard = self.model.lock(
                &LockRequest::new()
                    .read(LockObj::Nodes)
                    .write(LockObj::Remotes),
            );
            let remotes = guard.remotes_mut()?;
            EntityKind::Remote.verify_identity(
                remote.name.as_str(),
                remotes.get(&remote.name).map(|r| r.fingerprint),
                remote.fingerprint,
            )?;
            remotes.insert(remote.name.clone(), remote.clone());
            self.updates.broadcast(&guard, Change::ApplyRemote(remote))?
        };
        Ok(self.finish(fan_out).await)
    }

    pub async fn delete_remote(&self, name: &RemoteName) -> Result<DeliveryReport> {
        let fan_out = {
            let mut guard = self.model.lock(
                &LockRequest::new()
                    .read(LockObj::Nodes)
                    .write(LockObj::Remotes),
            );
            if guard.remotes_mut()?.remove(name).is_none() {
                return Err(not_found(EntityKind::Remote, name));
            }
            self.updates
                .broadcast(&guard, Change::DeleteRemote { name: name.clone() })?
        };
        Ok(self.finish(fan_out).await)
    }

    pub async fn upsert_external_file(&self, file: ExternalFile) -> Result<DeliveryReport> {
        let fan_out = {
            let mut guard = self.model.lock(
                &LockRequest::new()
                    .read(LockObj::Nodes)
                    .write(LockObj::ExternalFiles),
            );
            let files = guard.external_files_mut()?;
            EntityKind::ExternalFile.verify_identity(
                &file.path,
                files.get(&file.path).map(|f| f.fingerprint),
                file.fingerprint,
            )?;
            files.insert(file.path.clone(), file.clone());
            self.updates.broadcast(&guard, Change::ApplyExternalFile(file))?
        };
        Ok(self.finish(fan_out).await)
    }

    pub async fn delete_external_file(&self, path: &str) -> Result<DeliveryReport> {
        let fan_out = {
            let mut guard = self.model.lock(
                &LockRequest::new()
                    .read(LockObj::Nodes)
                    .write(LockObj::ExternalFiles),
            );
            if guard.external_files_mut()?.remove(path).is_none() {
                return Err(not_found(EntityKind::ExternalFile, path));
            }
            self.updates.broadcast(
                &guard,
                Change::DeleteExternalFile {
                    path: path.to_string(),
                },
            )?
        };
        Ok(self.finish(fan_out).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerConfig;
    use crate::domain::{NodeType, ResourceGroupRef, Snapshot};
    use crate::protocol::{ControllerMessage, Frame};
    use crate::session::{ConnectionStatus, PeerSession};
    use assert_matches::assert_matches;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    type Outbound = mpsc::UnboundedReceiver<Frame<ControllerMessage>>;

    fn controller() -> Arc<Controller> {
        let config = ControllerConfig {
            call_timeout_secs: 1,
            ..Default::default()
        };
        Controller::new(config).unwrap()
    }

    fn online(controller: &Controller, node: &str) -> (Arc<PeerSession>, Outbound) {
        let (session, rx) = controller.accept_session(None);
        session.transition(ConnectionStatus::Authenticating).unwrap();
        session.mark_authenticated(NodeName::new(node)).unwrap();
        controller.registry.register(session.clone()).unwrap();
        (session, rx)
    }

    fn drain(rx: &mut Outbound) -> Vec<Change> {
        let mut changes = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let ControllerMessage::Update(envelope) = frame.message {
                changes.push(envelope.change);
            }
        }
        changes
    }

    async fn seed(controller: &Controller, nodes: &[&str]) {
        for name in nodes {
            controller
                .upsert_node(ClusterNode::new(*name, NodeType::Satellite))
                .await
                .unwrap();
            controller
                .upsert_storage_pool(StoragePool::new("local", *name, "LVM"))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_fingerprint_mismatch_refused() {
        let controller = controller();
        controller
            .upsert_node(ClusterNode::new("node-a", NodeType::Satellite))
            .await
            .unwrap();

        let impostor = ClusterNode::new("NODE-A", NodeType::Satellite);
        let result = controller.upsert_node(impostor).await;
        assert_matches!(result, Err(Error::FingerprintMismatch { .. }));
    }

    #[tokio::test]
    async fn test_instance_on_unknown_node_refused() {
        let controller = controller();
        seed(&controller, &["node-a"]).await;
        let definition = ResourceDefinition::new("rsc-1", ResourceGroupRef::new("rg"))
            .with_resource(Resource::new("node-x").with_volume(0, "local"));
        let result = controller.upsert_resource_definition(definition).await;
        assert_matches!(result, Err(Error::EntityNotFound { .. }));
    }

    #[tokio::test]
    async fn test_removed_host_gets_delete() {
        let controller = controller();
        seed(&controller, &["node-a", "node-b"]).await;
        let (_a, mut rx_a) = online(&controller, "node-a");
        let (_b, mut rx_b) = online(&controller, "node-b");

        let definition = ResourceDefinition::new("rsc-1", ResourceGroupRef::new("rg"))
            .with_resource(Resource::new("node-a").with_volume(0, "local"))
            .with_resource(Resource::new("node-b").with_volume(0, "local"));
        controller.upsert_resource_definition(definition.clone()).await.unwrap();
        assert_matches!(&drain(&mut rx_a)[..], [Change::ApplyResource(_)]);
        assert_matches!(&drain(&mut rx_b)[..], [Change::ApplyResource(_)]);

        let mut shrunk = definition;
        shrunk.resources.remove(&NodeName::new("node-b"));
        controller.upsert_resource_definition(shrunk).await.unwrap();
        assert_matches!(&drain(&mut rx_a)[..], [Change::ApplyResource(p)] if p.nodes.len() == 1);
        assert_matches!(&drain(&mut rx_b)[..], [Change::DeleteResource { .. }]);
    }

    #[tokio::test]
    async fn test_delete_node_cascades() {
        let controller = controller();
        seed(&controller, &["node-a", "node-b"]).await;
        let definition = ResourceDefinition::new("rsc-1", ResourceGroupRef::new("rg"))
            .with_resource(Resource::new("node-a").with_volume(0, "local"))
            .with_resource(Resource::new("node-b").with_volume(0, "local"));
        controller.upsert_resource_definition(definition).await.unwrap();
        let (_b, mut rx_b) = online(&controller, "node-b");

        controller.delete_node(&NodeName::new("node-a")).await.unwrap();
        assert_matches!(&drain(&mut rx_b)[..], [Change::DeleteNode { name }] if name.as_str() == "node-a");

        let guard = controller.model.lock(&LockRequest::shared());
        let definitions = guard.resource_definitions().unwrap();
        let remaining = definitions.get(&ResourceName::new("rsc-1")).unwrap();
        assert!(!remaining.has_resource_on(&NodeName::new("node-a")));
        assert!(guard
            .storage_pools()
            .unwrap()
            .keys()
            .all(|(node, _)| node.as_str() != "node-a"));
    }

    #[tokio::test]
    async fn test_pool_in_use_cannot_be_deleted() {
        let controller = controller();
        seed(&controller, &["node-a"]).await;
        let definition = ResourceDefinition::new("rsc-1", ResourceGroupRef::new("rg"))
            .with_resource(Resource::new("node-a").with_volume(0, "local"));
        controller.upsert_resource_definition(definition).await.unwrap();

        let key = (NodeName::new("node-a"), "local".into());
        assert_matches!(
            controller.delete_storage_pool(&key).await,
            Err(Error::InvalidPayload(_))
        );
        controller.delete_resource_definition(&ResourceName::new("rsc-1")).await.unwrap();
        controller.delete_storage_pool(&key).await.unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_reaches_its_nodes() {
        let controller = controller();
        seed(&controller, &["node-a", "node-b"]).await;
        let definition = ResourceDefinition::new("rsc-1", ResourceGroupRef::new("rg"))
            .with_resource(Resource::new("node-a").with_volume(0, "local"));
        controller.upsert_resource_definition(definition).await.unwrap();
        let (_a, mut rx_a) = online(&controller, "node-a");

        let snapshot = SnapshotDefinition::new("rsc-1", "snap-1").with_snapshot(Snapshot::new("node-a"));
        let key = snapshot.key();
        controller.upsert_snapshot(snapshot).await.unwrap();
        controller.end_snapshot(&key).await.unwrap();

        let changes = drain(&mut rx_a);
        assert_matches!(&changes[..], [Change::ApplySnapshot(_), Change::EndSnapshot { .. }]);

        let orphan = SnapshotDefinition::new("rsc-1", "snap-2").with_snapshot(Snapshot::new("node-b"));
        assert_matches!(
            controller.upsert_snapshot(orphan).await,
            Err(Error::EntityNotFound { .. })
        );
    }

    #[tokio::test]
    async fn test_cluster_config_broadcast_warns_offline() {
        let controller = controller();
        seed(&controller, &["node-a", "node-b"]).await;
        let (_a, mut rx_a) = online(&controller, "node-a");

        let mut props = Props::new();
        props.insert("DrbdOptions/auto-quorum".into(), "io-error".into());
        let report = controller.set_cluster_config(props).await.unwrap();

        assert_matches!(&drain(&mut rx_a)[..], [Change::ApplyClusterConfig { .. }]);
        let warned: Vec<_> = report.warnings().map(|e| e.node.as_str().to_string()).collect();
        assert_eq!(warned, vec!["node-b".to_string()]);
    }

    #[tokio::test]
    async fn test_updates_numbered_in_commit_order() {
        let controller = controller();
        seed(&controller, &["node-a"]).await;
        let (_a, mut rx_a) = online(&controller, "node-a");

        controller.upsert_remote(Remote::new("s3-eu", "https://s3.example")).await.unwrap();
        controller
            .upsert_external_file(ExternalFile::new("/etc/lvm/lvm.conf", b"devices {}".to_vec()))
            .await
            .unwrap();
        controller.delete_remote(&RemoteName::new("s3-eu")).await.unwrap();

        let mut sequences = Vec::new();
        while let Ok(frame) = rx_a.try_recv() {
            if let ControllerMessage::Update(envelope) = frame.message {
                sequences.push(envelope.sequence);
            }
        }
        assert_eq!(sequences, vec![1, 2, 3]);
    }
}
