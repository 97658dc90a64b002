//! Incremental Changes
//!
//! One type per [`Change`] variant. Each declares the locks it needs and
//! applies itself to the local model, recording what downstream
//! reconciliation has to look at in [`ApplyEffects`].

use crate::domain::{
    ClusterNode, EntityKind, ExternalFile, NodeName, Props, Remote, RemoteName,
    ResourceDefinition, ResourceName, SnapshotDefinition, SnapshotName, StorPoolName,
    StoragePool,
};
use crate::error::Result;
use crate::model::{LockObj, LockRequest, ModelGuard};
use crate::protocol::{Change, ResourcePayload, UpdateEnvelope};
use std::collections::BTreeSet;
use tracing::{debug, trace};

/// Epoch and sequence an update was sent with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub epoch: u64,
    pub sequence: u64,
}

/// What applied changes touched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyEffects {
    pub nodes: BTreeSet<NodeName>,
    pub resources: BTreeSet<ResourceName>,
    pub storage_pools: BTreeSet<StorPoolName>,
    /// Resources with an instance on the local node, to be acknowledged
    pub acknowledge: BTreeSet<ResourceName>,
    /// Cluster configuration or secret changed
    pub reconfigured: bool,
}

impl ApplyEffects {
    pub fn merge(&mut self, other: ApplyEffects) {
        self.nodes.extend(other.nodes);
        self.resources.extend(other.resources);
        self.storage_pools.extend(other.storage_pools);
        self.acknowledge.extend(other.acknowledge);
        self.reconfigured |= other.reconfigured;
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
            && self.resources.is_empty()
            && self.storage_pools.is_empty()
            && self.acknowledge.is_empty()
            && !self.reconfigured
    }
}

pub trait ApplyChange: Send + std::fmt::Debug {
    fn header(&self) -> Header;

    fn epoch(&self) -> u64 {
        self.header().epoch
    }

    fn sequence(&self) -> u64 {
        self.header().sequence
    }

    fn kind(&self) -> EntityKind;

    /// Changes to cluster-wide configuration run with every lock held for write
    fn needs_coarse_lock(&self) -> bool {
        false
    }

    /// Collection locks the change needs besides the reconfiguration lock
    fn lock_scope(&self) -> LockRequest;

    fn apply(
        self: Box<Self>,
        guard: &mut ModelGuard<'_>,
        local: &NodeName,
        effects: &mut ApplyEffects,
    ) -> Result<()>;
}

/// Locks taken to apply `change`
pub fn lock_request(change: &dyn ApplyChange) -> LockRequest {
    if change.needs_coarse_lock() {
        LockRequest::exclusive()
    } else {
        LockRequest::new()
            .read(LockObj::Reconfiguration)
            .merge(&change.lock_scope())
    }
}

pub fn from_envelope(envelope: UpdateEnvelope) -> Box<dyn ApplyChange> {
    let header = Header {
        epoch: envelope.epoch,
        sequence: envelope.sequence,
    };
    match envelope.change {
        Change::ApplyNode(node) => Box::new(NodeChange { header, node }),
        Change::DeleteNode { name } => Box::new(NodeDelete { header, name }),
        Change::ApplyResource(payload) => Box::new(ResourceChange { header, payload }),
        Change::DeleteResource { name } => Box::new(ResourceDelete { header, name }),
        Change::ApplyStoragePool(pool) => Box::new(StoragePoolChange { header, pool }),
        Change::DeleteStoragePool { name } => Box::new(StoragePoolDelete { header, name }),
        Change::ApplySnapshot(snapshot) => Box::new(SnapshotChange { header, snapshot }),
        Change::EndSnapshot { resource, snapshot } => Box::new(SnapshotEnd {
            header,
            resource,
            snapshot,
        }),
        Change::ApplyClusterConfig { props } => Box::new(ClusterConfigChange { header, props }),
        Change::SetSecret { secret } => Box::new(SecretChange { header, secret }),
        Change::ApplyRemote(remote) => Box::new(RemoteChange { header, remote }),
        Change::DeleteRemote { name } => Box::new(RemoteDelete { header, name }),
        Change::ApplyExternalFile(file) => Box::new(ExternalFileChange { header, file }),
        Change::DeleteExternalFile { path } => Box::new(ExternalFileDelete { header, path }),
    }
}

// =============================================================================
// Nodes
// =============================================================================

#[derive(Debug)]
pub struct NodeChange {
    header: Header,
    node: ClusterNode,
}

impl ApplyChange for NodeChange {
    fn header(&self) -> Header {
        self.header
    }

    fn kind(&self) -> EntityKind {
        EntityKind::Node
    }

    fn lock_scope(&self) -> LockRequest {
        LockRequest::new().write(LockObj::Nodes)
    }

    fn apply(
        self: Box<Self>,
        guard: &mut ModelGuard<'_>,
        _local: &NodeName,
        effects: &mut ApplyEffects,
    ) -> Result<()> {
        let nodes = guard.nodes_mut()?;
        EntityKind::Node.verify_identity(
            self.node.name.as_str(),
            nodes.get(&self.node.name).map(|n| n.fingerprint),
            self.node.fingerprint,
        )?;
        effects.nodes.insert(self.node.name.clone());
        nodes.insert(self.node.name.clone(), self.node);
        Ok(())
    }
}

/// Removes the node with its resource instances and storage pools
#[derive(Debug)]
pub struct NodeDelete {
    header: Header,
    name: NodeName,
}

impl ApplyChange for NodeDelete {
    fn header(&self) -> Header {
        self.header
    }

    fn kind(&self) -> EntityKind {
        EntityKind::Node
    }

    fn lock_scope(&self) -> LockRequest {
        LockRequest::new()
            .write(LockObj::Nodes)
            .write(LockObj::ResourceDefinitions)
            .write(LockObj::StoragePools)
    }

    fn apply(
        self: Box<Self>,
        guard: &mut ModelGuard<'_>,
        _local: &NodeName,
        effects: &mut ApplyEffects,
    ) -> Result<()> {
        if guard.nodes_mut()?.remove(&self.name).is_none() {
            debug!("Node {} already unknown", self.name);
        }
        let affected = guard
            .resource_definitions_mut()?
            .remove_instances_on(&self.name);
        effects.resources.extend(affected);

        let pools = guard.storage_pools_mut()?;
        let removed: Vec<StorPoolName> = pools
            .keys()
            .filter(|(node, _)| *node == self.name)
            .map(|(_, pool)| pool.clone())
            .collect();
        pools.retain(|(node, _), _| *node != self.name);
        effects.storage_pools.extend(removed);
        effects.nodes.insert(self.name);
        Ok(())
    }
}

// =============================================================================
// Resources
// =============================================================================

/// A definition with the nodes of its instances
#[derive(Debug)]
pub struct ResourceChange {
    header: Header,
    payload: ResourcePayload,
}

impl ApplyChange for ResourceChange {
    fn header(&self) -> Header {
        self.header
    }

    fn kind(&self) -> EntityKind {
        EntityKind::ResourceDefinition
    }

    fn lock_scope(&self) -> LockRequest {
        LockRequest::new()
            .write(LockObj::Nodes)
            .write(LockObj::ResourceDefinitions)
    }

    fn apply(
        self: Box<Self>,
        guard: &mut ModelGuard<'_>,
        local: &NodeName,
        effects: &mut ApplyEffects,
    ) -> Result<()> {
        let ResourcePayload { definition, nodes } = self.payload;

        // every identity is checked before anything is written
        {
            let known = guard.nodes()?;
            for node in &nodes {
                EntityKind::Node.verify_identity(
                    node.name.as_str(),
                    known.get(&node.name).map(|n| n.fingerprint),
                    node.fingerprint,
                )?;
            }
            let existing = guard.resource_definitions()?.get(&definition.name);
            verify_definition(existing, &definition)?;
        }

        let known = guard.nodes_mut()?;
        for node in nodes {
            known.insert(node.name.clone(), node);
        }

        let name = definition.name.clone();
        if definition.has_resource_on(local) {
            effects.acknowledge.insert(name.clone());
        }
        trace!(
            "Resource {} with {} instances",
            name,
            definition.resources.len()
        );
        guard.resource_definitions_mut()?.insert(definition);
        effects.resources.insert(name);
        Ok(())
    }
}

fn verify_definition(
    existing: Option<&ResourceDefinition>,
    received: &ResourceDefinition,
) -> Result<()> {
    EntityKind::ResourceDefinition.verify_identity(
        received.name.as_str(),
        existing.map(|d| d.fingerprint),
        received.fingerprint,
    )?;
    if let Some(existing) = existing {
        for (node, resource) in &received.resources {
            EntityKind::ResourceDefinition.verify_identity(
                &format!("{}@{}", received.name, node),
                existing.resource_on(node).map(|r| r.fingerprint),
                resource.fingerprint,
            )?;
        }
    }
    Ok(())
}

/// Removes the definition with its instances, snapshots and, with the last
/// definition of its group, the group
#[derive(Debug)]
pub struct ResourceDelete {
    header: Header,
    name: ResourceName,
}

impl ApplyChange for ResourceDelete {
    fn header(&self) -> Header {
        self.header
    }

    fn kind(&self) -> EntityKind {
        EntityKind::ResourceDefinition
    }

    fn lock_scope(&self) -> LockRequest {
        LockRequest::new().write(LockObj::ResourceDefinitions)
    }

    fn apply(
        self: Box<Self>,
        guard: &mut ModelGuard<'_>,
        _local: &NodeName,
        effects: &mut ApplyEffects,
    ) -> Result<()> {
        if guard.resource_definitions_mut()?.remove(&self.name).is_none() {
            debug!("Resource {} already unknown", self.name);
        }
        effects.resources.insert(self.name);
        Ok(())
    }
}

// =============================================================================
// Storage Pools
// =============================================================================

#[derive(Debug)]
pub struct StoragePoolChange {
    header: Header,
    pool: StoragePool,
}

impl ApplyChange for StoragePoolChange {
    fn header(&self) -> Header {
        self.header
    }

    fn kind(&self) -> EntityKind {
        EntityKind::StoragePool
    }

    fn lock_scope(&self) -> LockRequest {
        LockRequest::new().write(LockObj::StoragePools)
    }

    fn apply(
        self: Box<Self>,
        guard: &mut ModelGuard<'_>,
        _local: &NodeName,
        effects: &mut ApplyEffects,
    ) -> Result<()> {
        let key = self.pool.key();
        let pools = guard.storage_pools_mut()?;
        EntityKind::StoragePool.verify_identity(
            &format!("{}@{}", key.1, key.0),
            pools.get(&key).map(|p| p.fingerprint),
            self.pool.fingerprint,
        )?;
        effects.storage_pools.insert(key.1.clone());
        pools.insert(key, self.pool);
        Ok(())
    }
}

/// Removes a pool of the local node
#[derive(Debug)]
pub struct StoragePoolDelete {
    header: Header,
    name: StorPoolName,
}

impl ApplyChange for StoragePoolDelete {
    fn header(&self) -> Header {
        self.header
    }

    fn kind(&self) -> EntityKind {
        EntityKind::StoragePool
    }

    fn lock_scope(&self) -> LockRequest {
        LockRequest::new().write(LockObj::StoragePools)
    }

    fn apply(
        self: Box<Self>,
        guard: &mut ModelGuard<'_>,
        local: &NodeName,
        effects: &mut ApplyEffects,
    ) -> Result<()> {
        let key = (local.clone(), self.name);
        if guard.storage_pools_mut()?.remove(&key).is_none() {
            debug!("Storage pool {} already unknown", key.1);
        }
        effects.storage_pools.insert(key.1);
        Ok(())
    }
}

// =============================================================================
// Snapshots
// =============================================================================

#[derive(Debug)]
pub struct SnapshotChange {
    header: Header,
    snapshot: SnapshotDefinition,
}

impl ApplyChange for SnapshotChange {
    fn header(&self) -> Header {
        self.header
    }

    fn kind(&self) -> EntityKind {
        EntityKind::Snapshot
    }

    fn lock_scope(&self) -> LockRequest {
        LockRequest::new().write(LockObj::ResourceDefinitions)
    }

    fn apply(
        self: Box<Self>,
        guard: &mut ModelGuard<'_>,
        _local: &NodeName,
        effects: &mut ApplyEffects,
    ) -> Result<()> {
        let key = self.snapshot.key();
        let definitions = guard.resource_definitions_mut()?;
        EntityKind::Snapshot.verify_identity(
            &format!("{}/{}", key.0, key.1),
            definitions.snapshot(&key).map(|s| s.fingerprint),
            self.snapshot.fingerprint,
        )?;
        definitions.insert_snapshot(self.snapshot);
        effects.resources.insert(key.0);
        Ok(())
    }
}

#[derive(Debug)]
pub struct SnapshotEnd {
    header: Header,
    resource: ResourceName,
    snapshot: SnapshotName,
}

impl ApplyChange for SnapshotEnd {
    fn header(&self) -> Header {
        self.header
    }

    fn kind(&self) -> EntityKind {
        EntityKind::Snapshot
    }

    fn lock_scope(&self) -> LockRequest {
        LockRequest::new().write(LockObj::ResourceDefinitions)
    }

    fn apply(
        self: Box<Self>,
        guard: &mut ModelGuard<'_>,
        _local: &NodeName,
        effects: &mut ApplyEffects,
    ) -> Result<()> {
        let key = (self.resource, self.snapshot);
        if guard.resource_definitions_mut()?.remove_snapshot(&key).is_none() {
            debug!("Snapshot {}/{} already unknown", key.0, key.1);
        }
        effects.resources.insert(key.0);
        Ok(())
    }
}

// =============================================================================
// Cluster Configuration
// =============================================================================

#[derive(Debug)]
pub struct ClusterConfigChange {
    header: Header,
    props: Props,
}

impl ApplyChange for ClusterConfigChange {
    fn header(&self) -> Header {
        self.header
    }

    fn kind(&self) -> EntityKind {
        EntityKind::ClusterConfig
    }

    fn needs_coarse_lock(&self) -> bool {
        true
    }

    fn lock_scope(&self) -> LockRequest {
        LockRequest::new().write(LockObj::Reconfiguration)
    }

    fn apply(
        self: Box<Self>,
        guard: &mut ModelGuard<'_>,
        _local: &NodeName,
        effects: &mut ApplyEffects,
    ) -> Result<()> {
        guard.config_mut()?.props = self.props;
        effects.reconfigured = true;
        Ok(())
    }
}

/// Secret material for encrypted volumes
pub struct SecretChange {
    header: Header,
    secret: Vec<u8>,
}

impl std::fmt::Debug for SecretChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretChange")
            .field("header", &self.header)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl ApplyChange for SecretChange {
    fn header(&self) -> Header {
        self.header
    }

    fn kind(&self) -> EntityKind {
        EntityKind::ClusterConfig
    }

    fn needs_coarse_lock(&self) -> bool {
        true
    }

    fn lock_scope(&self) -> LockRequest {
        LockRequest::new().write(LockObj::Reconfiguration)
    }

    fn apply(
        self: Box<Self>,
        guard: &mut ModelGuard<'_>,
        _local: &NodeName,
        effects: &mut ApplyEffects,
    ) -> Result<()> {
        guard.config_mut()?.secret = Some(self.secret);
        effects.reconfigured = true;
        Ok(())
    }
}

// =============================================================================
// Remotes and External Files
// =============================================================================

#[derive(Debug)]
pub struct RemoteChange {
    header: Header,
    remote: Remote,
}

impl ApplyChange for RemoteChange {
    fn header(&self) -> Header {
        self.header
    }

    fn kind(&self) -> EntityKind {
        EntityKind::Remote
    }

    fn lock_scope(&self) -> LockRequest {
        LockRequest::new().write(LockObj::Remotes)
    }

    fn apply(
        self: Box<Self>,
        guard: &mut ModelGuard<'_>,
        _local: &NodeName,
        _effects: &mut ApplyEffects,
    ) -> Result<()> {
        let remotes = guard.remotes_mut()?;
        EntityKind::Remote.verify_identity(
            self.remote.name.as_str(),
            remotes.get(&self.remote.name).map(|r| r.fingerprint),
            self.remote.fingerprint,
        )?;
        remotes.insert(self.remote.name.clone(), self.remote);
        Ok(())
    }
}

#[derive(Debug)]
pub struct RemoteDelete {
    header: Header,
    name: RemoteName,
}

impl ApplyChange for RemoteDelete {
    fn header(&self) -> Header {
        self.header
    }

    fn kind(&self) -> EntityKind {
        EntityKind::Remote
    }

    fn lock_scope(&self) -> LockRequest {
        LockRequest::new().write(LockObj::Remotes)
    }

    fn apply(
        self: Box<Self>,
        guard: &mut ModelGuard<'_>,
        _local: &NodeName,
        _effects: &mut ApplyEffects,
    ) -> Result<()> {
        guard.remotes_mut()?.remove(&self.name);
        Ok(())
    }
}

#[derive(Debug)]
pub struct ExternalFileChange {
    header: Header,
    file: ExternalFile,
}

impl ApplyChange for ExternalFileChange {
    fn header(&self) -> Header {
        self.header
    }

    fn kind(&self) -> EntityKind {
        EntityKind::ExternalFile
    }

    fn lock_scope(&self) -> LockRequest {
        LockRequest::new().write(LockObj::ExternalFiles)
    }

    fn apply(
        self: Box<Self>,
        guard: &mut ModelGuard<'_>,
        _local: &NodeName,
        _effects: &mut ApplyEffects,
    ) -> Result<()> {
        let files = guard.external_files_mut()?;
        EntityKind::ExternalFile.verify_identity(
            &self.file.path,
            files.get(&self.file.path).map(|f| f.fingerprint),
            self.file.fingerprint,
        )?;
        files.insert(self.file.path.clone(), self.file);
        Ok(())
    }
}

#[derive(Debug)]
pub struct ExternalFileDelete {
    header: Header,
    path: String,
}

impl ApplyChange for ExternalFileDelete {
    fn header(&self) -> Header {
        self.header
    }

    fn kind(&self) -> EntityKind {
        EntityKind::ExternalFile
    }

    fn lock_scope(&self) -> LockRequest {
        LockRequest::new().write(LockObj::ExternalFiles)
    }

    fn apply(
        self: Box<Self>,
        guard: &mut ModelGuard<'_>,
        _local: &NodeName,
        _effects: &mut ApplyEffects,
    ) -> Result<()> {
        guard.external_files_mut()?.remove(&self.path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NodeType, Resource, ResourceGroupRef};
    use crate::error::Error;
    use crate::model::{CoreModel, LockMode};
    use assert_matches::assert_matches;

    fn envelope(sequence: u64, change: Change) -> Box<dyn ApplyChange> {
        from_envelope(UpdateEnvelope {
            epoch: 1,
            sequence,
            change,
        })
    }

    fn apply_one(model: &CoreModel, change: Box<dyn ApplyChange>) -> Result<ApplyEffects> {
        let local = NodeName::new("node-a");
        let mut effects = ApplyEffects::default();
        let mut guard = model.lock(&lock_request(change.as_ref()));
        change.apply(&mut guard, &local, &mut effects)?;
        Ok(effects)
    }

    /// Ships nodes the model already knows with their known identity
    fn resource_change(
        model: &CoreModel,
        sequence: u64,
        definition: ResourceDefinition,
    ) -> Box<dyn ApplyChange> {
        let guard = model.lock(&LockRequest::new().read(LockObj::Nodes));
        let known = guard.nodes().unwrap();
        let nodes = definition
            .node_names()
            .map(|n| {
                known
                    .get(n)
                    .cloned()
                    .unwrap_or_else(|| ClusterNode::new(n.clone(), NodeType::Satellite))
            })
            .collect();
        envelope(sequence, Change::ApplyResource(ResourcePayload { definition, nodes }))
    }

    #[test]
    fn test_lock_scopes() {
        let config = envelope(1, Change::ApplyClusterConfig { props: Props::new() });
        assert!(config.needs_coarse_lock());
        assert_eq!(lock_request(config.as_ref()), LockRequest::exclusive());

        let pool = envelope(
            2,
            Change::DeleteStoragePool {
                name: StorPoolName::new("pool-1"),
            },
        );
        let request = lock_request(pool.as_ref());
        assert_eq!(request.mode(LockObj::Reconfiguration), Some(LockMode::Read));
        assert_eq!(request.mode(LockObj::StoragePools), Some(LockMode::Write));
        assert_eq!(request.mode(LockObj::Nodes), None);
    }

    #[test]
    fn test_resource_with_local_instance_is_acknowledged() {
        let model = CoreModel::new();
        let definition = ResourceDefinition::new("rsc-1", ResourceGroupRef::new("rg"))
            .with_resource(Resource::new("node-a"))
            .with_resource(Resource::new("node-b"));
        let effects = apply_one(&model, resource_change(&model, 1, definition)).unwrap();

        assert!(effects.acknowledge.contains(&ResourceName::new("rsc-1")));
        let guard = model.lock(&LockRequest::shared());
        assert_eq!(guard.nodes().unwrap().len(), 2);
        assert!(guard
            .resource_definitions()
            .unwrap()
            .contains(&ResourceName::new("rsc-1")));
    }

    #[test]
    fn test_divergent_resource_is_refused() {
        let model = CoreModel::new();
        let group = ResourceGroupRef::new("rg");
        let first = ResourceDefinition::new("rsc-1", group.clone()).with_resource(Resource::new("node-a"));
        apply_one(&model, resource_change(&model, 1, first)).unwrap();

        // same name, different entity
        let second = ResourceDefinition::new("rsc-1", group).with_resource(Resource::new("node-a"));
        assert_matches!(
            apply_one(&model, resource_change(&model, 2, second)),
            Err(Error::FingerprintMismatch { ref name, .. }) if name == "rsc-1"
        );
    }

    #[test]
    fn test_node_delete_cascades() {
        let model = CoreModel::new();
        let definition = ResourceDefinition::new("rsc-1", ResourceGroupRef::new("rg"))
            .with_resource(Resource::new("node-a"))
            .with_resource(Resource::new("node-b"));
        apply_one(&model, resource_change(&model, 1, definition)).unwrap();
        apply_one(
            &model,
            envelope(2, Change::ApplyStoragePool(StoragePool::new("pool-1", "node-b", "LVM"))),
        )
        .unwrap();
        apply_one(
            &model,
            envelope(3, Change::ApplyStoragePool(StoragePool::new("pool-1", "node-a", "LVM"))),
        )
        .unwrap();

        let effects = apply_one(
            &model,
            envelope(
                4,
                Change::DeleteNode {
                    name: NodeName::new("node-b"),
                },
            ),
        )
        .unwrap();
        assert!(effects.resources.contains(&ResourceName::new("rsc-1")));

        let guard = model.lock(&LockRequest::shared());
        assert!(!guard.nodes().unwrap().contains_key(&NodeName::new("node-b")));
        let definition = guard
            .resource_definitions()
            .unwrap()
            .get(&ResourceName::new("rsc-1"))
            .unwrap();
        assert_eq!(definition.resources.len(), 1);
        let pools = guard.storage_pools().unwrap();
        assert_eq!(pools.len(), 1);
        assert!(pools.contains_key(&(NodeName::new("node-a"), StorPoolName::new("pool-1"))));
    }

    #[test]
    fn test_delete_of_last_definition_drops_group() {
        let model = CoreModel::new();
        let group = ResourceGroupRef::new("rg");
        for name in ["rsc-1", "rsc-2"] {
            let definition = ResourceDefinition::new(name, group.clone()).with_resource(Resource::new("node-a"));
            apply_one(&model, resource_change(&model, 1, definition)).unwrap();
        }

        for (seq, name) in [(3, "rsc-1"), (4, "rsc-2")] {
            apply_one(
                &model,
                envelope(
                    seq,
                    Change::DeleteResource {
                        name: ResourceName::new(name),
                    },
                ),
            )
            .unwrap();
            let guard = model.lock(&LockRequest::shared());
            let remaining = guard.resource_definitions().unwrap().group(&group.name).is_some();
            assert_eq!(remaining, name == "rsc-1");
        }
    }

    #[test]
    fn test_secret_is_redacted_in_debug() {
        let change = envelope(
            1,
            Change::SetSecret {
                secret: b"hunter2".to_vec(),
            },
        );
        assert!(!format!("{:?}", change).contains("hunter2"));

        let model = CoreModel::new();
        let effects = apply_one(&model, change).unwrap();
        assert!(effects.reconfigured);
        let guard = model.lock(&LockRequest::shared());
        assert_eq!(guard.config().unwrap().secret.as_deref(), Some(&b"hunter2"[..]));
    }
}
