//! Core Model
//!
//! The collections shared by controller and satellite. The controller holds
//! the authoritative copy; a satellite holds the projection it was sent.
//! Access goes through [`ModelGuard`], whose accessors fail with
//! [`Error::LockNotHeld`] when the operation did not request the lock.

pub mod locks;

pub use locks::{LockMode, LockObj, LockRequest};

use crate::domain::{
    ClusterConfig, ClusterNode, ExternalFile, NodeName, Remote, RemoteName, Resource,
    ResourceDefinition, ResourceGroupName, ResourceGroupRef, ResourceName, SnapshotDefinition,
    SnapshotKey, StoragePool, StoragePoolKey,
};
use crate::error::Result;
use locks::{read_access, write_access, Held};
use parking_lot::RwLock;
use std::collections::BTreeMap;

// =============================================================================
// Collections
// =============================================================================

pub type NodeMap = BTreeMap<NodeName, ClusterNode>;
pub type StoragePoolMap = BTreeMap<StoragePoolKey, StoragePool>;
pub type RemoteMap = BTreeMap<RemoteName, Remote>;
pub type ExternalFileMap = BTreeMap<String, ExternalFile>;

/// Resource definitions with the snapshots and groups that hang off them
#[derive(Debug, Clone, Default)]
pub struct ResourceDefinitions {
    definitions: BTreeMap<ResourceName, ResourceDefinition>,
    snapshots: BTreeMap<SnapshotKey, SnapshotDefinition>,
    groups: BTreeMap<ResourceGroupName, ResourceGroupRef>,
}

impl ResourceDefinitions {
    pub fn get(&self, name: &ResourceName) -> Option<&ResourceDefinition> {
        self.definitions.get(name)
    }

    pub fn get_mut(&mut self, name: &ResourceName) -> Option<&mut ResourceDefinition> {
        self.definitions.get_mut(name)
    }

    pub fn contains(&self, name: &ResourceName) -> bool {
        self.definitions.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn definitions(&self) -> impl Iterator<Item = &ResourceDefinition> {
        self.definitions.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &ResourceName> {
        self.definitions.keys()
    }

    /// Insert or replace a definition, registering its group
    pub fn insert(&mut self, definition: ResourceDefinition) -> Option<ResourceDefinition> {
        self.groups
            .entry(definition.group.name.clone())
            .or_insert_with(|| definition.group.clone());
        self.definitions.insert(definition.name.clone(), definition)
    }

    /// Remove a definition with its instances and snapshots.
    /// The group goes away with its last definition.
    pub fn remove(&mut self, name: &ResourceName) -> Option<ResourceDefinition> {
        let removed = self.definitions.remove(name)?;
        self.snapshots.retain(|(rsc, _), _| rsc != name);

        let group = &removed.group.name;
        if !self.definitions.values().any(|d| &d.group.name == group) {
            self.groups.remove(group);
        }
        Some(removed)
    }

    /// Remove every instance placed on `node`, returning the affected definitions
    pub fn remove_instances_on(&mut self, node: &NodeName) -> Vec<ResourceName> {
        let mut affected = Vec::new();
        for definition in self.definitions.values_mut() {
            if definition.resources.remove(node).is_some() {
                affected.push(definition.name.clone());
            }
        }
        for snapshot in self.snapshots.values_mut() {
            snapshot.snapshots.remove(node);
        }
        affected
    }

    /// Instances on `node`, paired with their definition
    pub fn resources_on<'a>(
        &'a self,
        node: &'a NodeName,
    ) -> impl Iterator<Item = (&'a ResourceDefinition, &'a Resource)> + 'a {
        self.definitions
            .values()
            .filter_map(move |d| d.resource_on(node).map(|r| (d, r)))
    }

    pub fn group(&self, name: &ResourceGroupName) -> Option<&ResourceGroupRef> {
        self.groups.get(name)
    }

    pub fn groups(&self) -> impl Iterator<Item = &ResourceGroupRef> {
        self.groups.values()
    }

    pub fn snapshot(&self, key: &SnapshotKey) -> Option<&SnapshotDefinition> {
        self.snapshots.get(key)
    }

    pub fn snapshots(&self) -> impl Iterator<Item = &SnapshotDefinition> {
        self.snapshots.values()
    }

    pub fn insert_snapshot(&mut self, snapshot: SnapshotDefinition) -> Option<SnapshotDefinition> {
        self.snapshots.insert(snapshot.key(), snapshot)
    }

    pub fn remove_snapshot(&mut self, key: &SnapshotKey) -> Option<SnapshotDefinition> {
        self.snapshots.remove(key)
    }

    pub fn clear(&mut self) {
        self.definitions.clear();
        self.snapshots.clear();
        self.groups.clear();
    }
}

// =============================================================================
// Core Model
// =============================================================================

/// All top-level collections, each behind its own lock
#[derive(Debug, Default)]
pub struct CoreModel {
    config: RwLock<ClusterConfig>,
    nodes: RwLock<NodeMap>,
    resource_definitions: RwLock<ResourceDefinitions>,
    storage_pools: RwLock<StoragePoolMap>,
    remotes: RwLock<RemoteMap>,
    external_files: RwLock<ExternalFileMap>,
}

impl CoreModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the requested locks in hierarchy order.
    ///
    /// An operation takes one guard for everything it touches; taking a
    /// second guard while holding the first breaks the ordering.
    pub fn lock(&self, request: &LockRequest) -> ModelGuard<'_> {
        let mut guard = ModelGuard::default();
        for (obj, mode) in request.iter() {
            match obj {
                LockObj::Reconfiguration => {
                    guard.config = Some(Held::acquire(&self.config, mode));
                }
                LockObj::Nodes => {
                    guard.nodes = Some(Held::acquire(&self.nodes, mode));
                }
                LockObj::ResourceDefinitions => {
                    guard.resource_definitions =
                        Some(Held::acquire(&self.resource_definitions, mode));
                }
                LockObj::StoragePools => {
                    guard.storage_pools = Some(Held::acquire(&self.storage_pools, mode));
                }
                LockObj::Remotes => {
                    guard.remotes = Some(Held::acquire(&self.remotes, mode));
                }
                LockObj::ExternalFiles => {
                    guard.external_files = Some(Held::acquire(&self.external_files, mode));
                }
            }
        }
        guard
    }
}

/// Locks held by one operation
#[derive(Default)]
pub struct ModelGuard<'a> {
    config: Option<Held<'a, ClusterConfig>>,
    nodes: Option<Held<'a, NodeMap>>,
    resource_definitions: Option<Held<'a, ResourceDefinitions>>,
    storage_pools: Option<Held<'a, StoragePoolMap>>,
    remotes: Option<Held<'a, RemoteMap>>,
    external_files: Option<Held<'a, ExternalFileMap>>,
}

impl<'a> ModelGuard<'a> {
    pub fn config(&self) -> Result<&ClusterConfig> {
        read_access(&self.config, LockObj::Reconfiguration)
    }

    pub fn config_mut(&mut self) -> Result<&mut ClusterConfig> {
        write_access(&mut self.config, LockObj::Reconfiguration)
    }

    pub fn nodes(&self) -> Result<&NodeMap> {
        read_access(&self.nodes, LockObj::Nodes)
    }

    pub fn nodes_mut(&mut self) -> Result<&mut NodeMap> {
        write_access(&mut self.nodes, LockObj::Nodes)
    }

    pub fn resource_definitions(&self) -> Result<&ResourceDefinitions> {
        read_access(&self.resource_definitions, LockObj::ResourceDefinitions)
    }

    pub fn resource_definitions_mut(&mut self) -> Result<&mut ResourceDefinitions> {
        write_access(&mut self.resource_definitions, LockObj::ResourceDefinitions)
    }

    pub fn storage_pools(&self) -> Result<&StoragePoolMap> {
        read_access(&self.storage_pools, LockObj::StoragePools)
    }

    pub fn storage_pools_mut(&mut self) -> Result<&mut StoragePoolMap> {
        write_access(&mut self.storage_pools, LockObj::StoragePools)
    }

    pub fn remotes(&self) -> Result<&RemoteMap> {
        read_access(&self.remotes, LockObj::Remotes)
    }

    pub fn remotes_mut(&mut self) -> Result<&mut RemoteMap> {
        write_access(&mut self.remotes, LockObj::Remotes)
    }

    pub fn external_files(&self) -> Result<&ExternalFileMap> {
        read_access(&self.external_files, LockObj::ExternalFiles)
    }

    pub fn external_files_mut(&mut self) -> Result<&mut ExternalFileMap> {
        write_access(&mut self.external_files, LockObj::ExternalFiles)
    }

    /// Clear every collection; all locks must be held for write
    pub fn clear_all(&mut self) -> Result<()> {
        *self.config_mut()? = ClusterConfig::default();
        self.nodes_mut()?.clear();
        self.resource_definitions_mut()?.clear();
        self.storage_pools_mut()?.clear();
        self.remotes_mut()?.clear();
        self.external_files_mut()?.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NodeType, ResourceGroupRef};
    use crate::error::Error;
    use assert_matches::assert_matches;

    fn definition(name: &str, group: &ResourceGroupRef, nodes: &[&str]) -> ResourceDefinition {
        nodes.iter().fold(
            ResourceDefinition::new(name, group.clone()),
            |dfn, node| dfn.with_resource(Resource::new(*node)),
        )
    }

    #[test]
    fn test_accessor_requires_lock() {
        let model = CoreModel::new();
        let guard = model.lock(&LockRequest::new().read(LockObj::Nodes));

        assert!(guard.nodes().is_ok());
        assert_matches!(
            guard.storage_pools(),
            Err(Error::LockNotHeld {
                lock: LockObj::StoragePools,
                mode: LockMode::Read
            })
        );
    }

    #[test]
    fn test_mutable_accessor_requires_write_lock() {
        let model = CoreModel::new();
        let mut guard = model.lock(&LockRequest::new().read(LockObj::Nodes));

        assert_matches!(
            guard.nodes_mut(),
            Err(Error::LockNotHeld {
                lock: LockObj::Nodes,
                mode: LockMode::Write
            })
        );
    }

    #[test]
    fn test_write_then_read_back() {
        let model = CoreModel::new();
        {
            let mut guard = model.lock(&LockRequest::new().write(LockObj::Nodes));
            let node = ClusterNode::new("node-a", NodeType::Satellite);
            guard.nodes_mut().unwrap().insert(node.name.clone(), node);
        }
        let guard = model.lock(&LockRequest::new().read(LockObj::Nodes));
        assert!(guard.nodes().unwrap().contains_key(&NodeName::new("NODE-A")));
    }

    #[test]
    fn test_concurrent_readers() {
        let model = CoreModel::new();
        let first = model.lock(&LockRequest::shared());
        let second = model.lock(&LockRequest::shared());
        assert!(first.nodes().is_ok());
        assert!(second.nodes().is_ok());
    }

    #[test]
    fn test_remove_definition_cascades_to_group() {
        let mut dfns = ResourceDefinitions::default();
        let group = ResourceGroupRef::new("rg-1");
        dfns.insert(definition("rsc-1", &group, &["node-a", "node-b"]));
        dfns.insert(definition("rsc-2", &group, &["node-a"]));
        dfns.insert_snapshot(SnapshotDefinition::new("rsc-1", "snap-1"));

        dfns.remove(&ResourceName::new("rsc-1"));
        assert!(dfns.group(&group.name).is_some());
        assert_eq!(dfns.snapshots().count(), 0);

        dfns.remove(&ResourceName::new("rsc-2"));
        assert!(dfns.group(&group.name).is_none());
        assert!(dfns.is_empty());
    }

    #[test]
    fn test_remove_instances_on_node() {
        let mut dfns = ResourceDefinitions::default();
        let group = ResourceGroupRef::new("rg-1");
        dfns.insert(definition("rsc-1", &group, &["node-a", "node-b"]));
        dfns.insert(definition("rsc-2", &group, &["node-b"]));

        let affected = dfns.remove_instances_on(&NodeName::new("node-a"));
        assert_eq!(affected, vec![ResourceName::new("rsc-1")]);

        let node_a = NodeName::new("node-a");
        assert_eq!(dfns.resources_on(&node_a).count(), 0);
        let node_b = NodeName::new("node-b");
        assert_eq!(dfns.resources_on(&node_b).count(), 2);
    }
}
