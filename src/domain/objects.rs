//! Cluster Model Objects
//!
//! The entities the controller owns and ships to satellites. Satellites hold
//! a projection of the same types, restricted to what concerns their node.

use super::identifiers::{
    Fingerprint, NodeName, RemoteName, ResourceGroupName, ResourceName, SharedPoolId,
    SnapshotName, StorPoolName,
};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

/// Free-form property map
pub type Props = BTreeMap<String, String>;

// =============================================================================
// Entity Kind
// =============================================================================

/// Kinds of entity that travel over the sync protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Node,
    ResourceDefinition,
    StoragePool,
    Snapshot,
    Remote,
    ExternalFile,
    ClusterConfig,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::Node => write!(f, "node"),
            EntityKind::ResourceDefinition => write!(f, "resource definition"),
            EntityKind::StoragePool => write!(f, "storage pool"),
            EntityKind::Snapshot => write!(f, "snapshot"),
            EntityKind::Remote => write!(f, "remote"),
            EntityKind::ExternalFile => write!(f, "external file"),
            EntityKind::ClusterConfig => write!(f, "cluster config"),
        }
    }
}

impl EntityKind {
    /// Two entities with one name are the same entity only if their
    /// fingerprints agree
    pub fn verify_identity(
        &self,
        name: &str,
        local: Option<Fingerprint>,
        received: Fingerprint,
    ) -> Result<()> {
        match local {
            Some(local) if local != received => Err(Error::FingerprintMismatch {
                kind: self.to_string(),
                name: name.to_string(),
                local: local.to_string(),
                received: received.to_string(),
            }),
            _ => Ok(()),
        }
    }
}

// =============================================================================
// Nodes
// =============================================================================

/// Role of a node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Controller,
    Satellite,
    /// Controller and satellite in one process
    Combined,
    /// Satellite without local storage duties, e.g. a backup target
    Auxiliary,
}

impl NodeType {
    /// Whether a satellite process may authenticate as a node of this type
    pub fn runs_satellite(&self) -> bool {
        !matches!(self, NodeType::Controller)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeFlag {
    Delete,
    QuorumIgnore,
    Evicted,
    Evacuate,
}

/// A network endpoint of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetInterface {
    pub name: String,
    pub address: IpAddr,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterNode {
    pub fingerprint: Fingerprint,
    pub name: NodeName,
    pub node_type: NodeType,
    #[serde(default)]
    pub net_interfaces: Vec<NetInterface>,
    #[serde(default)]
    pub flags: BTreeSet<NodeFlag>,
    #[serde(default)]
    pub props: Props,
}

impl ClusterNode {
    pub fn new(name: impl Into<NodeName>, node_type: NodeType) -> Self {
        Self {
            fingerprint: Fingerprint::generate(),
            name: name.into(),
            node_type,
            net_interfaces: Vec::new(),
            flags: BTreeSet::new(),
            props: Props::new(),
        }
    }

    pub fn with_interface(mut self, name: &str, address: IpAddr) -> Self {
        self.net_interfaces.push(NetInterface {
            name: name.to_string(),
            address,
            port: None,
        });
        self
    }

    pub fn has_flag(&self, flag: NodeFlag) -> bool {
        self.flags.contains(&flag)
    }

    pub fn has_address(&self, address: &IpAddr) -> bool {
        self.net_interfaces.iter().any(|nif| nif.address == *address)
    }
}

// =============================================================================
// Resources
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceGroupRef {
    pub fingerprint: Fingerprint,
    pub name: ResourceGroupName,
}

impl ResourceGroupRef {
    pub fn new(name: impl Into<ResourceGroupName>) -> Self {
        Self {
            fingerprint: Fingerprint::generate(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeDefinition {
    pub number: u32,
    pub size_kib: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceFlag {
    Delete,
    Inactive,
    InactivePermanently,
    Diskless,
}

/// One volume of a resource instance and the pool backing it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub number: u32,
    pub storage_pool: StorPoolName,
}

/// A resource definition instantiated on one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub fingerprint: Fingerprint,
    pub node_name: NodeName,
    #[serde(default)]
    pub flags: BTreeSet<ResourceFlag>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
    #[serde(default)]
    pub props: Props,
}

impl Resource {
    pub fn new(node_name: impl Into<NodeName>) -> Self {
        Self {
            fingerprint: Fingerprint::generate(),
            node_name: node_name.into(),
            flags: BTreeSet::new(),
            volumes: Vec::new(),
            props: Props::new(),
        }
    }

    pub fn with_volume(mut self, number: u32, storage_pool: impl Into<StorPoolName>) -> Self {
        self.volumes.push(Volume {
            number,
            storage_pool: storage_pool.into(),
        });
        self
    }

    pub fn with_flag(mut self, flag: ResourceFlag) -> Self {
        self.flags.insert(flag);
        self
    }

    /// Inactive resources never touch their backing medium
    pub fn is_inactive(&self) -> bool {
        self.flags.contains(&ResourceFlag::Inactive)
            || self.flags.contains(&ResourceFlag::InactivePermanently)
    }
}

/// Cluster-wide definition of a resource and its per-node instances
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDefinition {
    pub fingerprint: Fingerprint,
    pub name: ResourceName,
    pub group: ResourceGroupRef,
    /// Device stack description, opaque to the sync core
    #[serde(default)]
    pub layer_stack: Vec<String>,
    #[serde(default)]
    pub volume_definitions: Vec<VolumeDefinition>,
    #[serde(default)]
    pub props: Props,
    #[serde(default)]
    pub resources: BTreeMap<NodeName, Resource>,
}

impl ResourceDefinition {
    pub fn new(name: impl Into<ResourceName>, group: ResourceGroupRef) -> Self {
        Self {
            fingerprint: Fingerprint::generate(),
            name: name.into(),
            group,
            layer_stack: Vec::new(),
            volume_definitions: Vec::new(),
            props: Props::new(),
            resources: BTreeMap::new(),
        }
    }

    pub fn with_resource(mut self, resource: Resource) -> Self {
        self.resources.insert(resource.node_name.clone(), resource);
        self
    }

    pub fn resource_on(&self, node: &NodeName) -> Option<&Resource> {
        self.resources.get(node)
    }

    pub fn has_resource_on(&self, node: &NodeName) -> bool {
        self.resources.contains_key(node)
    }

    /// Nodes hosting an instance of this definition
    pub fn node_names(&self) -> impl Iterator<Item = &NodeName> {
        self.resources.keys()
    }
}

// =============================================================================
// Storage Pools
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoragePool {
    pub fingerprint: Fingerprint,
    pub name: StorPoolName,
    pub node_name: NodeName,
    /// Storage provider kind, opaque to the sync core
    pub provider_kind: String,
    /// Set when the backing medium is visible to several nodes
    #[serde(default)]
    pub shared_id: Option<SharedPoolId>,
    #[serde(default)]
    pub props: Props,
}

impl StoragePool {
    pub fn new(
        name: impl Into<StorPoolName>,
        node_name: impl Into<NodeName>,
        provider_kind: &str,
    ) -> Self {
        Self {
            fingerprint: Fingerprint::generate(),
            name: name.into(),
            node_name: node_name.into(),
            provider_kind: provider_kind.to_string(),
            shared_id: None,
            props: Props::new(),
        }
    }

    pub fn shared(mut self, shared_id: impl Into<SharedPoolId>) -> Self {
        self.shared_id = Some(shared_id.into());
        self
    }

    pub fn is_shared(&self) -> bool {
        self.shared_id.is_some()
    }

    /// Map key of this pool
    pub fn key(&self) -> StoragePoolKey {
        (self.node_name.clone(), self.name.clone())
    }
}

/// Storage pools are unique per node
pub type StoragePoolKey = (NodeName, StorPoolName);

// =============================================================================
// Snapshots
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotFlag {
    Successful,
    Shipping,
    ShippingTarget,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub fingerprint: Fingerprint,
    pub node_name: NodeName,
    #[serde(default)]
    pub flags: BTreeSet<SnapshotFlag>,
}

impl Snapshot {
    pub fn new(node_name: impl Into<NodeName>) -> Self {
        Self {
            fingerprint: Fingerprint::generate(),
            node_name: node_name.into(),
            flags: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDefinition {
    pub fingerprint: Fingerprint,
    pub resource_name: ResourceName,
    pub name: SnapshotName,
    #[serde(default)]
    pub flags: BTreeSet<SnapshotFlag>,
    #[serde(default)]
    pub snapshots: BTreeMap<NodeName, Snapshot>,
}

impl SnapshotDefinition {
    pub fn new(resource_name: impl Into<ResourceName>, name: impl Into<SnapshotName>) -> Self {
        Self {
            fingerprint: Fingerprint::generate(),
            resource_name: resource_name.into(),
            name: name.into(),
            flags: BTreeSet::new(),
            snapshots: BTreeMap::new(),
        }
    }

    pub fn with_snapshot(mut self, snapshot: Snapshot) -> Self {
        self.snapshots.insert(snapshot.node_name.clone(), snapshot);
        self
    }

    /// Still being taken or shipped
    pub fn in_progress(&self) -> bool {
        !self.flags.contains(&SnapshotFlag::Successful)
            || self.flags.contains(&SnapshotFlag::Shipping)
    }

    pub fn key(&self) -> SnapshotKey {
        (self.resource_name.clone(), self.name.clone())
    }
}

pub type SnapshotKey = (ResourceName, SnapshotName);

// =============================================================================
// Remotes, External Files, Cluster Config
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Remote {
    pub fingerprint: Fingerprint,
    pub name: RemoteName,
    pub url: String,
    #[serde(default)]
    pub props: Props,
}

impl Remote {
    pub fn new(name: impl Into<RemoteName>, url: &str) -> Self {
        Self {
            fingerprint: Fingerprint::generate(),
            name: name.into(),
            url: url.to_string(),
            props: Props::new(),
        }
    }
}

/// A file the controller distributes to satellites verbatim
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalFile {
    pub fingerprint: Fingerprint,
    pub path: String,
    pub content: Vec<u8>,
}

impl ExternalFile {
    pub fn new(path: &str, content: impl Into<Vec<u8>>) -> Self {
        Self {
            fingerprint: Fingerprint::generate(),
            path: path.to_string(),
            content: content.into(),
        }
    }
}

/// State guarded by the reconfiguration lock
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub props: Props,
    /// Secret material for encrypted volumes
    #[serde(default)]
    pub secret: Option<Vec<u8>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inactive_resource() {
        let rsc = Resource::new("node-a").with_flag(ResourceFlag::InactivePermanently);
        assert!(rsc.is_inactive());
        assert!(!Resource::new("node-a").is_inactive());
    }

    #[test]
    fn test_snapshot_in_progress() {
        let mut snap = SnapshotDefinition::new("rsc-1", "snap-1");
        assert!(snap.in_progress());

        snap.flags.insert(SnapshotFlag::Successful);
        assert!(!snap.in_progress());

        snap.flags.insert(SnapshotFlag::Shipping);
        assert!(snap.in_progress());
    }

    #[test]
    fn test_identity_divergence() {
        let local = Fingerprint::generate();
        assert!(EntityKind::Node.verify_identity("node-a", None, local).is_ok());
        assert!(EntityKind::Node.verify_identity("node-a", Some(local), local).is_ok());

        let err = EntityKind::Node
            .verify_identity("node-a", Some(local), Fingerprint::generate())
            .unwrap_err();
        assert!(matches!(err, Error::FingerprintMismatch { ref name, .. } if name == "node-a"));
    }

    #[test]
    fn test_controller_cannot_run_satellite() {
        assert!(!NodeType::Controller.runs_satellite());
        assert!(NodeType::Combined.runs_satellite());
        assert!(NodeType::Auxiliary.runs_satellite());
    }
}
