//! Wire Messages
//!
//! Closed message sets for both directions. Every incremental change is one
//! [`Change`] variant; the satellite matches them exhaustively.

use crate::domain::{
    CapabilityReport, ClusterNode, EntityKind, ExternalFile, Fingerprint, NodeName, Props,
    Remote, RemoteName, ResourceDefinition, ResourceName, SnapshotDefinition, SnapshotName,
    StorPoolName, StoragePool,
};
use serde::{Deserialize, Serialize};

// =============================================================================
// Constants
// =============================================================================

/// Sequence number carried by every full sync
pub const RESERVED_FULL_SYNC_SEQUENCE: u64 = 0;

/// First sequence number of incremental updates within an epoch
pub const FIRST_UPDATE_SEQUENCE: u64 = 1;

/// Version spoken by this build
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion { major: 1, minor: 4 };

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    /// Peers interoperate when the major versions agree
    pub fn is_compatible(&self, other: &ProtocolVersion) -> bool {
        self.major == other.major
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

// =============================================================================
// Frames
// =============================================================================

/// How a frame relates to a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    Oneway,
    Call(u64),
    Response(u64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame<M> {
    pub kind: FrameKind,
    pub message: M,
}

impl<M> Frame<M> {
    pub fn oneway(message: M) -> Self {
        Self {
            kind: FrameKind::Oneway,
            message,
        }
    }

    pub fn call(call_id: u64, message: M) -> Self {
        Self {
            kind: FrameKind::Call(call_id),
            message,
        }
    }

    pub fn response(call_id: u64, message: M) -> Self {
        Self {
            kind: FrameKind::Response(call_id),
            message,
        }
    }

    /// Id to answer to, when the sender awaits a response
    pub fn call_id(&self) -> Option<u64> {
        match self.kind {
            FrameKind::Call(id) => Some(id),
            _ => None,
        }
    }
}

// =============================================================================
// Entity References
// =============================================================================

/// Names an entity without carrying it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum EntityRef {
    Node(NodeName),
    ResourceDefinition(ResourceName),
    StoragePool(StorPoolName),
    Snapshot {
        resource: ResourceName,
        snapshot: SnapshotName,
    },
    Remote(RemoteName),
    ExternalFile(String),
}

impl EntityRef {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityRef::Node(_) => EntityKind::Node,
            EntityRef::ResourceDefinition(_) => EntityKind::ResourceDefinition,
            EntityRef::StoragePool(_) => EntityKind::StoragePool,
            EntityRef::Snapshot { .. } => EntityKind::Snapshot,
            EntityRef::Remote(_) => EntityKind::Remote,
            EntityRef::ExternalFile(_) => EntityKind::ExternalFile,
        }
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityRef::Node(name) => write!(f, "node {}", name),
            EntityRef::ResourceDefinition(name) => write!(f, "resource definition {}", name),
            EntityRef::StoragePool(name) => write!(f, "storage pool {}", name),
            EntityRef::Snapshot { resource, snapshot } => {
                write!(f, "snapshot {}/{}", resource, snapshot)
            }
            EntityRef::Remote(name) => write!(f, "remote {}", name),
            EntityRef::ExternalFile(path) => write!(f, "external file {}", path),
        }
    }
}

// =============================================================================
// Controller -> Satellite
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ControllerMessage {
    AuthResponse(AuthResponse),
    FullSync(Box<FullSyncData>),
    Update(UpdateEnvelope),
    /// Pull hint: the named entity changed, ask for it
    Changed(ChangedNotice),
    Ping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthRejection {
    HostnameMismatch,
    AuthenticationError,
    VersionMismatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthResponse {
    Accepted {
        node_fingerprint: Fingerprint,
        epoch: u64,
    },
    Rejected {
        reason: AuthRejection,
        message: String,
    },
}

/// Everything a satellite must know, tagged with a fresh epoch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FullSyncData {
    pub epoch: u64,
    pub sequence: u64,
    pub nodes: Vec<ClusterNode>,
    pub storage_pools: Vec<StoragePool>,
    pub resource_definitions: Vec<ResourceDefinition>,
    pub snapshots: Vec<SnapshotDefinition>,
    #[serde(default)]
    pub remotes: Vec<Remote>,
    #[serde(default)]
    pub external_files: Vec<ExternalFile>,
    #[serde(default)]
    pub cluster_props: Props,
    #[serde(default)]
    pub secret: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateEnvelope {
    pub epoch: u64,
    pub sequence: u64,
    pub change: Change,
}

/// A resource definition and the nodes hosting its instances
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcePayload {
    pub definition: ResourceDefinition,
    pub nodes: Vec<ClusterNode>,
}

/// Incremental change variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Change {
    ApplyNode(ClusterNode),
    DeleteNode { name: NodeName },
    ApplyResource(ResourcePayload),
    DeleteResource { name: ResourceName },
    ApplyStoragePool(StoragePool),
    DeleteStoragePool { name: StorPoolName },
    ApplySnapshot(SnapshotDefinition),
    EndSnapshot {
        resource: ResourceName,
        snapshot: SnapshotName,
    },
    ApplyClusterConfig { props: Props },
    SetSecret { secret: Vec<u8> },
    ApplyRemote(Remote),
    DeleteRemote { name: RemoteName },
    ApplyExternalFile(ExternalFile),
    DeleteExternalFile { path: String },
}

impl Change {
    pub fn kind(&self) -> EntityKind {
        match self {
            Change::ApplyNode(_) | Change::DeleteNode { .. } => EntityKind::Node,
            Change::ApplyResource(_) | Change::DeleteResource { .. } => {
                EntityKind::ResourceDefinition
            }
            Change::ApplyStoragePool(_) | Change::DeleteStoragePool { .. } => {
                EntityKind::StoragePool
            }
            Change::ApplySnapshot(_) | Change::EndSnapshot { .. } => EntityKind::Snapshot,
            Change::ApplyClusterConfig { .. } | Change::SetSecret { .. } => {
                EntityKind::ClusterConfig
            }
            Change::ApplyRemote(_) | Change::DeleteRemote { .. } => EntityKind::Remote,
            Change::ApplyExternalFile(_) | Change::DeleteExternalFile { .. } => {
                EntityKind::ExternalFile
            }
        }
    }

    /// Delete variants carry a name only
    pub fn is_delete(&self) -> bool {
        matches!(
            self,
            Change::DeleteNode { .. }
                | Change::DeleteResource { .. }
                | Change::DeleteStoragePool { .. }
                | Change::EndSnapshot { .. }
                | Change::DeleteRemote { .. }
                | Change::DeleteExternalFile { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangedNotice {
    pub entity: EntityRef,
    pub fingerprint: Option<Fingerprint>,
}

// =============================================================================
// Satellite -> Controller
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SatelliteMessage {
    Authenticate(AuthRequest),
    /// Answer to a full sync sent as a call
    FullSyncResponse(FullSyncResult),
    /// Sent when a fire-and-forget full sync could not be installed
    FullSyncFailed { epoch: u64, reason: String },
    RequestEntity(EntityRef),
    ChangedAck,
    ResourceApplied { resource: ResourceName },
    Pong,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub node_name: NodeName,
    /// Nil until the satellite has been accepted once
    pub fingerprint: Fingerprint,
    pub version: ProtocolVersion,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FullSyncResult {
    Success(CapabilityReport),
    Failed { reason: String },
}
