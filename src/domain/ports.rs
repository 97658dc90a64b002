//! Domain Ports - seams between the sync core and its collaborators
//!
//! The satellite side hands installed state to local device reconciliation,
//! asks the environment what it can run, and escalates fatal conditions to
//! the process lifecycle. The controller side hands undeliverable resources
//! back for redelivery.

use super::identifiers::{NodeName, ResourceName, StorPoolName};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Capability Report
// =============================================================================

/// What a satellite found it can run, sent with the full sync acknowledgement
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityReport {
    /// Device layer kinds that are usable
    pub supported_layers: Vec<String>,
    /// Storage provider kinds that are usable
    pub supported_providers: Vec<String>,
    /// Why each unusable layer is unusable
    #[serde(default)]
    pub unsupported_layers: BTreeMap<String, Vec<String>>,
    /// Why each unusable provider is unusable
    #[serde(default)]
    pub unsupported_providers: BTreeMap<String, Vec<String>>,
}

impl CapabilityReport {
    pub fn supports_provider(&self, kind: &str) -> bool {
        self.supported_providers.iter().any(|p| p.eq_ignore_ascii_case(kind))
    }
}

// =============================================================================
// Satellite Ports
// =============================================================================

/// Local device reconciliation, woken by installed changes
#[async_trait]
pub trait DeviceReconciler: Send + Sync {
    /// State was replaced by a full sync; regenerate derived artifacts
    async fn full_sync_applied(&self, local_node: &NodeName, resources: &[ResourceName])
        -> Result<()>;

    /// Synthetic event for a resource known after a full sync
    async fn resource_connected(&self, resource: &ResourceName);

    /// A resource definition or one of its instances changed or was removed
    async fn resource_changed(&self, resource: &ResourceName);

    /// A storage pool on the local node changed or was removed
    async fn storage_pool_changed(&self, pool: &StorPoolName);

    /// A node changed or was removed
    async fn node_changed(&self, node: &NodeName);
}

/// Probes the local environment for supported layers and providers
#[async_trait]
pub trait EnvironmentProbe: Send + Sync {
    async fn probe(&self) -> Result<CapabilityReport>;
}

/// Escalation paths out of the update applier
pub trait LifecycleControl: Send + Sync {
    /// Stop the process; continuing would risk corrupting local state
    fn request_shutdown(&self, reason: &str);

    /// Drop the controller connection so a fresh handshake can follow
    fn drop_controller_connection(&self, reason: &str);
}

// =============================================================================
// Controller Ports
// =============================================================================

/// Pushes a resource that could not be delivered earlier
#[async_trait]
pub trait RetryDelivery: Send + Sync {
    /// Returns true once the update reached the node
    async fn redeliver(&self, node: &NodeName, resource: &ResourceName) -> Result<bool>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type DeviceReconcilerRef = Arc<dyn DeviceReconciler>;
pub type EnvironmentProbeRef = Arc<dyn EnvironmentProbe>;
pub type LifecycleControlRef = Arc<dyn LifecycleControl>;
pub type RetryDeliveryRef = Arc<dyn RetryDelivery>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_provider_lookup() {
        let report = CapabilityReport {
            supported_providers: vec!["LVM_THIN".into(), "ZFS".into()],
            ..Default::default()
        };
        assert!(report.supports_provider("lvm_thin"));
        assert!(!report.supports_provider("file"));
    }
}
