//! Default collaborators for a standalone satellite process
//!
//! Device reconciliation is out of scope for the sync core, so the default
//! reconciler only logs what it is woken for.

use crate::config::SatelliteConfig;
use crate::domain::{
    CapabilityReport, DeviceReconciler, EnvironmentProbe, LifecycleControl, NodeName,
    ResourceName, StorPoolName,
};
use crate::error::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct LoggingReconciler;

#[async_trait]
impl DeviceReconciler for LoggingReconciler {
    async fn full_sync_applied(&self, local_node: &NodeName, resources: &[ResourceName]) -> Result<()> {
        info!(
            "Full sync applied on {}: {} resources to reconcile",
            local_node,
            resources.len()
        );
        Ok(())
    }

    async fn resource_connected(&self, resource: &ResourceName) {
        debug!("Resource {} connected", resource);
    }

    async fn resource_changed(&self, resource: &ResourceName) {
        debug!("Resource {} changed", resource);
    }

    async fn storage_pool_changed(&self, pool: &StorPoolName) {
        debug!("Storage pool {} changed", pool);
    }

    async fn node_changed(&self, node: &NodeName) {
        debug!("Node {} changed", node);
    }
}

/// Reports the layers and providers named in the configuration
pub struct StaticProbe {
    report: CapabilityReport,
}

impl StaticProbe {
    pub fn new(report: CapabilityReport) -> Self {
        Self { report }
    }

    pub fn from_config(config: &SatelliteConfig) -> Self {
        Self::new(CapabilityReport {
            supported_layers: config.supported_layers.clone(),
            supported_providers: config.supported_providers.clone(),
            ..Default::default()
        })
    }
}

#[async_trait]
impl EnvironmentProbe for StaticProbe {
    async fn probe(&self) -> Result<CapabilityReport> {
        Ok(self.report.clone())
    }
}

/// Ends the process on request
#[derive(Debug, Default)]
pub struct ProcessLifecycle {
    token: CancellationToken,
    reason: Mutex<Option<String>>,
}

impl ProcessLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancelled once shutdown was requested
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn shutdown_reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }
}

impl LifecycleControl for ProcessLifecycle {
    fn request_shutdown(&self, reason: &str) {
        error!("Shutdown requested: {}", reason);
        self.reason.lock().get_or_insert_with(|| reason.to_string());
        self.token.cancel();
    }

    fn drop_controller_connection(&self, reason: &str) {
        warn!("Controller connection dropped: {}", reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_probe_reports_config() {
        let config = SatelliteConfig {
            supported_providers: vec!["LVM".into(), "ZFS_THIN".into()],
            ..Default::default()
        };
        let report = tokio_test::block_on(StaticProbe::from_config(&config).probe()).unwrap();
        assert!(report.supports_provider("zfs_thin"));
        assert_eq!(report.supported_layers, vec!["STORAGE"]);
    }

    #[test]
    fn test_first_shutdown_reason_is_kept() {
        let lifecycle = ProcessLifecycle::new();
        assert!(lifecycle.shutdown_reason().is_none());
        lifecycle.request_shutdown("duplicate sequence 4");
        lifecycle.request_shutdown("second");
        assert!(lifecycle.token().is_cancelled());
        assert_eq!(lifecycle.shutdown_reason().as_deref(), Some("duplicate sequence 4"));
    }
}
