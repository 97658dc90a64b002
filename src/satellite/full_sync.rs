//! Full Sync Installation
//!
//! Replaces the whole local model with the payload of a full sync, under
//! every lock at once. Nothing is written unless the payload passes the
//! epoch and sequence checks.

use super::update_monitor::UpdateMonitor;
use crate::domain::{NodeName, ResourceName};
use crate::error::{Error, Result};
use crate::model::{CoreModel, LockRequest};
use crate::protocol::{FullSyncData, RESERVED_FULL_SYNC_SEQUENCE};
use std::sync::Arc;
use tracing::info;

pub struct FullSyncInstaller {
    local_node: NodeName,
    model: Arc<CoreModel>,
    monitor: Arc<UpdateMonitor>,
}

impl FullSyncInstaller {
    pub fn new(local_node: NodeName, model: Arc<CoreModel>, monitor: Arc<UpdateMonitor>) -> Self {
        Self {
            local_node,
            model,
            monitor,
        }
    }

    /// Install `data`, returning the resources now known locally.
    ///
    /// Fails with [`Error::StaleEpoch`] for a full sync of an older epoch,
    /// leaving the model untouched.
    pub fn install(&self, data: FullSyncData) -> Result<Vec<ResourceName>> {
        self.monitor.check_epoch(data.epoch)?;
        if data.sequence != RESERVED_FULL_SYNC_SEQUENCE {
            return Err(Error::InvalidPayload(format!(
                "full sync of epoch {} carries sequence {}",
                data.epoch, data.sequence
            )));
        }
        if !data.nodes.iter().any(|node| node.name == self.local_node) {
            return Err(Error::InvalidPayload(format!(
                "full sync of epoch {} does not contain local node {}",
                data.epoch, self.local_node
            )));
        }

        let mut guard = self.model.lock(&LockRequest::exclusive());
        guard.clear_all()?;

        let nodes = guard.nodes_mut()?;
        for node in data.nodes {
            nodes.insert(node.name.clone(), node);
        }
        let pools = guard.storage_pools_mut()?;
        for pool in data.storage_pools {
            pools.insert(pool.key(), pool);
        }

        let definitions = guard.resource_definitions_mut()?;
        let resources: Vec<ResourceName> = data
            .resource_definitions
            .iter()
            .map(|d| d.name.clone())
            .collect();
        for definition in data.resource_definitions {
            definitions.insert(definition);
        }
        for snapshot in data.snapshots {
            definitions.insert_snapshot(snapshot);
        }

        let remotes = guard.remotes_mut()?;
        for remote in data.remotes {
            remotes.insert(remote.name.clone(), remote);
        }
        let files = guard.external_files_mut()?;
        for file in data.external_files {
            files.insert(file.path.clone(), file);
        }

        let config = guard.config_mut()?;
        config.props = data.cluster_props;
        config.secret = data.secret;

        info!(
            "Installed full sync of epoch {} ({} resources)",
            data.epoch,
            resources.len()
        );
        Ok(resources)
    }
}
