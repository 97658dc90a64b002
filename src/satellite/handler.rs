//! Inbound Controller Messages
//!
//! Runs on the link's reader task, one frame at a time, so the full sync
//! and every update are handled in the order the controller sent them.

use super::changes::{from_envelope, ApplyEffects};
use super::{Link, Satellite};
use crate::domain::{CapabilityReport, ResourceName};
use crate::error::{Error, Result};
use crate::protocol::{
    AuthRejection, AuthResponse, ChangedNotice, ControllerMessage, Frame, FrameKind,
    FullSyncData, FullSyncResult, SatelliteMessage, PROTOCOL_VERSION,
};
use tracing::{debug, error, info, trace, warn};

impl Satellite {
    pub(crate) async fn handle_frame(
        &self,
        link: &Link,
        frame: Frame<ControllerMessage>,
    ) -> Result<()> {
        if let FrameKind::Response(call_id) = frame.kind {
            debug!("Ignoring answer to unknown call {}", call_id);
            return Ok(());
        }
        let call_id = frame.call_id();

        match frame.message {
            ControllerMessage::AuthResponse(response) => self.on_auth_response(response),
            ControllerMessage::FullSync(data) => self.on_full_sync(link, call_id, *data).await,
            ControllerMessage::Update(envelope) => {
                let effects = self.applier.submit(from_envelope(envelope))?;
                self.dispatch(link, effects).await
            }
            ControllerMessage::Changed(notice) => self.on_changed(link, call_id, notice),
            ControllerMessage::Ping => match call_id {
                Some(id) => link.respond(id, SatelliteMessage::Pong),
                None => link.send(SatelliteMessage::Pong),
            },
        }
    }

    fn on_auth_response(&self, response: AuthResponse) -> Result<()> {
        match response {
            AuthResponse::Accepted {
                node_fingerprint,
                epoch,
            } => {
                self.monitor.authenticated(epoch)?;
                self.applier.clear();
                *self.fingerprint.lock() = node_fingerprint;
                info!("Authenticated as {} in epoch {}", self.local_node, epoch);
                Ok(())
            }
            AuthResponse::Rejected { reason, message } => Err(match reason {
                AuthRejection::HostnameMismatch => Error::HostnameMismatch {
                    declared: self.local_node.to_string(),
                    expected: message,
                },
                AuthRejection::VersionMismatch => Error::VersionMismatch {
                    local: PROTOCOL_VERSION.to_string(),
                    remote: message,
                },
                AuthRejection::AuthenticationError => Error::AuthenticationFailed {
                    node: self.local_node.to_string(),
                    reason: message,
                },
            }),
        }
    }

    fn on_changed(&self, link: &Link, call_id: Option<u64>, notice: ChangedNotice) -> Result<()> {
        trace!("Controller reports {} changed", notice.entity);
        if let Some(id) = call_id {
            link.respond(id, SatelliteMessage::ChangedAck)?;
        }
        link.send(SatelliteMessage::RequestEntity(notice.entity))
    }

    // =========================================================================
    // Full Sync
    // =========================================================================

    async fn on_full_sync(
        &self,
        link: &Link,
        call_id: Option<u64>,
        data: FullSyncData,
    ) -> Result<()> {
        let epoch = data.epoch;
        let (resources, report) = match self.prepare_full_sync(data).await {
            Ok(prepared) => prepared,
            Err(e @ Error::StaleEpoch { .. }) => {
                warn!("Discarding full sync: {}", e);
                self.metrics.stale_dropped.inc();
                return Ok(());
            }
            Err(e) => {
                error!("Full sync of epoch {} failed: {}", epoch, e);
                self.metrics.full_syncs_failed.inc();
                let reason = e.to_string();
                let answer = match call_id {
                    Some(id) => link.respond(
                        id,
                        SatelliteMessage::FullSyncResponse(FullSyncResult::Failed {
                            reason: reason.clone(),
                        }),
                    ),
                    None => link.send(SatelliteMessage::FullSyncFailed { epoch, reason }),
                };
                if let Err(send) = answer {
                    debug!("Full sync failure not reported: {}", send);
                }
                self.applier.abandon(&e);
                return Ok(());
            }
        };

        let effects = self.applier.go_online(epoch)?;
        for resource in &resources {
            self.reconciler.resource_connected(resource).await;
        }
        self.dispatch(link, effects).await?;
        if let Some(id) = call_id {
            link.respond(
                id,
                SatelliteMessage::FullSyncResponse(FullSyncResult::Success(report)),
            )?;
        }
        Ok(())
    }

    /// Install the payload and rebuild what depends on it
    async fn prepare_full_sync(
        &self,
        data: FullSyncData,
    ) -> Result<(Vec<ResourceName>, CapabilityReport)> {
        let resources = self.installer.install(data)?;
        self.reconciler
            .full_sync_applied(&self.local_node, &resources)
            .await?;
        let report = self.probe.probe().await?;
        Ok((resources, report))
    }

    /// Wake reconciliation for what an apply touched and acknowledge local
    /// resources
    async fn dispatch(&self, link: &Link, effects: ApplyEffects) -> Result<()> {
        if effects.is_empty() {
            return Ok(());
        }
        for node in &effects.nodes {
            self.reconciler.node_changed(node).await;
        }
        for resource in &effects.resources {
            self.reconciler.resource_changed(resource).await;
        }
        for pool in &effects.storage_pools {
            self.reconciler.storage_pool_changed(pool).await;
        }
        if effects.reconfigured {
            info!("Cluster configuration changed");
        }
        for resource in effects.acknowledge {
            link.send(SatelliteMessage::ResourceApplied { resource })?;
        }
        Ok(())
    }
}
