//! Inbound Satellite Messages
//!
//! Runs on the session's reader task. Nothing here awaits a call answer:
//! answers arrive on this same task, so waiting is moved to spawned tasks.

use super::responses::{DeliveryReport, ReportLevel};
use super::shared_pool::LockRequester;
use super::update_caller::FanOut;
use super::Controller;
use crate::domain::{NodeName, ResourceName};
use crate::error::{ErrorAction, Result};
use crate::model::{LockObj, LockRequest};
use crate::net::{read_frames, write_frames, ConnectionHandler, ReadEnd};
use crate::protocol::{AuthRequest, Frame, FrameKind, SatelliteMessage};
use crate::session::PeerSession;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, error, info, trace, warn};

fn peer_of(session: &PeerSession) -> Result<NodeName> {
    session.access().require_peer().cloned()
}

fn log_report(report: &DeliveryReport) {
    for entry in &report.entries {
        match entry.level {
            ReportLevel::Info => debug!("{}: {}", entry.node, entry.message),
            ReportLevel::Warning => warn!("{}: {}", entry.node, entry.message),
            ReportLevel::Error => error!("{}: {}", entry.node, entry.message),
        }
    }
}

impl Controller {
    /// Dispatch one frame from a satellite
    pub fn handle_frame(&self, session: &Arc<PeerSession>, frame: Frame<SatelliteMessage>) -> Result<()> {
        session.touch();
        if let FrameKind::Response(call_id) = frame.kind {
            session.complete_call(call_id, frame.message);
            return Ok(());
        }

        match frame.message {
            SatelliteMessage::Authenticate(request) => self.on_authenticate(session, &request),
            SatelliteMessage::RequestEntity(entity) => {
                let node = peer_of(session)?;
                trace!("{} requested {}", node, entity);
                let report = self.updates.answer_request(&node, &entity)?;
                log_report(&report);
                Ok(())
            }
            SatelliteMessage::ResourceApplied { resource } => {
                let node = peer_of(session)?;
                self.on_resource_applied(&node, &resource)
            }
            SatelliteMessage::FullSyncFailed { epoch, reason } => {
                let node = peer_of(session)?;
                if epoch == session.epoch() {
                    self.full_sync.mark_failed(session, &node, &reason)
                } else {
                    debug!(
                        "Ignoring full sync failure of epoch {} from {} (current {})",
                        epoch,
                        node,
                        session.epoch()
                    );
                    Ok(())
                }
            }
            SatelliteMessage::Pong => {
                let node = peer_of(session)?;
                if let Err(e) = self.registry.heartbeat(&node) {
                    debug!("Heartbeat of {} not recorded: {}", node, e);
                }
                Ok(())
            }
            SatelliteMessage::ChangedAck | SatelliteMessage::FullSyncResponse(_) => {
                debug!("Unsolicited answer from {} outside a call", session.label());
                Ok(())
            }
        }
    }

    fn on_authenticate(&self, session: &Arc<PeerSession>, request: &AuthRequest) -> Result<()> {
        if session.is_authenticated() {
            warn!(
                "{} sent a second authentication on session {}, ignoring",
                session.label(),
                session.id()
            );
            return Ok(());
        }

        let accepted = self.authenticator.authenticate(session, request)?;
        if let Some(pending) = self.full_sync.send(session, accepted.epoch)? {
            let full_sync = self.full_sync.clone();
            let session = session.clone();
            tokio::spawn(async move {
                if let Err(e) = full_sync.await_outcome(&session, pending).await {
                    warn!("Full sync of {} did not complete: {}", session.label(), e);
                    session.close();
                }
            });
        }
        Ok(())
    }

    fn on_resource_applied(&self, node: &NodeName, resource: &ResourceName) -> Result<()> {
        self.retry.remove(node, resource);
        let granted = self
            .locks
            .complete(&LockRequester::new(node.clone(), resource.clone()));
        if granted.is_empty() {
            return Ok(());
        }

        let guard = self.model.lock(
            &LockRequest::new()
                .read(LockObj::Nodes)
                .read(LockObj::ResourceDefinitions)
                .read(LockObj::StoragePools),
        );
        let mut fan_out = FanOut::default();
        self.updates.push_granted(&guard, &mut fan_out, granted)?;
        log_report(fan_out.report());
        Ok(())
    }

    /// Run one satellite link until it ends
    pub async fn serve_stream<S>(&self, stream: S, peer: Option<SocketAddr>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (session, outbound) = self.accept_session(peer);
        let (reader, writer) = tokio::io::split(stream);
        let token = session.closed_token();
        let writer = tokio::spawn(write_frames(writer, outbound, token.clone()));

        let result = read_frames(reader, token, |frame: Frame<SatelliteMessage>| {
            std::future::ready(self.handle_frame(&session, frame))
        })
        .await;
        match result {
            Ok(ReadEnd::Eof) => info!("{} closed the connection", session.label()),
            Ok(ReadEnd::Cancelled) => debug!("Session {} of {} closed", session.id(), session.label()),
            Err(e) => match e.action() {
                ErrorAction::Fatal => error!("Session {} of {}: {}", session.id(), session.label(), e),
                _ => warn!("Session {} of {}: {}", session.id(), session.label(), e),
            },
        }

        self.session_closed(&session);
        match writer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Writer of session {} ended: {}", session.id(), e),
            Err(e) => warn!("Writer of session {} panicked: {}", session.id(), e),
        }
    }
}

#[async_trait]
impl ConnectionHandler for Controller {
    async fn serve(&self, stream: TcpStream, peer: SocketAddr) {
        self.serve_stream(stream, Some(peer)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerConfig;
    use crate::domain::{ClusterNode, Fingerprint, NodeType, Resource, ResourceDefinition, ResourceGroupRef, StoragePool};
    use crate::protocol::{
        AuthResponse, Change, ControllerMessage, EntityRef, FullSyncResult, PROTOCOL_VERSION,
    };
    use crate::session::ConnectionStatus;
    use assert_matches::assert_matches;
    use tokio::sync::mpsc;

    type Outbound = mpsc::UnboundedReceiver<Frame<ControllerMessage>>;

    fn controller(awaits_response: bool) -> Arc<Controller> {
        Controller::new(ControllerConfig {
            full_sync_awaits_response: awaits_response,
            match_peer_address: false,
            ..Default::default()
        })
        .unwrap()
    }

    fn authenticate(controller: &Controller, node: &str) -> (Arc<PeerSession>, Outbound) {
        let (session, rx) = controller.accept_session(None);
        let request = AuthRequest {
            node_name: NodeName::new(node),
            fingerprint: Fingerprint::nil(),
            version: PROTOCOL_VERSION,
        };
        controller
            .handle_frame(&session, Frame::oneway(SatelliteMessage::Authenticate(request)))
            .unwrap();
        (session, rx)
    }

    #[tokio::test]
    async fn test_authenticate_then_full_sync() {
        let controller = controller(false);
        controller
            .upsert_node(ClusterNode::new("node-a", NodeType::Satellite))
            .await
            .unwrap();
        let (session, mut rx) = authenticate(&controller, "node-a");

        let frame = rx.try_recv().unwrap();
        assert_matches!(frame.message, ControllerMessage::AuthResponse(AuthResponse::Accepted { epoch: 1, .. }));
        let frame = rx.try_recv().unwrap();
        assert_matches!(frame.message, ControllerMessage::FullSync(ref data) if data.epoch == 1 && data.nodes.len() == 1);
        assert_eq!(session.status(), ConnectionStatus::Online);

        // a second handshake on the same session changes nothing
        let again = AuthRequest {
            node_name: NodeName::new("node-a"),
            fingerprint: Fingerprint::nil(),
            version: PROTOCOL_VERSION,
        };
        controller
            .handle_frame(&session, Frame::oneway(SatelliteMessage::Authenticate(again)))
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_sync_call_answer_routes_to_waiter() {
        let controller = controller(true);
        controller
            .upsert_node(ClusterNode::new("node-a", NodeType::Satellite))
            .await
            .unwrap();
        let (session, mut rx) = authenticate(&controller, "node-a");

        let _accepted = rx.recv().await.unwrap();
        let full_sync = rx.recv().await.unwrap();
        let call_id = full_sync.call_id().unwrap();
        assert_eq!(session.status(), ConnectionStatus::FullSyncPending);

        let answer = SatelliteMessage::FullSyncResponse(FullSyncResult::Success(Default::default()));
        controller
            .handle_frame(&session, Frame::response(call_id, answer))
            .unwrap();
        for _ in 0..50 {
            if session.is_online() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(session.is_online());
    }

    #[tokio::test]
    async fn test_unauthenticated_request_is_refused() {
        let controller = controller(false);
        let (session, _rx) = controller.accept_session(None);
        let frame = Frame::oneway(SatelliteMessage::RequestEntity(EntityRef::Node(NodeName::new("node-a"))));
        assert!(controller.handle_frame(&session, frame).is_err());
    }

    #[tokio::test]
    async fn test_stale_full_sync_failure_ignored() {
        let controller = controller(false);
        controller
            .upsert_node(ClusterNode::new("node-a", NodeType::Satellite))
            .await
            .unwrap();
        let (session, _rx) = authenticate(&controller, "node-a");

        let stale = SatelliteMessage::FullSyncFailed {
            epoch: 0,
            reason: "disk probe failed".into(),
        };
        controller.handle_frame(&session, Frame::oneway(stale)).unwrap();
        assert!(session.is_online());

        let current = SatelliteMessage::FullSyncFailed {
            epoch: session.epoch(),
            reason: "disk probe failed".into(),
        };
        controller.handle_frame(&session, Frame::oneway(current)).unwrap();
        assert!(session.full_sync_failed());
    }

    #[tokio::test]
    async fn test_resource_applied_hands_lock_on() {
        let controller = controller(false);
        for name in ["node-a", "node-b"] {
            controller
                .upsert_node(ClusterNode::new(name, NodeType::Satellite))
                .await
                .unwrap();
            controller
                .upsert_storage_pool(StoragePool::new("san", name, "LVM").shared("lun-7"))
                .await
                .unwrap();
        }
        let (a, mut rx_a) = authenticate(&controller, "node-a");
        let (_b, mut rx_b) = authenticate(&controller, "node-b");
        while rx_a.try_recv().is_ok() {}
        while rx_b.try_recv().is_ok() {}

        for (rsc, node) in [("rsc-a", "node-a"), ("rsc-b", "node-b")] {
            let definition = ResourceDefinition::new(rsc, ResourceGroupRef::new("rg"))
                .with_resource(Resource::new(node).with_volume(0, "san"));
            controller.upsert_resource_definition(definition).await.unwrap();
        }
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());

        let applied = SatelliteMessage::ResourceApplied {
            resource: ResourceName::new("rsc-a"),
        };
        controller.handle_frame(&a, Frame::oneway(applied)).unwrap();

        let frame = rx_b.try_recv().unwrap();
        assert_matches!(frame.message, ControllerMessage::Update(ref u) if matches!(u.change, Change::ApplyResource(_)));
    }
}
