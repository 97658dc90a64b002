//! Satellite Authentication
//!
//! Checks the identity a satellite claims against the node record. Refusals
//! are answered, recorded with the reconnect supervisor and close the
//! session; an accepted satellite is bound to its node, registered and
//! handed a fresh epoch.

use crate::domain::{ClusterNode, Fingerprint, NodeName, NodeType};
use crate::error::{Error, Result};
use crate::model::{CoreModel, LockObj, LockRequest};
use crate::protocol::{AuthRejection, AuthRequest, AuthResponse, ControllerMessage, PROTOCOL_VERSION};
use crate::session::{ConnectionStatus, PeerRegistry, PeerSession};
use crate::supervisor::{LossReason, ReconnectSupervisor};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of an accepted handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    pub node: NodeName,
    pub fingerprint: Fingerprint,
    pub epoch: u64,
}

#[derive(Clone)]
pub struct Authenticator {
    model: Arc<CoreModel>,
    registry: Arc<PeerRegistry>,
    reconnect: Arc<ReconnectSupervisor>,
    match_peer_address: bool,
}

impl Authenticator {
    pub fn new(
        model: Arc<CoreModel>,
        registry: Arc<PeerRegistry>,
        reconnect: Arc<ReconnectSupervisor>,
        match_peer_address: bool,
    ) -> Self {
        Self {
            model,
            registry,
            reconnect,
            match_peer_address,
        }
    }

    /// Run the handshake for `request` on a fresh session
    pub fn authenticate(&self, session: &Arc<PeerSession>, request: &AuthRequest) -> Result<Accepted> {
        session.transition(ConnectionStatus::Authenticating)?;

        match self.verify(session.remote_addr(), request) {
            Ok((node, fingerprint)) => self.accept(session, node, fingerprint),
            Err(e) => {
                let (status, reason) = match &e {
                    Error::HostnameMismatch { .. } => {
                        (ConnectionStatus::HostnameMismatch, AuthRejection::HostnameMismatch)
                    }
                    Error::VersionMismatch { .. } => {
                        (ConnectionStatus::VersionMismatch, AuthRejection::VersionMismatch)
                    }
                    Error::AuthenticationFailed { .. } => (
                        ConnectionStatus::AuthenticationError,
                        AuthRejection::AuthenticationError,
                    ),
                    _ => return Err(e),
                };
                warn!(
                    "Refusing satellite {} from {}: {}",
                    request.node_name,
                    session.label(),
                    e
                );
                session.transition(status)?;
                let _ = session.send(ControllerMessage::AuthResponse(AuthResponse::Rejected {
                    reason,
                    message: e.to_string(),
                }));
                // only node records are tracked; a made-up name is not
                match self.known_node(session.remote_addr(), request) {
                    Some(node) => self
                        .reconnect
                        .record(node.as_str(), LossReason::Refused(status.to_string())),
                    None => debug!(
                        "Not awaiting reconnect of unknown satellite {}",
                        request.node_name
                    ),
                }
                session.close();
                Err(e)
            }
        }
    }

    /// The node record the connection is expected to belong to
    fn expected_node<'a>(
        &self,
        nodes: &'a crate::model::NodeMap,
        remote: Option<SocketAddr>,
        declared: &NodeName,
    ) -> Option<&'a ClusterNode> {
        if self.match_peer_address {
            if let Some(addr) = remote {
                let ip = addr.ip();
                let mut by_address = nodes.values().filter(|n| n.has_address(&ip)).peekable();
                if by_address.peek().is_some() {
                    let candidates: Vec<&ClusterNode> = by_address.collect();
                    return candidates
                        .iter()
                        .find(|n| n.name == *declared)
                        .or_else(|| candidates.first())
                        .copied();
                }
            }
        }
        nodes.get(declared)
    }

    /// Node record a refused connection resolved to, if any
    fn known_node(&self, remote: Option<SocketAddr>, request: &AuthRequest) -> Option<NodeName> {
        let guard = self.model.lock(&LockRequest::new().read(LockObj::Nodes));
        let nodes = guard.nodes().ok()?;
        self.expected_node(nodes, remote, &request.node_name)
            .map(|node| node.name.clone())
    }

    fn verify(&self, remote: Option<SocketAddr>, request: &AuthRequest) -> Result<(NodeName, Fingerprint)> {
        let guard = self.model.lock(&LockRequest::new().read(LockObj::Nodes));
        let nodes = guard.nodes()?;

        let node = self
            .expected_node(nodes, remote, &request.node_name)
            .ok_or_else(|| Error::AuthenticationFailed {
                node: request.node_name.to_string(),
                reason: "no such node".into(),
            })?;

        if node.name != request.node_name {
            return Err(Error::HostnameMismatch {
                declared: request.node_name.to_string(),
                expected: node.name.to_string(),
            });
        }
        if node.node_type == NodeType::Controller {
            return Err(Error::AuthenticationFailed {
                node: node.name.to_string(),
                reason: "node does not run a satellite".into(),
            });
        }
        if !request.fingerprint.is_nil() && request.fingerprint != node.fingerprint {
            return Err(Error::AuthenticationFailed {
                node: node.name.to_string(),
                reason: format!(
                    "claimed fingerprint {} does not match {}",
                    request.fingerprint, node.fingerprint
                ),
            });
        }
        if !PROTOCOL_VERSION.is_compatible(&request.version) {
            return Err(Error::VersionMismatch {
                local: PROTOCOL_VERSION.to_string(),
                remote: request.version.to_string(),
            });
        }

        Ok((node.name.clone(), node.fingerprint))
    }

    fn accept(&self, session: &Arc<PeerSession>, node: NodeName, fingerprint: Fingerprint) -> Result<Accepted> {
        let epoch = self.registry.next_epoch(&node);
        session.mark_authenticated(node.clone())?;
        session.send(ControllerMessage::AuthResponse(AuthResponse::Accepted {
            node_fingerprint: fingerprint,
            epoch,
        }))?;

        if let Some(previous) = self.registry.register(session.clone())? {
            if previous.id() != session.id() {
                info!(
                    "Satellite {} reconnected, closing session {}",
                    node,
                    previous.id()
                );
                previous.close();
            }
        }

        info!("Satellite {} authenticated (session {}, epoch {})", node, session.id(), epoch);
        Ok(Accepted {
            node,
            fingerprint,
            epoch,
        })
    }
}
