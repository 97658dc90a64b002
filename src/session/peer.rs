//! Peer Session
//!
//! Controller-side state of one satellite connection: its status, the epoch
//! of the current sync cycle and the outbound sequence counter.
//!
//! Sequence numbers are assigned and frames enqueued under the same lock,
//! onto a single ordered writer channel, so the order a satellite receives
//! updates in is the order they were numbered in.

use super::access::AccessContext;
use crate::domain::{CapabilityReport, NodeName};
use crate::error::{Error, Result};
use crate::protocol::{
    Change, ControllerMessage, Frame, FullSyncData, SatelliteMessage, UpdateEnvelope,
    FIRST_UPDATE_SEQUENCE, RESERVED_FULL_SYNC_SEQUENCE,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

// =============================================================================
// Connection Status
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Connecting,
    Authenticating,
    AuthenticationError,
    HostnameMismatch,
    VersionMismatch,
    Authenticated,
    FullSyncPending,
    Online,
    FullSyncFailed,
    Closed,
}

impl ConnectionStatus {
    pub fn can_transition_to(self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Connecting, Authenticating) => true,
            (Authenticating, AuthenticationError | HostnameMismatch | VersionMismatch) => true,
            (Authenticating, Authenticated) => true,
            (Authenticated, FullSyncPending) => true,
            (FullSyncPending, Online | FullSyncFailed) => true,
            // re-sync of an online peer
            (Online, FullSyncPending) => true,
            // a fire-and-forget full sync reported failure later
            (Online, FullSyncFailed) => true,
            _ => false,
        }
    }

    /// Refused or finished; only a new connection can continue
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionStatus::AuthenticationError
                | ConnectionStatus::HostnameMismatch
                | ConnectionStatus::VersionMismatch
                | ConnectionStatus::Closed
        )
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ConnectionStatus::Connecting => "CONNECTING",
            ConnectionStatus::Authenticating => "AUTHENTICATING",
            ConnectionStatus::AuthenticationError => "AUTHENTICATION_ERROR",
            ConnectionStatus::HostnameMismatch => "HOSTNAME_MISMATCH",
            ConnectionStatus::VersionMismatch => "VERSION_MISMATCH",
            ConnectionStatus::Authenticated => "AUTHENTICATED",
            ConnectionStatus::FullSyncPending => "FULL_SYNC_PENDING",
            ConnectionStatus::Online => "ONLINE",
            ConnectionStatus::FullSyncFailed => "FULL_SYNC_FAILED",
            ConnectionStatus::Closed => "CLOSED",
        };
        write!(f, "{}", text)
    }
}

// =============================================================================
// Peer Session
// =============================================================================

struct SessionState {
    status: ConnectionStatus,
    node: Option<NodeName>,
    access: AccessContext,
    capabilities: Option<CapabilityReport>,
    last_seen: DateTime<Utc>,
}

pub struct PeerSession {
    id: u64,
    remote_addr: Option<SocketAddr>,
    state: RwLock<SessionState>,
    authenticated: AtomicBool,
    full_sync_failed: AtomicBool,
    epoch: AtomicU64,
    /// Next incremental sequence number; also the send lock
    sequencer: Mutex<u64>,
    outbound: mpsc::UnboundedSender<Frame<ControllerMessage>>,
    calls: DashMap<u64, oneshot::Sender<SatelliteMessage>>,
    next_call_id: AtomicU64,
    closed: CancellationToken,
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("PeerSession")
            .field("id", &self.id)
            .field("node", &state.node)
            .field("status", &state.status)
            .field("epoch", &self.epoch.load(Ordering::Relaxed))
            .finish()
    }
}

impl PeerSession {
    /// Create a session and the receiving end of its writer channel
    pub fn new(
        id: u64,
        remote_addr: Option<SocketAddr>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Frame<ControllerMessage>>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            id,
            remote_addr,
            state: RwLock::new(SessionState {
                status: ConnectionStatus::Connecting,
                node: None,
                access: AccessContext::anonymous(),
                capabilities: None,
                last_seen: Utc::now(),
            }),
            authenticated: AtomicBool::new(false),
            full_sync_failed: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            sequencer: Mutex::new(FIRST_UPDATE_SEQUENCE),
            outbound,
            calls: DashMap::new(),
            next_call_id: AtomicU64::new(1),
            closed: CancellationToken::new(),
        });
        (session, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.read().status
    }

    pub fn node_name(&self) -> Option<NodeName> {
        self.state.read().node.clone()
    }

    pub fn access(&self) -> AccessContext {
        self.state.read().access.clone()
    }

    pub fn capabilities(&self) -> Option<CapabilityReport> {
        self.state.read().capabilities.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub fn is_online(&self) -> bool {
        self.status() == ConnectionStatus::Online
    }

    pub fn full_sync_failed(&self) -> bool {
        self.full_sync_failed.load(Ordering::Acquire)
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Sequence number the next incremental update will carry
    pub fn next_sequence(&self) -> u64 {
        *self.sequencer.lock()
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        self.state.read().last_seen
    }

    /// Record traffic from the peer
    pub fn touch(&self) {
        self.state.write().last_seen = Utc::now();
    }

    /// Node name, or the remote address before authentication
    pub fn label(&self) -> String {
        match (self.node_name(), self.remote_addr) {
            (Some(node), _) => node.to_string(),
            (None, Some(addr)) => addr.to_string(),
            (None, None) => format!("session-{}", self.id),
        }
    }

    /// Move to `next`, rejecting transitions the state machine does not allow
    pub fn transition(&self, next: ConnectionStatus) -> Result<()> {
        let mut state = self.state.write();
        if state.status == next {
            return Ok(());
        }
        if !state.status.can_transition_to(next) {
            return Err(Error::Implementation(format!(
                "session {} cannot move from {} to {}",
                self.id, state.status, next
            )));
        }
        trace!("Session {}: {} -> {}", self.id, state.status, next);
        state.status = next;
        Ok(())
    }

    /// Bind the session to the node it authenticated as
    pub fn mark_authenticated(&self, node: NodeName) -> Result<()> {
        self.transition(ConnectionStatus::Authenticated)?;
        let mut state = self.state.write();
        state.access = AccessContext::peer(node.clone());
        state.node = Some(node);
        self.authenticated.store(true, Ordering::Release);
        Ok(())
    }

    /// Record the outcome of the full sync of the current epoch
    pub fn complete_full_sync(&self, report: Option<CapabilityReport>) -> Result<()> {
        self.transition(ConnectionStatus::Online)?;
        self.full_sync_failed.store(false, Ordering::Release);
        if report.is_some() {
            self.state.write().capabilities = report;
        }
        Ok(())
    }

    pub fn fail_full_sync(&self) -> Result<()> {
        self.full_sync_failed.store(true, Ordering::Release);
        self.transition(ConnectionStatus::FullSyncFailed)
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    fn push(&self, frame: Frame<ControllerMessage>) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::PeerNotConnected { node: self.label() });
        }
        self.outbound.send(frame).map_err(|_| Error::SendFailed {
            node: self.label(),
            reason: "writer closed".into(),
        })
    }

    /// Fire-and-forget message outside the sequenced update stream
    pub fn send(&self, message: ControllerMessage) -> Result<()> {
        self.push(Frame::oneway(message))
    }

    /// Answer a call made by the peer
    pub fn respond(&self, call_id: u64, message: ControllerMessage) -> Result<()> {
        self.push(Frame::response(call_id, message))
    }

    /// Number and enqueue one incremental update, returning its sequence
    pub fn send_update(&self, change: Change) -> Result<u64> {
        if !self.is_authenticated() {
            return Err(Error::PeerNotConnected { node: self.label() });
        }
        let mut next = self.sequencer.lock();
        let sequence = *next;
        let envelope = UpdateEnvelope {
            epoch: self.epoch(),
            sequence,
            change,
        };
        self.push(Frame::oneway(ControllerMessage::Update(envelope)))?;
        *next += 1;
        Ok(sequence)
    }

    /// Start a new sync cycle: adopt `epoch`, restart the sequence and
    /// enqueue the full sync ahead of any later update.
    ///
    /// With `as_call` the returned call id and receiver yield the
    /// satellite's answer.
    pub fn send_full_sync(
        &self,
        mut data: FullSyncData,
        as_call: bool,
    ) -> Result<Option<(u64, oneshot::Receiver<SatelliteMessage>)>> {
        let mut next = self.sequencer.lock();
        self.transition(ConnectionStatus::FullSyncPending)?;
        self.epoch.store(data.epoch, Ordering::Release);
        self.full_sync_failed.store(false, Ordering::Release);
        *next = FIRST_UPDATE_SEQUENCE;

        data.sequence = RESERVED_FULL_SYNC_SEQUENCE;
        let message = ControllerMessage::FullSync(Box::new(data));
        if as_call {
            let (call_id, rx) = self.register_call();
            if let Err(e) = self.push(Frame::call(call_id, message)) {
                self.calls.remove(&call_id);
                return Err(e);
            }
            Ok(Some((call_id, rx)))
        } else {
            self.push(Frame::oneway(message))?;
            Ok(None)
        }
    }

    fn register_call(&self) -> (u64, oneshot::Receiver<SatelliteMessage>) {
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.calls.insert(call_id, tx);
        (call_id, rx)
    }

    /// Send a call and wait for the peer's answer
    pub async fn call(
        &self,
        message: ControllerMessage,
        timeout: Duration,
    ) -> Result<SatelliteMessage> {
        let (call_id, rx) = self.register_call();
        if let Err(e) = self.push(Frame::call(call_id, message)) {
            self.calls.remove(&call_id);
            return Err(e);
        }
        self.await_answer(call_id, rx, timeout).await
    }

    /// Wait for the answer to a call registered earlier
    pub async fn await_answer(
        &self,
        call_id: u64,
        rx: oneshot::Receiver<SatelliteMessage>,
        timeout: Duration,
    ) -> Result<SatelliteMessage> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(answer)) => Ok(answer),
            Ok(Err(_)) => Err(Error::PeerNotConnected { node: self.label() }),
            Err(_) => {
                self.calls.remove(&call_id);
                Err(Error::CallTimeout {
                    node: self.label(),
                    after: timeout,
                })
            }
        }
    }

    /// Route a response frame to its waiting caller
    pub fn complete_call(&self, call_id: u64, answer: SatelliteMessage) -> bool {
        match self.calls.remove(&call_id) {
            Some((_, tx)) => tx.send(answer).is_ok(),
            None => {
                debug!("Session {}: response to unknown call {}", self.id, call_id);
                false
            }
        }
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Token cancelled when the session closes
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Close the session; waiting calls fail with `PeerNotConnected`
    pub fn close(&self) {
        {
            let mut state = self.state.write();
            // refusal statuses stay visible after close
            if !state.status.is_terminal() {
                state.status = ConnectionStatus::Closed;
            }
        }
        self.authenticated.store(false, Ordering::Release);
        self.calls.clear();
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ClusterNode, NodeType};
    use assert_matches::assert_matches;

    fn authenticated_session() -> (Arc<PeerSession>, mpsc::UnboundedReceiver<Frame<ControllerMessage>>) {
        let (session, rx) = PeerSession::new(1, None);
        session.transition(ConnectionStatus::Authenticating).unwrap();
        session.mark_authenticated(NodeName::new("node-a")).unwrap();
        (session, rx)
    }

    #[test]
    fn test_status_transitions() {
        use ConnectionStatus::*;
        assert!(Connecting.can_transition_to(Authenticating));
        assert!(Authenticating.can_transition_to(VersionMismatch));
        assert!(FullSyncPending.can_transition_to(Online));
        assert!(Online.can_transition_to(FullSyncPending));
        assert!(Online.can_transition_to(Closed));

        assert!(!Connecting.can_transition_to(Online));
        assert!(!Authenticating.can_transition_to(FullSyncPending));
        assert!(!VersionMismatch.can_transition_to(Authenticated));
        assert!(!Closed.can_transition_to(Connecting));
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let (session, _rx) = PeerSession::new(1, None);
        assert_matches!(
            session.transition(ConnectionStatus::Online),
            Err(Error::Implementation(_))
        );
        assert_eq!(session.status(), ConnectionStatus::Connecting);
    }

    #[test]
    fn test_updates_require_authentication() {
        let (session, _rx) = PeerSession::new(1, None);
        let change = Change::ApplyNode(ClusterNode::new("node-a", NodeType::Satellite));
        assert_matches!(
            session.send_update(change),
            Err(Error::PeerNotConnected { .. })
        );
    }

    #[test]
    fn test_full_sync_restarts_sequence() {
        let (session, mut rx) = authenticated_session();

        let data = FullSyncData {
            epoch: 4,
            ..Default::default()
        };
        session.send_full_sync(data, false).unwrap();
        assert_eq!(session.epoch(), 4);
        assert_eq!(session.status(), ConnectionStatus::FullSyncPending);

        let first = session
            .send_update(Change::DeleteNode {
                name: NodeName::new("node-b"),
            })
            .unwrap();
        let second = session
            .send_update(Change::DeleteNode {
                name: NodeName::new("node-c"),
            })
            .unwrap();
        assert_eq!((first, second), (1, 2));

        let frame = rx.try_recv().unwrap();
        assert_matches!(frame.message, ControllerMessage::FullSync(ref data) if data.sequence == RESERVED_FULL_SYNC_SEQUENCE);
        let frame = rx.try_recv().unwrap();
        assert_matches!(frame.message, ControllerMessage::Update(ref u) if u.epoch == 4 && u.sequence == 1);
        let frame = rx.try_recv().unwrap();
        assert_matches!(frame.message, ControllerMessage::Update(ref u) if u.sequence == 2);
    }

    #[tokio::test]
    async fn test_call_completed_by_response() {
        let (session, mut rx) = authenticated_session();

        let caller = {
            let session = session.clone();
            tokio::spawn(async move {
                session
                    .call(ControllerMessage::Ping, Duration::from_secs(5))
                    .await
            })
        };

        let frame = rx.recv().await.unwrap();
        let call_id = frame.call_id().unwrap();
        assert!(session.complete_call(call_id, SatelliteMessage::Pong));

        let answer = caller.await.unwrap().unwrap();
        assert_eq!(answer, SatelliteMessage::Pong);
    }

    #[tokio::test]
    async fn test_call_times_out() {
        let (session, _rx) = authenticated_session();
        let result = session
            .call(ControllerMessage::Ping, Duration::from_millis(20))
            .await;
        assert_matches!(result, Err(Error::CallTimeout { .. }));
    }

    #[tokio::test]
    async fn test_close_fails_pending_calls() {
        let (session, _rx) = authenticated_session();

        let caller = {
            let session = session.clone();
            tokio::spawn(async move {
                session
                    .call(ControllerMessage::Ping, Duration::from_secs(5))
                    .await
            })
        };
        tokio::task::yield_now().await;
        while session.calls.is_empty() {
            tokio::task::yield_now().await;
        }
        session.close();

        assert_matches!(caller.await.unwrap(), Err(Error::PeerNotConnected { .. }));
        assert_eq!(session.status(), ConnectionStatus::Closed);
        assert!(session.send(ControllerMessage::Ping).is_err());
    }
}
