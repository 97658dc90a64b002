//! Peer Registry Events
//!
//! Emitted by the peer registry so supervisors can react to peers coming
//! and going.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerEvent {
    /// A satellite authenticated and was registered
    PeerRegistered { node: String, session_id: u64 },

    /// A satellite's session was removed
    PeerDeregistered { node: String, session_id: u64 },

    /// A satellite installed its full sync
    PeerOnline { node: String },

    /// A satellite missed its keep-alive deadline
    PeerWentStale { node: String },

    /// A satellite could not install its full sync
    FullSyncFailed { node: String },
}

impl PeerEvent {
    pub fn node(&self) -> &str {
        match self {
            PeerEvent::PeerRegistered { node, .. }
            | PeerEvent::PeerDeregistered { node, .. }
            | PeerEvent::PeerOnline { node }
            | PeerEvent::PeerWentStale { node }
            | PeerEvent::FullSyncFailed { node } => node,
        }
    }

    /// Whether the peer is gone and needs to come back
    pub fn is_loss(&self) -> bool {
        matches!(
            self,
            PeerEvent::PeerDeregistered { .. } | PeerEvent::PeerWentStale { .. }
        )
    }
}

impl std::fmt::Display for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerEvent::PeerRegistered { node, session_id } => {
                write!(f, "peer {} registered (session {})", node, session_id)
            }
            PeerEvent::PeerDeregistered { node, session_id } => {
                write!(f, "peer {} deregistered (session {})", node, session_id)
            }
            PeerEvent::PeerOnline { node } => write!(f, "peer {} online", node),
            PeerEvent::PeerWentStale { node } => write!(f, "peer {} stale", node),
            PeerEvent::FullSyncFailed { node } => write!(f, "peer {} full sync failed", node),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loss_events() {
        let gone = PeerEvent::PeerWentStale {
            node: "node-a".into(),
        };
        assert!(gone.is_loss());
        assert_eq!(gone.node(), "node-a");

        let online = PeerEvent::PeerOnline {
            node: "node-a".into(),
        };
        assert!(!online.is_loss());
    }
}
