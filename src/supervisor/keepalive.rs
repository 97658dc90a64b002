//! Keep-Alive
//!
//! Pings every authenticated peer and closes those whose pong is overdue.
//! Closing cancels the session's connection task, which deregisters it.

use crate::protocol::ControllerMessage;
use crate::session::{PeerRegistry, PeerSession};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct KeepAlive {
    registry: Arc<PeerRegistry>,
    interval: Duration,
    timeout_secs: u64,
}

impl KeepAlive {
    pub fn new(registry: Arc<PeerRegistry>, interval: Duration, timeout_secs: u64) -> Self {
        Self {
            registry,
            interval,
            timeout_secs,
        }
    }

    /// Ping live peers and close the stale ones, returning what was closed
    pub fn tick(&self) -> Vec<Arc<PeerSession>> {
        for session in self.registry.sessions() {
            if !session.is_authenticated() {
                continue;
            }
            if let Err(e) = session.send(ControllerMessage::Ping) {
                debug!("Ping to {} failed: {}", session.label(), e);
            }
        }

        let stale = self.registry.expire_stale(self.timeout_secs);
        for session in &stale {
            warn!(
                "Peer {} missed keep-alive for {}s, closing session {}",
                session.label(),
                self.timeout_secs,
                session.id()
            );
            session.close();
        }
        stale
    }

    pub async fn run(&self, token: CancellationToken) {
        info!(
            "Keep-alive started (interval {:?}, timeout {}s)",
            self.interval, self.timeout_secs
        );
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick();
                }
            }
        }
        info!("Keep-alive stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NodeName;
    use crate::session::ConnectionStatus;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_tick_pings_and_expires() {
        let registry = PeerRegistry::new();
        let (session, mut rx) = PeerSession::new(1, None);
        session.transition(ConnectionStatus::Authenticating).unwrap();
        session.mark_authenticated(NodeName::new("node-a")).unwrap();
        registry.register(session.clone()).unwrap();

        let keepalive = KeepAlive::new(registry.clone(), Duration::from_secs(1), 60);
        assert!(keepalive.tick().is_empty());
        let frame = rx.try_recv().unwrap();
        assert_matches!(frame.message, ControllerMessage::Ping);

        // a zero timeout makes any heartbeat older than a second stale
        tokio::time::sleep(Duration::from_millis(1100)).await;
        let strict = KeepAlive::new(registry.clone(), Duration::from_secs(1), 0);
        let closed = strict.tick();
        assert_eq!(closed.len(), 1);
        assert!(session.is_closed());
    }
}
