//! Sharded Peer Registry
//!
//! Authenticated sessions indexed by node name across 64 shards, with
//! keep-alive bookkeeping and the per-node epoch counters. Epoch counters
//! outlive sessions so a reconnecting satellite never sees an epoch twice.

use super::events::PeerEvent;
use super::peer::PeerSession;
use crate::domain::NodeName;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

// =============================================================================
// Constants
// =============================================================================

/// Number of shards in the registry
pub const REGISTRY_SHARD_COUNT: usize = 64;

fn shard_index(node: &NodeName) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    node.hash(&mut hasher);
    (hasher.finish() as usize) % REGISTRY_SHARD_COUNT
}

// =============================================================================
// Peer Entry
// =============================================================================

#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub session: Arc<PeerSession>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    /// Cleared when keep-alive expires
    pub alive: bool,
}

impl PeerEntry {
    fn new(session: Arc<PeerSession>) -> Self {
        let now = Utc::now();
        Self {
            session,
            registered_at: now,
            last_heartbeat: now,
            alive: true,
        }
    }
}

// =============================================================================
// Registry Shard
// =============================================================================

#[derive(Debug, Default)]
struct ShardStats {
    peer_count: AtomicU64,
    update_count: AtomicU64,
}

struct RegistryShard {
    peers: RwLock<HashMap<NodeName, PeerEntry>>,
    stats: ShardStats,
}

impl RegistryShard {
    fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            stats: ShardStats::default(),
        }
    }

    /// Insert, returning the session this one replaces
    fn insert(&self, node: NodeName, entry: PeerEntry) -> Option<Arc<PeerSession>> {
        let mut peers = self.peers.write();
        let previous = peers.insert(node, entry).map(|e| e.session);
        if previous.is_none() {
            self.stats.peer_count.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.update_count.fetch_add(1, Ordering::Relaxed);
        previous
    }

    fn get(&self, node: &NodeName) -> Option<PeerEntry> {
        self.peers.read().get(node).cloned()
    }

    /// Remove the entry only while it still belongs to `session_id`
    fn remove(&self, node: &NodeName, session_id: u64) -> Option<PeerEntry> {
        let mut peers = self.peers.write();
        let owned = peers
            .get(node)
            .map(|e| e.session.id() == session_id)
            .unwrap_or(false);
        if !owned {
            return None;
        }
        let removed = peers.remove(node);
        if removed.is_some() {
            self.stats.peer_count.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    fn heartbeat(&self, node: &NodeName) -> Result<()> {
        let mut peers = self.peers.write();
        match peers.get_mut(node) {
            Some(entry) => {
                entry.last_heartbeat = Utc::now();
                entry.alive = true;
                Ok(())
            }
            None => Err(Error::PeerNotConnected {
                node: node.to_string(),
            }),
        }
    }

    fn sessions(&self) -> Vec<Arc<PeerSession>> {
        self.peers.read().values().map(|e| e.session.clone()).collect()
    }

    fn mark_stale(&self, max_heartbeat_age_secs: u64) -> Vec<Arc<PeerSession>> {
        let mut peers = self.peers.write();
        let now = Utc::now();
        let mut stale = Vec::new();

        for entry in peers.values_mut() {
            if entry.alive {
                let age = now.signed_duration_since(entry.last_heartbeat);
                if age.num_seconds() > max_heartbeat_age_secs as i64 {
                    entry.alive = false;
                    stale.push(entry.session.clone());
                }
            }
        }
        stale
    }
}

// =============================================================================
// Global Statistics
// =============================================================================

#[derive(Debug, Default)]
pub struct GlobalStats {
    pub connected_peers: AtomicU64,
    pub registrations: AtomicU64,
    pub deregistrations: AtomicU64,
    pub stale_expirations: AtomicU64,
}

impl GlobalStats {
    pub fn snapshot(&self) -> GlobalStatsSnapshot {
        GlobalStatsSnapshot {
            connected_peers: self.connected_peers.load(Ordering::Relaxed),
            registrations: self.registrations.load(Ordering::Relaxed),
            deregistrations: self.deregistrations.load(Ordering::Relaxed),
            stale_expirations: self.stale_expirations.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalStatsSnapshot {
    pub connected_peers: u64,
    pub registrations: u64,
    pub deregistrations: u64,
    pub stale_expirations: u64,
}

// =============================================================================
// Peer Registry
// =============================================================================

pub struct PeerRegistry {
    shards: Box<[RegistryShard; REGISTRY_SHARD_COUNT]>,
    epochs: Mutex<HashMap<NodeName, u64>>,
    global_stats: GlobalStats,
    event_sender: broadcast::Sender<PeerEvent>,
}

impl PeerRegistry {
    pub fn new() -> Arc<Self> {
        let (event_sender, _) = broadcast::channel(1024);
        Arc::new(Self {
            shards: Box::new(std::array::from_fn(|_| RegistryShard::new())),
            epochs: Mutex::new(HashMap::new()),
            global_stats: GlobalStats::default(),
            event_sender,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.event_sender.subscribe()
    }

    pub(crate) fn emit(&self, event: PeerEvent) {
        let _ = self.event_sender.send(event);
    }

    /// Register an authenticated session, returning the session it replaced
    pub fn register(&self, session: Arc<PeerSession>) -> Result<Option<Arc<PeerSession>>> {
        let node = session.node_name().ok_or_else(|| {
            Error::Implementation(format!(
                "session {} registered before authentication",
                session.id()
            ))
        })?;
        let session_id = session.id();

        let previous = self.shards[shard_index(&node)].insert(node.clone(), PeerEntry::new(session));
        if previous.is_none() {
            self.global_stats.connected_peers.fetch_add(1, Ordering::Relaxed);
        }
        self.global_stats.registrations.fetch_add(1, Ordering::Relaxed);

        self.emit(PeerEvent::PeerRegistered {
            node: node.to_string(),
            session_id,
        });
        Ok(previous)
    }

    /// Remove a node's session unless a newer one already took its place
    pub fn deregister(&self, node: &NodeName, session_id: u64) -> bool {
        if self.shards[shard_index(node)].remove(node, session_id).is_none() {
            return false;
        }
        self.global_stats.connected_peers.fetch_sub(1, Ordering::Relaxed);
        self.global_stats.deregistrations.fetch_add(1, Ordering::Relaxed);
        self.emit(PeerEvent::PeerDeregistered {
            node: node.to_string(),
            session_id,
        });
        true
    }

    pub fn get(&self, node: &NodeName) -> Option<Arc<PeerSession>> {
        self.shards[shard_index(node)].get(node).map(|e| e.session)
    }

    pub fn entry(&self, node: &NodeName) -> Option<PeerEntry> {
        self.shards[shard_index(node)].get(node)
    }

    pub fn contains(&self, node: &NodeName) -> bool {
        self.get(node).is_some()
    }

    pub fn heartbeat(&self, node: &NodeName) -> Result<()> {
        self.shards[shard_index(node)].heartbeat(node)
    }

    pub fn sessions(&self) -> Vec<Arc<PeerSession>> {
        self.shards.iter().flat_map(|s| s.sessions()).collect()
    }

    pub fn online_nodes(&self) -> Vec<NodeName> {
        self.sessions()
            .into_iter()
            .filter(|s| s.is_online())
            .filter_map(|s| s.node_name())
            .collect()
    }

    /// Allocate the next epoch for a node
    pub fn next_epoch(&self, node: &NodeName) -> u64 {
        let mut epochs = self.epochs.lock();
        let epoch = epochs.entry(node.clone()).or_insert(0);
        *epoch += 1;
        *epoch
    }

    pub fn current_epoch(&self, node: &NodeName) -> u64 {
        self.epochs.lock().get(node).copied().unwrap_or(0)
    }

    /// Sessions whose last heartbeat is older than the limit; each is
    /// reported once until its next heartbeat
    pub fn expire_stale(&self, max_heartbeat_age_secs: u64) -> Vec<Arc<PeerSession>> {
        let stale: Vec<_> = self
            .shards
            .iter()
            .flat_map(|s| s.mark_stale(max_heartbeat_age_secs))
            .collect();

        for session in &stale {
            self.global_stats.stale_expirations.fetch_add(1, Ordering::Relaxed);
            self.emit(PeerEvent::PeerWentStale { node: session.label() });
        }
        stale
    }

    pub fn stats(&self) -> GlobalStatsSnapshot {
        self.global_stats.snapshot()
    }

    /// (shard, peers, updates) for non-empty shards
    pub fn shard_stats(&self) -> Vec<(usize, u64, u64)> {
        self.shards
            .iter()
            .enumerate()
            .map(|(idx, shard)| {
                (
                    idx,
                    shard.stats.peer_count.load(Ordering::Relaxed),
                    shard.stats.update_count.load(Ordering::Relaxed),
                )
            })
            .filter(|(_, count, _)| *count > 0)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ConnectionStatus;

    fn session_for(id: u64, node: &str) -> Arc<PeerSession> {
        let (session, _rx) = PeerSession::new(id, None);
        session.transition(ConnectionStatus::Authenticating).unwrap();
        session.mark_authenticated(NodeName::new(node)).unwrap();
        session
    }

    #[test]
    fn test_shard_index_ignores_case() {
        assert_eq!(
            shard_index(&NodeName::new("Node-A")),
            shard_index(&NodeName::new("node-a"))
        );
        assert!(shard_index(&NodeName::new("node-b")) < REGISTRY_SHARD_COUNT);
    }

    #[test]
    fn test_register_and_get() {
        let registry = PeerRegistry::new();
        let mut events = registry.subscribe();

        let previous = registry.register(session_for(1, "node-a")).unwrap();
        assert!(previous.is_none());
        assert!(registry.contains(&NodeName::new("NODE-A")));
        assert_eq!(registry.stats().connected_peers, 1);

        assert_eq!(
            events.try_recv().unwrap(),
            PeerEvent::PeerRegistered {
                node: "node-a".into(),
                session_id: 1
            }
        );
    }

    #[test]
    fn test_unauthenticated_session_rejected() {
        let registry = PeerRegistry::new();
        let (session, _rx) = PeerSession::new(1, None);
        assert!(registry.register(session).is_err());
    }

    #[test]
    fn test_reconnect_replaces_session() {
        let registry = PeerRegistry::new();
        let node = NodeName::new("node-a");

        registry.register(session_for(1, "node-a")).unwrap();
        let replaced = registry.register(session_for(2, "node-a")).unwrap();
        assert_eq!(replaced.map(|s| s.id()), Some(1));
        assert_eq!(registry.stats().connected_peers, 1);

        // teardown of the old session must not remove the new one
        assert!(!registry.deregister(&node, 1));
        assert_eq!(registry.get(&node).map(|s| s.id()), Some(2));

        assert!(registry.deregister(&node, 2));
        assert!(!registry.contains(&node));
        assert_eq!(registry.stats().deregistrations, 1);
    }

    #[test]
    fn test_epochs_survive_sessions() {
        let registry = PeerRegistry::new();
        let node = NodeName::new("node-a");

        assert_eq!(registry.next_epoch(&node), 1);
        registry.register(session_for(1, "node-a")).unwrap();
        assert_eq!(registry.next_epoch(&node), 2);
        registry.deregister(&node, 1);
        assert_eq!(registry.next_epoch(&node), 3);
        assert_eq!(registry.current_epoch(&node), 3);
        assert_eq!(registry.current_epoch(&NodeName::new("node-b")), 0);
    }

    #[test]
    fn test_expire_stale_reports_once() {
        let registry = PeerRegistry::new();
        let node = NodeName::new("node-a");
        registry.register(session_for(1, "node-a")).unwrap();

        {
            let shard = &registry.shards[shard_index(&node)];
            let mut peers = shard.peers.write();
            let entry = peers.get_mut(&node).unwrap();
            entry.last_heartbeat = Utc::now() - chrono::Duration::seconds(120);
        }

        assert_eq!(registry.expire_stale(30).len(), 1);
        assert!(registry.expire_stale(30).is_empty());

        registry.heartbeat(&node).unwrap();
        assert!(registry.entry(&node).unwrap().alive);
        assert_eq!(registry.stats().stale_expirations, 1);
    }
}
