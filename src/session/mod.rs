//! Peer sessions and the registry of authenticated satellites

pub mod access;
pub mod events;
pub mod peer;
pub mod registry;

pub use access::{AccessContext, AccessSubject};
pub use events::PeerEvent;
pub use peer::{ConnectionStatus, PeerSession};
pub use registry::{GlobalStatsSnapshot, PeerEntry, PeerRegistry, REGISTRY_SHARD_COUNT};
