//! Update Monitor
//!
//! The satellite's view of the sync cycle: the current epoch, the awaited
//! sequence number and the link status. The epoch only moves forward.

use crate::error::{Error, Result};
use crate::protocol::FIRST_UPDATE_SEQUENCE;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SatelliteStatus {
    Disconnected,
    Connected,
    Authenticated,
    Online,
    /// The current cycle was abandoned; waiting for a fresh handshake
    SyncFailed,
}

impl SatelliteStatus {
    pub fn can_transition_to(self, next: SatelliteStatus) -> bool {
        use SatelliteStatus::*;
        match (self, next) {
            (a, b) if a == b => true,
            (_, Disconnected) => true,
            (Disconnected, Connected) => true,
            (Connected | SyncFailed | Online, Authenticated) => true,
            (Authenticated, Online) => true,
            (Online | Authenticated, SyncFailed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SatelliteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            SatelliteStatus::Disconnected => "DISCONNECTED",
            SatelliteStatus::Connected => "CONNECTED",
            SatelliteStatus::Authenticated => "AUTHENTICATED",
            SatelliteStatus::Online => "ONLINE",
            SatelliteStatus::SyncFailed => "SYNC_FAILED",
        };
        write!(f, "{}", text)
    }
}

#[derive(Debug)]
struct MonitorState {
    epoch: u64,
    /// `None` until a full sync of the current epoch is installed
    awaited: Option<u64>,
    status: SatelliteStatus,
}

#[derive(Debug)]
pub struct UpdateMonitor {
    state: RwLock<MonitorState>,
}

impl Default for UpdateMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdateMonitor {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MonitorState {
                epoch: 0,
                awaited: None,
                status: SatelliteStatus::Disconnected,
            }),
        }
    }

    fn transition(state: &mut MonitorState, next: SatelliteStatus) -> Result<()> {
        if !state.status.can_transition_to(next) {
            return Err(Error::Implementation(format!(
                "satellite status {} cannot move to {}",
                state.status, next
            )));
        }
        if state.status != next {
            debug!("Satellite status {} -> {}", state.status, next);
        }
        state.status = next;
        Ok(())
    }

    pub fn connected(&self) -> Result<()> {
        Self::transition(&mut self.state.write(), SatelliteStatus::Connected)
    }

    /// Adopt the epoch of an accepted handshake
    pub fn authenticated(&self, epoch: u64) -> Result<()> {
        let mut state = self.state.write();
        Self::transition(&mut state, SatelliteStatus::Authenticated)?;
        if epoch < state.epoch {
            warn!(
                "Controller assigned epoch {} below local epoch {}, adopting it",
                epoch, state.epoch
            );
        }
        state.epoch = epoch;
        state.awaited = None;
        Ok(())
    }

    /// Reject messages of an epoch older than the current one
    pub fn check_epoch(&self, epoch: u64) -> Result<()> {
        let current = self.state.read().epoch;
        if epoch < current {
            return Err(Error::StaleEpoch {
                received: epoch,
                current,
            });
        }
        Ok(())
    }

    /// A full sync of `epoch` was installed: updates are applied from sequence 1
    pub fn full_sync_installed(&self, epoch: u64) -> Result<()> {
        let mut state = self.state.write();
        if epoch < state.epoch {
            return Err(Error::StaleEpoch {
                received: epoch,
                current: state.epoch,
            });
        }
        Self::transition(&mut state, SatelliteStatus::Online)?;
        state.epoch = epoch;
        state.awaited = Some(FIRST_UPDATE_SEQUENCE);
        info!("Satellite online in epoch {}", epoch);
        Ok(())
    }

    /// Abandon the current cycle without telling the controller; anything
    /// still in flight for it becomes stale.
    pub fn advance_silently(&self) -> u64 {
        let mut state = self.state.write();
        state.epoch += 1;
        state.awaited = None;
        if state.status != SatelliteStatus::Disconnected {
            state.status = SatelliteStatus::SyncFailed;
        }
        warn!("Sync cycle abandoned, local epoch advanced to {}", state.epoch);
        state.epoch
    }

    pub fn disconnected(&self) {
        let mut state = self.state.write();
        state.status = SatelliteStatus::Disconnected;
        state.awaited = None;
    }

    pub(crate) fn advance_awaited(&self) {
        if let Some(awaited) = self.state.write().awaited.as_mut() {
            *awaited += 1;
        }
    }

    pub fn status(&self) -> SatelliteStatus {
        self.state.read().status
    }

    pub fn current_epoch(&self) -> u64 {
        self.state.read().epoch
    }

    pub fn awaited(&self) -> Option<u64> {
        self.state.read().awaited
    }

    pub fn is_online(&self) -> bool {
        self.status() == SatelliteStatus::Online
    }
}
