//! Update Applier
//!
//! Incremental updates can arrive while an earlier one is still missing.
//! Each is buffered by sequence number and applied only once every lower
//! number of the epoch has been applied.
//!
//! Lock order: the pending buffer, then the model locks.

use super::changes::{lock_request, ApplyChange, ApplyEffects};
use super::update_monitor::UpdateMonitor;
use crate::domain::{LifecycleControlRef, NodeName};
use crate::error::{Error, Result};
use crate::metrics::SyncMetrics;
use crate::model::CoreModel;
use crate::protocol::RESERVED_FULL_SYNC_SEQUENCE;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

type Pending = BTreeMap<u64, Box<dyn ApplyChange>>;

pub struct UpdateApplier {
    local_node: NodeName,
    model: Arc<CoreModel>,
    monitor: Arc<UpdateMonitor>,
    lifecycle: LifecycleControlRef,
    metrics: SyncMetrics,
    pending: Mutex<Pending>,
}

impl UpdateApplier {
    pub fn new(
        local_node: NodeName,
        model: Arc<CoreModel>,
        monitor: Arc<UpdateMonitor>,
        lifecycle: LifecycleControlRef,
        metrics: SyncMetrics,
    ) -> Self {
        Self {
            local_node,
            model,
            monitor,
            lifecycle,
            metrics,
            pending: Mutex::new(BTreeMap::new()),
        }
    }

    /// Buffer one update and apply everything that has become contiguous.
    ///
    /// Updates of an older epoch are dropped. A sequence number seen twice
    /// in one epoch requests process shutdown and fails with
    /// [`Error::DuplicateSequence`]; any other apply error abandons the cycle.
    pub fn submit(&self, change: Box<dyn ApplyChange>) -> Result<ApplyEffects> {
        let (epoch, sequence) = (change.epoch(), change.sequence());
        let mut pending = self.pending.lock();

        if let Err(e) = self.monitor.check_epoch(epoch) {
            debug!("Dropping {} update {}: {}", change.kind(), sequence, e);
            self.metrics.stale_dropped.inc();
            return Ok(ApplyEffects::default());
        }
        let current = self.monitor.current_epoch();
        if epoch > current {
            return Err(Error::InvalidPayload(format!(
                "update {} of epoch {} ahead of current epoch {}",
                sequence, epoch, current
            )));
        }

        let already_applied = self.monitor.awaited().map_or(false, |awaited| sequence < awaited);
        if sequence == RESERVED_FULL_SYNC_SEQUENCE
            || already_applied
            || pending.contains_key(&sequence)
        {
            let err = Error::DuplicateSequence { epoch, sequence };
            error!("{} update: {}", change.kind(), err);
            self.lifecycle.request_shutdown(&err.to_string());
            return Err(err);
        }

        trace!("Buffering {} update {} of epoch {}", change.kind(), sequence, epoch);
        pending.insert(sequence, change);
        self.drain(&mut pending)
    }

    /// Start applying after a full sync of `epoch`; updates of that epoch
    /// that arrived early are applied now
    pub fn go_online(&self, epoch: u64) -> Result<ApplyEffects> {
        let mut pending = self.pending.lock();
        pending.retain(|_, change| change.epoch() == epoch);
        self.monitor.full_sync_installed(epoch)?;
        self.drain(&mut pending)
    }

    fn drain(&self, pending: &mut Pending) -> Result<ApplyEffects> {
        let mut effects = ApplyEffects::default();
        while let Some(awaited) = self.monitor.awaited() {
            let Some(change) = pending.remove(&awaited) else {
                break;
            };
            let kind = change.kind();
            let result = {
                let mut guard = self.model.lock(&lock_request(change.as_ref()));
                change.apply(&mut guard, &self.local_node, &mut effects)
            };
            if let Err(e) = result {
                error!("Applying {} update {} failed: {}", kind, awaited, e);
                self.fail_cycle(pending, &e);
                return Err(e);
            }
            trace!("Applied {} update {}", kind, awaited);
            self.monitor.advance_awaited();
            self.metrics.updates_applied.inc();
        }
        if !pending.is_empty() {
            debug!("{} updates waiting for a missing sequence", pending.len());
        }
        Ok(effects)
    }

    fn fail_cycle(&self, pending: &mut Pending, cause: &Error) {
        let epoch = self.monitor.advance_silently();
        pending.clear();
        warn!("Waiting for a new handshake in epoch {} or later", epoch);
        self.lifecycle.drop_controller_connection(&cause.to_string());
    }

    /// Abandon the current cycle from outside an apply
    pub fn abandon(&self, cause: &Error) {
        let mut pending = self.pending.lock();
        self.fail_cycle(&mut pending, cause);
    }

    /// Drop every buffered update
    pub fn clear(&self) {
        self.pending.lock().clear();
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ClusterNode, LifecycleControl, NodeType};
    use crate::model::LockRequest;
    use crate::protocol::{Change, UpdateEnvelope};
    use crate::satellite::changes::from_envelope;
    use assert_matches::assert_matches;

    #[derive(Default)]
    struct RecordingLifecycle {
        shutdowns: Mutex<Vec<String>>,
        drops: Mutex<Vec<String>>,
    }

    impl LifecycleControl for RecordingLifecycle {
        fn request_shutdown(&self, reason: &str) {
            self.shutdowns.lock().push(reason.to_string());
        }

        fn drop_controller_connection(&self, reason: &str) {
            self.drops.lock().push(reason.to_string());
        }
    }

    struct Fixture {
        model: Arc<CoreModel>,
        monitor: Arc<UpdateMonitor>,
        lifecycle: Arc<RecordingLifecycle>,
        metrics: SyncMetrics,
        applier: UpdateApplier,
    }

    fn fixture(epoch: u64) -> Fixture {
        let model = Arc::new(CoreModel::new());
        let monitor = Arc::new(UpdateMonitor::new());
        let lifecycle = Arc::new(RecordingLifecycle::default());
        let metrics = SyncMetrics::new().unwrap();
        let applier = UpdateApplier::new(
            NodeName::new("node-a"),
            model.clone(),
            monitor.clone(),
            lifecycle.clone(),
            metrics.clone(),
        );
        monitor.connected().unwrap();
        monitor.authenticated(epoch).unwrap();
        Fixture {
            model,
            monitor,
            lifecycle,
            metrics,
            applier,
        }
    }

    fn node_update(epoch: u64, sequence: u64, name: &str) -> Box<dyn ApplyChange> {
        from_envelope(UpdateEnvelope {
            epoch,
            sequence,
            change: Change::ApplyNode(ClusterNode::new(name, NodeType::Satellite)),
        })
    }

    fn node_names(model: &CoreModel) -> Vec<String> {
        let guard = model.lock(&LockRequest::shared());
        guard.nodes().unwrap().keys().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_any_arrival_order_applies_in_sequence() {
        let orders: [[u64; 4]; 4] = [[1, 2, 3, 4], [4, 3, 2, 1], [2, 4, 1, 3], [3, 1, 4, 2]];
        for order in orders {
            let fx = fixture(1);
            fx.applier.go_online(1).unwrap();
            for seq in order {
                fx.applier.submit(node_update(1, seq, &format!("node-{}", seq))).unwrap();
            }
            assert_eq!(fx.monitor.awaited(), Some(5), "order {:?}", order);
            assert_eq!(fx.applier.pending_len(), 0);
            assert_eq!(node_names(&fx.model).len(), 4);
            assert_eq!(fx.metrics.updates_applied.get(), 4);
        }
    }

    #[test]
    fn test_gap_holds_later_updates() {
        let fx = fixture(1);
        fx.applier.go_online(1).unwrap();
        fx.applier.submit(node_update(1, 2, "node-2")).unwrap();
        fx.applier.submit(node_update(1, 3, "node-3")).unwrap();
        assert!(node_names(&fx.model).is_empty());
        assert_eq!(fx.applier.pending_len(), 2);

        let effects = fx.applier.submit(node_update(1, 1, "node-1")).unwrap();
        assert_eq!(effects.nodes.len(), 3);
        assert_eq!(node_names(&fx.model), vec!["node-1", "node-2", "node-3"]);
    }

    #[test]
    fn test_duplicate_sequence_is_fatal() {
        let fx = fixture(1);
        fx.applier.go_online(1).unwrap();
        fx.applier.submit(node_update(1, 1, "node-1")).unwrap();

        // already applied
        assert_matches!(
            fx.applier.submit(node_update(1, 1, "node-x")),
            Err(Error::DuplicateSequence { epoch: 1, sequence: 1 })
        );

        // still buffered
        fx.applier.submit(node_update(1, 3, "node-3")).unwrap();
        assert_matches!(
            fx.applier.submit(node_update(1, 3, "node-y")),
            Err(Error::DuplicateSequence { sequence: 3, .. })
        );
        assert_eq!(fx.lifecycle.shutdowns.lock().len(), 2);
        assert_eq!(node_names(&fx.model), vec!["node-1"]);
    }

    #[test]
    fn test_reserved_sequence_is_a_duplicate() {
        let fx = fixture(1);
        fx.applier.go_online(1).unwrap();
        assert_matches!(
            fx.applier.submit(node_update(1, 0, "node-0")),
            Err(Error::DuplicateSequence { sequence: 0, .. })
        );
    }

    #[test]
    fn test_stale_epoch_is_dropped() {
        let fx = fixture(5);
        fx.applier.go_online(5).unwrap();
        let effects = fx.applier.submit(node_update(4, 1, "node-old")).unwrap();
        assert!(effects.is_empty());
        assert_eq!(fx.metrics.stale_dropped.get(), 1);
        assert_eq!(fx.monitor.awaited(), Some(1));
        assert!(fx.lifecycle.shutdowns.lock().is_empty());
    }

    #[test]
    fn test_future_epoch_is_invalid() {
        let fx = fixture(2);
        fx.applier.go_online(2).unwrap();
        assert_matches!(
            fx.applier.submit(node_update(3, 1, "node-1")),
            Err(Error::InvalidPayload(_))
        );
    }

    #[test]
    fn test_updates_before_full_sync_are_buffered() {
        let fx = fixture(1);
        fx.applier.submit(node_update(1, 2, "node-2")).unwrap();
        fx.applier.submit(node_update(1, 1, "node-1")).unwrap();
        assert!(node_names(&fx.model).is_empty());

        let effects = fx.applier.go_online(1).unwrap();
        assert_eq!(effects.nodes.len(), 2);
        assert_eq!(fx.monitor.awaited(), Some(3));
    }

    #[test]
    fn test_apply_error_abandons_cycle() {
        let fx = fixture(1);
        fx.applier.go_online(1).unwrap();
        let node = ClusterNode::new("node-1", NodeType::Satellite);
        let impostor = ClusterNode::new("node-1", NodeType::Satellite);
        fx.applier
            .submit(from_envelope(UpdateEnvelope {
                epoch: 1,
                sequence: 1,
                change: Change::ApplyNode(node),
            }))
            .unwrap();
        fx.applier.submit(node_update(1, 3, "node-3")).unwrap();

        let result = fx.applier.submit(from_envelope(UpdateEnvelope {
            epoch: 1,
            sequence: 2,
            change: Change::ApplyNode(impostor),
        }));
        assert_matches!(result, Err(Error::FingerprintMismatch { .. }));
        assert_eq!(fx.monitor.current_epoch(), 2);
        assert_eq!(fx.applier.pending_len(), 0);
        assert_eq!(fx.lifecycle.drops.lock().len(), 1);

        // the rest of the abandoned cycle is stale
        fx.applier.submit(node_update(1, 4, "node-4")).unwrap();
        assert_eq!(fx.metrics.stale_dropped.get(), 1);
    }
}
