//! Retry Supervisor
//!
//! Resources whose update could not reach a node wait here and are pushed
//! again on every tick. Registering the same resource twice keeps one entry.

use crate::domain::{NodeName, ResourceName, RetryDeliveryRef};
use crate::metrics::SyncMetrics;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct RetrySupervisor {
    pending: Mutex<BTreeMap<NodeName, BTreeSet<ResourceName>>>,
    interval: Duration,
    metrics: SyncMetrics,
}

impl RetrySupervisor {
    pub fn new(interval: Duration, metrics: SyncMetrics) -> Self {
        Self {
            pending: Mutex::new(BTreeMap::new()),
            interval,
            metrics,
        }
    }

    /// Track a resource for redelivery; false if it was already tracked
    pub fn register(&self, node: &NodeName, resource: &ResourceName) -> bool {
        let mut pending = self.pending.lock();
        let added = pending
            .entry(node.clone())
            .or_default()
            .insert(resource.clone());
        if added {
            debug!("Resource {} on {} registered for retry", resource, node);
        }
        self.update_gauge(&pending);
        added
    }

    /// Stop tracking a resource, typically because it was delivered
    pub fn remove(&self, node: &NodeName, resource: &ResourceName) -> bool {
        let mut pending = self.pending.lock();
        let removed = match pending.get_mut(node) {
            Some(resources) => {
                let removed = resources.remove(resource);
                if resources.is_empty() {
                    pending.remove(node);
                }
                removed
            }
            None => false,
        };
        self.update_gauge(&pending);
        removed
    }

    /// Drop every entry of a node; a full sync delivered all of them
    pub fn forget_node(&self, node: &NodeName) -> usize {
        let mut pending = self.pending.lock();
        let count = pending.remove(node).map_or(0, |r| r.len());
        self.update_gauge(&pending);
        count
    }

    pub fn is_pending(&self, node: &NodeName, resource: &ResourceName) -> bool {
        self.pending
            .lock()
            .get(node)
            .map_or(false, |r| r.contains(resource))
    }

    pub fn pending(&self) -> Vec<(NodeName, ResourceName)> {
        self.pending
            .lock()
            .iter()
            .flat_map(|(node, resources)| resources.iter().map(move |r| (node.clone(), r.clone())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().values().map(|r| r.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    fn update_gauge(&self, pending: &BTreeMap<NodeName, BTreeSet<ResourceName>>) {
        let count: usize = pending.values().map(|r| r.len()).sum();
        self.metrics.retry_pending.set(count as i64);
    }

    /// One redelivery round over a snapshot of the pending entries,
    /// returning how many were delivered
    pub async fn retry_once(&self, delivery: &RetryDeliveryRef) -> usize {
        let mut delivered = 0;
        for (node, resource) in self.pending() {
            match delivery.redeliver(&node, &resource).await {
                Ok(true) => {
                    if self.remove(&node, &resource) {
                        delivered += 1;
                    }
                }
                Ok(false) => {
                    debug!("Resource {} on {} still undeliverable", resource, node);
                }
                Err(e) if e.is_transient() => {
                    debug!("Redelivery of {} to {} failed: {}", resource, node, e);
                }
                Err(e) => {
                    warn!("Dropping {} on {} from retry: {}", resource, node, e);
                    self.remove(&node, &resource);
                }
            }
        }
        delivered
    }

    /// Retry pending deliveries until cancelled
    pub async fn run(&self, delivery: RetryDeliveryRef, token: CancellationToken) {
        info!("Retry supervisor started (interval {:?})", self.interval);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if self.is_empty() {
                        continue;
                    }
                    let delivered = self.retry_once(&delivery).await;
                    if delivered > 0 {
                        info!("Redelivered {} resource update(s)", delivered);
                    }
                }
            }
        }
        info!("Retry supervisor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FlakyDelivery {
        calls: AtomicUsize,
        succeed_after: usize,
    }

    #[async_trait]
    impl crate::domain::RetryDelivery for FlakyDelivery {
        async fn redeliver(&self, node: &NodeName, _resource: &ResourceName) -> Result<bool> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.succeed_after {
                Err(Error::PeerNotConnected {
                    node: node.to_string(),
                })
            } else {
                Ok(true)
            }
        }
    }

    fn supervisor() -> RetrySupervisor {
        RetrySupervisor::new(Duration::from_millis(10), SyncMetrics::new().unwrap())
    }

    #[test]
    fn test_register_deduplicates() {
        let retry = supervisor();
        let node = NodeName::new("node-a");
        let rsc = ResourceName::new("rsc-1");

        assert!(retry.register(&node, &rsc));
        assert!(!retry.register(&node, &rsc));
        assert!(!retry.register(&NodeName::new("NODE-A"), &rsc));
        assert_eq!(retry.len(), 1);
        assert_eq!(retry.metrics.retry_pending.get(), 1);

        assert!(retry.remove(&node, &rsc));
        assert!(retry.is_empty());
        assert_eq!(retry.metrics.retry_pending.get(), 0);
    }

    #[test]
    fn test_forget_node() {
        let retry = supervisor();
        let node = NodeName::new("node-a");
        retry.register(&node, &ResourceName::new("rsc-1"));
        retry.register(&node, &ResourceName::new("rsc-2"));
        retry.register(&NodeName::new("node-b"), &ResourceName::new("rsc-1"));

        assert_eq!(retry.forget_node(&node), 2);
        assert_eq!(retry.pending().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_until_delivered() {
        let retry = supervisor();
        let node = NodeName::new("node-a");
        let rsc = ResourceName::new("rsc-1");
        retry.register(&node, &rsc);

        let delivery: RetryDeliveryRef = Arc::new(FlakyDelivery {
            calls: AtomicUsize::new(0),
            succeed_after: 2,
        });

        assert_eq!(retry.retry_once(&delivery).await, 0);
        assert_eq!(retry.retry_once(&delivery).await, 0);
        assert!(retry.is_pending(&node, &rsc));
        assert_eq!(retry.retry_once(&delivery).await, 1);
        assert!(!retry.is_pending(&node, &rsc));
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let retry = Arc::new(supervisor());
        retry.register(&NodeName::new("node-a"), &ResourceName::new("rsc-1"));
        let delivery: RetryDeliveryRef = Arc::new(FlakyDelivery {
            calls: AtomicUsize::new(0),
            succeed_after: 0,
        });

        let token = CancellationToken::new();
        let task = {
            let retry = retry.clone();
            let token = token.clone();
            tokio::spawn(async move { retry.run(delivery, token).await })
        };

        while !retry.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        token.cancel();
        task.await.unwrap();
    }
}
