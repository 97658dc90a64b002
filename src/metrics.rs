//! Sync Engine Metrics
//!
//! Counters for the sync protocol and the shared pool locks, kept in a
//! registry of their own so that each controller or satellite instance
//! exports just its numbers.

use crate::error::{Error, Result};
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
    let metric = IntCounter::new(name, help)
        .map_err(|e| Error::Internal(format!("metric {}: {}", name, e)))?;
    registry
        .register(Box::new(metric.clone()))
        .map_err(|e| Error::Internal(format!("metric {}: {}", name, e)))?;
    Ok(metric)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge> {
    let metric = IntGauge::new(name, help)
        .map_err(|e| Error::Internal(format!("metric {}: {}", name, e)))?;
    registry
        .register(Box::new(metric.clone()))
        .map_err(|e| Error::Internal(format!("metric {}: {}", name, e)))?;
    Ok(metric)
}

#[derive(Clone)]
pub struct SyncMetrics {
    registry: Registry,
    /// Authenticated peers currently online
    pub peers_online: IntGauge,
    pub full_syncs_sent: IntCounter,
    pub full_syncs_failed: IntCounter,
    pub updates_sent: IntCounter,
    pub updates_applied: IntCounter,
    /// Messages of an outdated epoch that were discarded
    pub stale_dropped: IntCounter,
    pub lock_grants: IntCounter,
    pub lock_queued: IntCounter,
    /// Resources waiting for redelivery
    pub retry_pending: IntGauge,
}

impl std::fmt::Debug for SyncMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncMetrics")
            .field("peers_online", &self.peers_online.get())
            .field("updates_sent", &self.updates_sent.get())
            .field("updates_applied", &self.updates_applied.get())
            .finish()
    }
}

impl SyncMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        Ok(Self {
            peers_online: gauge(&registry, "sync_peers_online", "Satellites currently online")?,
            full_syncs_sent: counter(&registry, "sync_full_syncs_sent_total", "Full syncs sent")?,
            full_syncs_failed: counter(
                &registry,
                "sync_full_syncs_failed_total",
                "Full syncs that failed to install",
            )?,
            updates_sent: counter(
                &registry,
                "sync_updates_sent_total",
                "Incremental updates sent",
            )?,
            updates_applied: counter(
                &registry,
                "sync_updates_applied_total",
                "Incremental updates applied",
            )?,
            stale_dropped: counter(
                &registry,
                "sync_stale_dropped_total",
                "Messages dropped for an outdated epoch",
            )?,
            lock_grants: counter(
                &registry,
                "sync_shared_pool_grants_total",
                "Shared pool lock grants",
            )?,
            lock_queued: counter(
                &registry,
                "sync_shared_pool_queued_total",
                "Shared pool lock requests queued",
            )?,
            retry_pending: gauge(
                &registry,
                "sync_retry_pending",
                "Resources waiting for redelivery",
            )?,
            registry,
        })
    }

    /// Text exposition of every metric in the registry
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::Internal(format!("metrics encoding failed: {}", e)))?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instances_are_independent() {
        let a = SyncMetrics::new().unwrap();
        let b = SyncMetrics::new().unwrap();
        a.updates_sent.inc();
        a.updates_sent.inc();
        assert_eq!(a.updates_sent.get(), 2);
        assert_eq!(b.updates_sent.get(), 0);
    }

    #[test]
    fn test_encode_contains_metric_names() {
        let metrics = SyncMetrics::new().unwrap();
        metrics.lock_queued.inc();
        let (content_type, body) = metrics.encode().unwrap();
        let text = String::from_utf8(body).unwrap();
        assert!(content_type.starts_with("text/plain"));
        assert!(text.contains("sync_shared_pool_queued_total 1"));
        assert!(text.contains("sync_peers_online 0"));
    }
}
