//! Benchmarks for the shared pool lock manager and the satellite reorder
//! buffer
//!
//! Target: 100K uncontended acquire/release pairs/sec

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use std::collections::BTreeSet;
use std::sync::Arc;
use storage_control_sync::controller::{LockRequester, SharedPoolLockManager};
use storage_control_sync::domain::{ClusterNode, NodeName, NodeType, SharedPoolId};
use storage_control_sync::protocol::{Change, UpdateEnvelope};
use storage_control_sync::satellite::{from_envelope, UpdateApplier, UpdateMonitor};
use storage_control_sync::{CoreModel, ProcessLifecycle, SyncMetrics};

fn pools(ids: &[&str]) -> BTreeSet<SharedPoolId> {
    ids.iter().map(|id| SharedPoolId::new(*id)).collect()
}

fn bench_uncontended(c: &mut Criterion) {
    let mut group = c.benchmark_group("shared_pool_lock");
    group.throughput(Throughput::Elements(1));

    let manager = SharedPoolLockManager::new();
    let node = NodeName::new("node-a");
    let required = pools(&["lvm-shared-1", "lvm-shared-2"]);
    let held: Vec<SharedPoolId> = required.iter().cloned().collect();

    group.bench_function("acquire_release", |b| {
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            let requester = LockRequester::new(node.clone(), format!("rsc-{}", counter % 64));
            let granted = manager.acquire(requester, black_box(&required));
            debug_assert_eq!(granted.len(), 1);
            let _ = manager.release(&node, &held);
        });
    });

    group.finish();
}

fn bench_contended_handover(c: &mut Criterion) {
    let mut group = c.benchmark_group("shared_pool_lock");
    group.throughput(Throughput::Elements(100));

    let required = pools(&["lvm-shared-1"]);
    let held: Vec<SharedPoolId> = required.iter().cloned().collect();

    // 100 nodes queue on one identity, then the lock is handed down the queue
    group.bench_function("handover_100_nodes", |b| {
        b.iter_batched(
            || {
                let manager = SharedPoolLockManager::new();
                for i in 0..100 {
                    let requester = LockRequester::new(format!("node-{:03}", i), "rsc-1");
                    let _ = manager.acquire(requester, &required);
                }
                manager
            },
            |manager| {
                for i in 0..100 {
                    let node = NodeName::new(format!("node-{:03}", i));
                    let granted = manager.release(&node, &held).unwrap_or_default();
                    black_box(granted);
                }
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

fn bench_out_of_order_apply(c: &mut Criterion) {
    let mut group = c.benchmark_group("update_applier");
    group.throughput(Throughput::Elements(256));

    // updates arrive in reverse order; the last one submitted releases all
    group.bench_function("reverse_order_256_updates", |b| {
        b.iter_batched(
            || {
                let monitor = Arc::new(UpdateMonitor::new());
                monitor.connected().unwrap();
                monitor.authenticated(1).unwrap();
                let applier = UpdateApplier::new(
                    NodeName::new("node-a"),
                    Arc::new(CoreModel::new()),
                    monitor,
                    Arc::new(ProcessLifecycle::new()),
                    SyncMetrics::new().unwrap(),
                );
                applier.go_online(1).unwrap();
                let changes: Vec<_> = (1..=256u64)
                    .rev()
                    .map(|sequence| {
                        from_envelope(UpdateEnvelope {
                            epoch: 1,
                            sequence,
                            change: Change::ApplyNode(ClusterNode::new(
                                format!("node-{:03}", sequence),
                                NodeType::Satellite,
                            )),
                        })
                    })
                    .collect();
                (applier, changes)
            },
            |(applier, changes)| {
                for change in changes {
                    black_box(applier.submit(change).unwrap());
                }
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_uncontended,
    bench_contended_handover,
    bench_out_of_order_apply
);
criterion_main!(benches);
