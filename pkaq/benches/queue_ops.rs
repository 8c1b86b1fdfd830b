//! Benchmarks for admission queue operations and log rendering.
//!
//! - Single enqueue
//! - Head checks against queues of growing depth
//! - Enqueue, renew and release for one entry
//! - Expired-entry sweeps
//! - Progress log collapsing

#![allow(missing_docs)]

use chrono::Duration;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pkaq::{
    collapse_progress_lines, AdmissionQueue, InMemoryAdmissionQueue, JobToken, LeaseExpiryScanner,
    LeaseRenewal,
};
use tokio::runtime::Runtime;

fn create_runtime() -> Runtime {
    Runtime::new().expect("Failed to create tokio runtime")
}

fn ttl() -> Duration {
    Duration::seconds(60)
}

fn bench_enqueue_single(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("enqueue_single");
    group.sample_size(100);

    group.bench_function("in_memory", |b| {
        let queue = InMemoryAdmissionQueue::new();
        let token = JobToken::new("bench-token");

        b.to_async(&rt).iter(|| async {
            queue
                .enqueue(&token, "bench-worker", ttl())
                .await
                .expect("enqueue should succeed");
        });
    });

    group.finish();
}

/// Every waiter polls the head; this is the hot path under contention.
fn bench_peek_head_by_depth(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("peek_head");
    for depth in [1usize, 100, 1000] {
        let queue = InMemoryAdmissionQueue::new();
        rt.block_on(async {
            for i in 0..depth {
                queue
                    .enqueue(&JobToken::new(format!("t{i}")), "w", ttl())
                    .await
                    .expect("enqueue should succeed");
            }
        });

        group.bench_with_input(BenchmarkId::new("in_memory", depth), &depth, |b, _| {
            b.to_async(&rt).iter(|| async {
                queue.peek_head().await.expect("peek should succeed");
            });
        });
    }
    group.finish();
}

fn bench_entry_lifecycle(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("entry_lifecycle");
    group.bench_function("enqueue_renew_release", |b| {
        let queue = InMemoryAdmissionQueue::new();
        let token = JobToken::new("lifecycle");

        b.to_async(&rt).iter(|| async {
            let entry = queue
                .enqueue(&token, "w", ttl())
                .await
                .expect("enqueue should succeed");
            queue
                .renew(LeaseRenewal {
                    lease_id: entry.lease_id,
                    holder: "w".to_string(),
                    ttl: ttl(),
                })
                .await
                .expect("renew should succeed");
            queue
                .release(entry.lease_id)
                .await
                .expect("release should succeed");
        });
    });
    group.finish();
}

fn bench_evict_expired(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("evict_expired");
    for size in [10usize, 100, 500] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("half_expired", size), &size, |b, &size| {
            b.to_async(&rt).iter(|| async move {
                let queue = InMemoryAdmissionQueue::new();
                for i in 0..size {
                    let lease = if i % 2 == 0 { Duration::zero() } else { ttl() };
                    queue
                        .enqueue(&JobToken::new(format!("t{i}")), "w", lease)
                        .await
                        .expect("enqueue should succeed");
                }
                queue.evict_expired().await.expect("evict should succeed");
            });
        });
    }
    group.finish();
}

fn bench_collapse_log(c: &mut Criterion) {
    let prefixes = vec!["PB Runs".to_string(), "MC Run".to_string()];
    let mut log = String::from("Reading structure\n");
    for i in 0..2000 {
        log.push_str(&format!("PB Runs: {i}/2000\n"));
    }
    for i in 0..5000 {
        log.push_str(&format!("MC Run {i}\n"));
    }
    log.push_str("Done\n");

    let mut group = c.benchmark_group("collapse_progress_lines");
    group.throughput(Throughput::Bytes(log.len() as u64));
    group.bench_function("7k_lines", |b| {
        b.iter(|| collapse_progress_lines(&log, &prefixes));
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_enqueue_single,
    bench_peek_head_by_depth,
    bench_entry_lifecycle,
    bench_evict_expired,
    bench_collapse_log
);
criterion_main!(benches);
