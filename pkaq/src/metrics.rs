//! Prometheus metrics for pkaq.
//!
//! Compiled only with the `metrics` feature.
//!
//! # Metrics
//!
//! ## Counters
//! - `pkaq_jobs_submitted_total` - Accepted submissions
//! - `pkaq_jobs_finished_total` - Terminal outcomes, by `outcome`
//! - `pkaq_queue_entries_evicted_total` - Entries dropped for missing heartbeats
//! - `pkaq_cluster_resubmissions_total` - Resubmissions of evicted cluster jobs
//!
//! ## Gauges
//! - `pkaq_queue_depth` - Current admission queue length
//!
//! ## Histograms
//! - `pkaq_slot_wait_seconds` - Time from enqueue to reaching the head
//! - `pkaq_run_duration_seconds` - Titration routine wall time, by `outcome`
#![cfg(feature = "metrics")]

use prometheus::{
    exponential_buckets, Counter, CounterVec, Gauge, Histogram, HistogramOpts, HistogramVec, Opts,
    Registry,
};
use std::sync::LazyLock;

/// Registry holding every pkaq metric.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static JOBS_SUBMITTED_TOTAL: LazyLock<Counter> = LazyLock::new(|| {
    Counter::new("pkaq_jobs_submitted_total", "Total number of accepted submissions")
        .expect("pkaq_jobs_submitted_total metric creation failed")
});

/// Labels:
/// - `outcome`: succeeded or failed
pub static JOBS_FINISHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "pkaq_jobs_finished_total",
        "Total number of jobs with a recorded outcome",
    );
    CounterVec::new(opts, &["outcome"]).expect("pkaq_jobs_finished_total metric creation failed")
});

pub static ENTRIES_EVICTED_TOTAL: LazyLock<Counter> = LazyLock::new(|| {
    Counter::new(
        "pkaq_queue_entries_evicted_total",
        "Total number of admission queue entries evicted after lease expiry",
    )
    .expect("pkaq_queue_entries_evicted_total metric creation failed")
});

pub static RESUBMISSIONS_TOTAL: LazyLock<Counter> = LazyLock::new(|| {
    Counter::new(
        "pkaq_cluster_resubmissions_total",
        "Total number of cluster resubmissions after eviction",
    )
    .expect("pkaq_cluster_resubmissions_total metric creation failed")
});

pub static QUEUE_DEPTH: LazyLock<Gauge> = LazyLock::new(|| {
    Gauge::new("pkaq_queue_depth", "Current admission queue length")
        .expect("pkaq_queue_depth metric creation failed")
});

pub static SLOT_WAIT_SECONDS: LazyLock<Histogram> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.5, 2.0, 16).expect("bucket creation failed");
    let opts = HistogramOpts::new(
        "pkaq_slot_wait_seconds",
        "Time spent waiting to reach the head of the admission queue",
    )
    .buckets(buckets);
    Histogram::with_opts(opts).expect("pkaq_slot_wait_seconds metric creation failed")
});

/// Labels:
/// - `outcome`: succeeded or failed
pub static RUN_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(1.0, 2.0, 16).expect("bucket creation failed");
    let opts = HistogramOpts::new(
        "pkaq_run_duration_seconds",
        "Titration routine wall time in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["outcome"]).expect("pkaq_run_duration_seconds metric creation failed")
});

/// Register all metrics with [`REGISTRY`]. Safe to call more than once.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(JOBS_SUBMITTED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(JOBS_FINISHED_TOTAL.clone()),
        Box::new(ENTRIES_EVICTED_TOTAL.clone()),
        Box::new(RESUBMISSIONS_TOTAL.clone()),
        Box::new(QUEUE_DEPTH.clone()),
        Box::new(SLOT_WAIT_SECONDS.clone()),
        Box::new(RUN_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_job_submitted() {
    JOBS_SUBMITTED_TOTAL.inc();
}

pub fn record_job_finished(outcome: &str) {
    JOBS_FINISHED_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_entry_evicted() {
    ENTRIES_EVICTED_TOTAL.inc();
}

pub fn record_resubmission() {
    RESUBMISSIONS_TOTAL.inc();
}

pub fn set_queue_depth(depth: f64) {
    QUEUE_DEPTH.set(depth);
}

pub fn observe_slot_wait(secs: f64) {
    SLOT_WAIT_SECONDS.observe(secs);
}

pub fn observe_run_duration(outcome: &str, secs: f64) {
    RUN_DURATION_SECONDS
        .with_label_values(&[outcome])
        .observe(secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization() {
        init_metrics().expect("metrics initialization should succeed");
        init_metrics().expect("second initialization should be a no-op");
    }

    #[test]
    fn test_gather_metrics() {
        init_metrics().expect("metrics initialization should succeed");

        record_job_submitted();
        record_job_finished("failed");
        observe_slot_wait(3.0);

        let output = gather_metrics().expect("gather should succeed");
        assert!(output.contains("pkaq_jobs_submitted_total"));
        assert!(output.contains("pkaq_jobs_finished_total"));
        assert!(output.contains("pkaq_slot_wait_seconds"));
    }
}
