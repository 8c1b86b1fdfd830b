//! Tracing and telemetry instrumentation for pkaq.
//!
//! Span constructors for the admission, dispatch, cluster polling, run and
//! status paths, plus `record_*` helpers that log an event and, with the
//! `metrics` feature, update the matching Prometheus series.
//!
//! # Example
//!
//! ```ignore
//! use pkaq::telemetry::{dispatch_span, record_job_finished};
//!
//! let span = dispatch_span(token.as_str(), "cluster");
//! let _enter = span.enter();
//! // ... dispatch
//! record_job_finished(token.as_str(), "failed");
//! ```

use std::future::Future;
use tracing::{info_span, Instrument, Span};

/// Span covering one worker's wait for the admission slot.
#[must_use]
pub fn admission_span(token: impl AsRef<str>, holder: impl AsRef<str>) -> Span {
    info_span!(
        "pkaq.admission",
        token = %token.as_ref(),
        holder = %holder.as_ref(),
    )
}

/// Span covering the work done while holding the slot.
#[must_use]
pub fn dispatch_span(token: impl AsRef<str>, mode: impl AsRef<str>) -> Span {
    info_span!(
        "pkaq.dispatch",
        token = %token.as_ref(),
        mode = %mode.as_ref(),
    )
}

/// Span covering the poll loop for one cluster submission.
#[must_use]
pub fn cluster_poll_span(token: impl AsRef<str>, cluster_job: impl AsRef<str>) -> Span {
    info_span!(
        "pkaq.cluster_poll",
        token = %token.as_ref(),
        cluster_job = %cluster_job.as_ref(),
    )
}

/// Span covering one titration routine invocation.
#[must_use]
pub fn run_span(token: impl AsRef<str>) -> Span {
    info_span!("pkaq.run", token = %token.as_ref())
}

/// Span covering one status lookup.
#[must_use]
pub fn status_span(token: impl AsRef<str>) -> Span {
    info_span!("pkaq.status", token = %token.as_ref())
}

/// Instrument a future with a dispatch span.
pub fn instrument_dispatch<F>(
    token: impl AsRef<str>,
    mode: impl AsRef<str>,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    let span = dispatch_span(token, mode);
    future.instrument(span)
}

/// Record an accepted submission.
pub fn record_job_submitted(token: impl AsRef<str>) {
    tracing::info!(token = %token.as_ref(), "job submitted");

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_submitted();
}

/// Record that a worker reached the head of the admission queue.
pub fn record_slot_acquired(token: impl AsRef<str>, waited_secs: f64) {
    tracing::info!(
        token = %token.as_ref(),
        waited_secs = waited_secs,
        "slot acquired"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_slot_wait(waited_secs);
}

/// Record a terminal outcome.
///
/// # Arguments
/// * `token` - The job token
/// * `outcome` - `succeeded` or `failed`
pub fn record_job_finished(token: impl AsRef<str>, outcome: impl AsRef<str>) {
    tracing::info!(
        token = %token.as_ref(),
        outcome = %outcome.as_ref(),
        "job finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_finished(outcome.as_ref());
}

/// Record a queue entry evicted for missing heartbeats.
pub fn record_entry_evicted(token: impl AsRef<str>, lease_id: impl AsRef<str>) {
    tracing::warn!(
        token = %token.as_ref(),
        lease_id = %lease_id.as_ref(),
        "queue entry expired"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_entry_evicted();
}

/// Record a cluster resubmission after an eviction.
pub fn record_resubmission(token: impl AsRef<str>, attempt: u16) {
    tracing::warn!(
        token = %token.as_ref(),
        attempt = attempt,
        "resubmitting evicted cluster job"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_resubmission();
}

/// Update the admission queue depth.
pub fn set_queue_depth(depth: usize) {
    tracing::debug!(depth = depth, "queue depth updated");

    #[cfg(feature = "metrics")]
    crate::metrics::set_queue_depth(depth as f64);
}

/// Start timing a titration run.
pub fn record_run_start(token: impl AsRef<str>) -> RunTimingHandle {
    RunTimingHandle {
        token: token.as_ref().to_string(),
        start: std::time::Instant::now(),
    }
}

/// Finish timing a titration run.
pub fn record_run_end(handle: RunTimingHandle, outcome: impl AsRef<str>) {
    let duration_secs = handle.start.elapsed().as_secs_f64();
    tracing::info!(
        token = %handle.token,
        outcome = %outcome.as_ref(),
        duration_secs = duration_secs,
        "titration run finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_run_duration(outcome.as_ref(), duration_secs);
}

/// Handle returned by [`record_run_start`].
#[derive(Debug)]
pub struct RunTimingHandle {
    token: String,
    start: std::time::Instant,
}

impl RunTimingHandle {
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}
