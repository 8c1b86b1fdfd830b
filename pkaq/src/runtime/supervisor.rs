use std::any::type_name;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tracing::{error, info, warn, Instrument};

use super::slot::{wait_for_head, SlotHold};
use crate::config::{AdmissionConfig, PkaqConfig, RunnerConfig};
use crate::dispatch::JobDispatcher;
use crate::error::{PkaqError, Result};
use crate::events::{InProcEventBus, JobEvent, JobEventPayload};
use crate::job::{JobId, JobToken, ProteinId};
use crate::lease::QueueEntry;
use crate::queue::{AdmissionQueue, LeaseExpiryScanner};
use crate::runner::WorkItem;
use crate::store::{record_result_once, JobOutcome, LifecycleStore};
use crate::submission::{prepare, SubmissionRequest};
use crate::telemetry;

/// Configuration for the orchestrator runtime.
#[derive(Clone, Debug)]
pub struct OrchestratorRuntimeConfig {
    pub admission: AdmissionConfig,
    pub runner: RunnerConfig,
    /// Prefix of the holder id written into queue entries.
    pub holder_prefix: String,
    /// How long shutdown waits for each worker task.
    pub shutdown_timeout_secs: u64,
}

impl Default for OrchestratorRuntimeConfig {
    fn default() -> Self {
        Self {
            admission: AdmissionConfig::default(),
            runner: RunnerConfig::default(),
            holder_prefix: format!("pkaq-{}", std::process::id()),
            shutdown_timeout_secs: 30,
        }
    }
}

impl From<&PkaqConfig> for OrchestratorRuntimeConfig {
    fn from(config: &PkaqConfig) -> Self {
        Self {
            admission: config.admission.clone(),
            runner: config.runner.clone(),
            ..Self::default()
        }
    }
}

/// Token for signaling graceful shutdown to workers.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// What the caller gets back from an accepted submission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmissionReceipt {
    pub token: JobToken,
    pub job_id: JobId,
    pub protein_id: ProteinId,
}

/// Accepts submissions and runs one worker per submission.
///
/// Workers compete for the single compute slot purely through the admission
/// queue: each one waits until its own entry is at the head, dispatches,
/// then releases the entry.
pub struct OrchestratorRuntime<Q, S, D>
where
    Q: AdmissionQueue + LeaseExpiryScanner + 'static,
    S: LifecycleStore + ?Sized + 'static,
    D: JobDispatcher + 'static,
{
    config: OrchestratorRuntimeConfig,
    queue: Arc<Q>,
    store: Arc<S>,
    dispatcher: Arc<D>,
    events: Arc<InProcEventBus>,
    shutdown_token: ShutdownToken,
    worker_handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl<Q, S, D> fmt::Debug for OrchestratorRuntime<Q, S, D>
where
    Q: AdmissionQueue + LeaseExpiryScanner + 'static,
    S: LifecycleStore + ?Sized + 'static,
    D: JobDispatcher + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let worker_count = self
            .worker_handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();

        f.debug_struct("OrchestratorRuntime")
            .field("config", &self.config)
            .field("queue_type", &type_name::<Q>())
            .field("store_type", &type_name::<S>())
            .field("dispatcher_type", &type_name::<D>())
            .field("mode", &self.dispatcher.mode())
            .field("worker_count", &worker_count)
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

/// Everything one worker task needs, cloned out of the runtime.
struct WorkerContext<Q: ?Sized, S: ?Sized, D> {
    queue: Arc<Q>,
    store: Arc<S>,
    dispatcher: Arc<D>,
    events: Arc<InProcEventBus>,
    admission: AdmissionConfig,
    shutdown: ShutdownToken,
}

impl<Q, S, D> OrchestratorRuntime<Q, S, D>
where
    Q: AdmissionQueue + LeaseExpiryScanner + 'static,
    S: LifecycleStore + ?Sized + 'static,
    D: JobDispatcher + 'static,
{
    pub fn new(
        config: OrchestratorRuntimeConfig,
        queue: Arc<Q>,
        store: Arc<S>,
        dispatcher: Arc<D>,
        events: Arc<InProcEventBus>,
    ) -> Self {
        Self {
            config,
            queue,
            store,
            dispatcher,
            events,
            shutdown_token: ShutdownToken::new(),
            worker_handles: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &OrchestratorRuntimeConfig {
        &self.config
    }

    pub fn queue(&self) -> Arc<Q> {
        Arc::clone(&self.queue)
    }

    pub fn store(&self) -> Arc<S> {
        Arc::clone(&self.store)
    }

    pub fn dispatcher(&self) -> Arc<D> {
        Arc::clone(&self.dispatcher)
    }

    pub fn events(&self) -> Arc<InProcEventBus> {
        Arc::clone(&self.events)
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown_token.clone()
    }

    /// Number of entries currently in the admission queue.
    pub async fn queue_size(&self) -> Result<usize> {
        let depth = self.queue.len().await?;
        telemetry::set_queue_depth(depth);
        Ok(depth)
    }

    /// Accept a submission and start its worker.
    ///
    /// Validation errors are returned before anything is stored. The entry
    /// is appended to the queue before this returns, so admission order is
    /// submission order.
    pub async fn submit(&self, request: SubmissionRequest) -> Result<SubmissionReceipt> {
        if self.shutdown_token.is_cancelled() {
            return Err(PkaqError::Shutdown);
        }

        let prepared = prepare(request, &self.config.runner).await?;
        let token = prepared.meta.token.clone();

        let job_id = self.store.create_job(&prepared.meta).await?;
        let protein_id = self
            .store
            .resolve_or_create_protein(
                prepared.natural_key.as_deref(),
                Some(&prepared.structure),
                prepared.counts,
            )
            .await?;
        telemetry::record_job_submitted(token.as_str());
        self.events
            .emit(JobEvent::new(&token, JobEventPayload::Submitted { job_id }));

        let holder = format!("{}-{}", self.config.holder_prefix, token);
        let entry = self
            .queue
            .enqueue(&token, &holder, self.config.admission.lease_ttl())
            .await?;
        self.events.emit(JobEvent::new(
            &token,
            JobEventPayload::Enqueued {
                lease_id: entry.lease_id,
            },
        ));
        if let Ok(depth) = self.queue.len().await {
            telemetry::set_queue_depth(depth);
        }

        let work = WorkItem {
            token: token.clone(),
            job_id,
            protein_id,
            parameters: prepared.parameters,
        };
        let ctx = WorkerContext {
            queue: self.queue(),
            store: self.store(),
            dispatcher: self.dispatcher(),
            events: self.events(),
            admission: self.config.admission.clone(),
            shutdown: self.shutdown_token.clone(),
        };
        let span = telemetry::admission_span(token.as_str(), &holder);
        let handle = tokio::spawn(Self::worker(ctx, entry, work).instrument(span));
        {
            let mut handles = self.worker_handles.lock().await;
            handles.retain(|h| !h.is_finished());
            handles.push(handle);
        }

        info!(token = %token, job_id = %job_id, "submission accepted");
        Ok(SubmissionReceipt {
            token,
            job_id,
            protein_id,
        })
    }

    async fn worker(ctx: WorkerContext<Q, S, D>, entry: QueueEntry, work: WorkItem) {
        let head = match wait_for_head(ctx.queue.as_ref(), &entry, &ctx.admission, &ctx.shutdown).await {
            Ok(head) => head,
            Err(e) => {
                warn!(token = %work.token, error = %e, "job never reached the compute slot");
                Self::record_failure(&ctx, &work, format!("Job could not be started: {e}")).await;
                return;
            }
        };

        let waited_ms = (Utc::now() - head.enqueued_at).num_milliseconds().max(0) as u64;
        let hold = SlotHold::start(Arc::clone(&ctx.queue), head, &ctx.admission);
        ctx.events.emit(JobEvent::new(
            &work.token,
            JobEventPayload::SlotAcquired {
                lease_id: entry.lease_id,
                waited_ms,
            },
        ));

        let mode = ctx.dispatcher.mode();
        ctx.events.emit(JobEvent::new(
            &work.token,
            JobEventPayload::Dispatched {
                mode: mode.to_string(),
            },
        ));
        let dispatch = telemetry::instrument_dispatch(
            work.token.as_str(),
            mode,
            ctx.dispatcher.dispatch(&work),
        );
        tokio::pin!(dispatch);
        let lease_lost = hold.lease_lost();

        let succeeded = tokio::select! {
            dispatched = &mut dispatch => match dispatched {
                Ok(report) => report.succeeded(),
                Err(e) => {
                    error!(token = %work.token, error = %e, "dispatch failed");
                    Self::record_failure(&ctx, &work, format!("Job failed to dispatch: {e}")).await
                }
            },
            _ = lease_lost.cancelled() => {
                error!(token = %work.token, lease = %entry.lease_id, "compute slot lost during dispatch, aborting");
                let succeeded = Self::record_failure(
                    &ctx,
                    &work,
                    format!("Job lost its compute slot: queue lease {} could not be renewed", entry.lease_id),
                )
                .await;
                ctx.dispatcher.abort(&work).await;
                if let Err(e) = dispatch.await {
                    warn!(token = %work.token, error = %e, "aborted dispatch returned an error");
                }
                succeeded
            }
        };

        if let Err(e) = hold.release().await {
            error!(token = %work.token, error = %e, "failed to release compute slot");
        }
        if let Ok(depth) = ctx.queue.len().await {
            telemetry::set_queue_depth(depth);
        }
        ctx.events.emit(JobEvent::new(
            &work.token,
            JobEventPayload::Finished { succeeded },
        ));
    }

    /// Record an infrastructure failure as the job's terminal Result.
    ///
    /// Returns whether the job ended up succeeded, which can only be true if
    /// another writer recorded a success first.
    async fn record_failure(ctx: &WorkerContext<Q, S, D>, work: &WorkItem, error: String) -> bool {
        let outcome = JobOutcome::failed(error);
        match record_result_once(ctx.store.as_ref(), work.job_id, work.protein_id, &outcome).await {
            Ok(true) => telemetry::record_job_finished(work.token.as_str(), outcome.label()),
            Ok(false) => {}
            Err(e) => {
                error!(token = %work.token, error = %e, "failed to record failure");
                return false;
            }
        }
        if let Err(e) = ctx.store.finalize(work.job_id).await {
            error!(token = %work.token, error = %e, "failed to finalize job");
        }
        match ctx.store.result_for(work.job_id).await {
            Ok(Some(result)) => result.error.is_none(),
            _ => false,
        }
    }

    /// Spawn the task that evicts queue entries whose lease expired.
    pub fn spawn_housekeeper(&self) -> tokio::task::JoinHandle<()> {
        let q = self.queue();
        let events = self.events();
        let interval = self.config.admission.housekeeper_interval();
        let shutdown = self.shutdown_token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Housekeeper shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        match q.evict_expired().await {
                            Ok(evicted) => {
                                for entry in evicted {
                                    telemetry::record_entry_evicted(
                                        entry.token.as_str(),
                                        entry.lease_id.to_string(),
                                    );
                                    events.emit(JobEvent::new(
                                        &entry.token,
                                        JobEventPayload::Evicted { lease_id: entry.lease_id },
                                    ));
                                }
                            }
                            Err(err) => warn!("housekeeper evict_expired error: {err}"),
                        }
                    }
                }
            }
        })
    }

    /// Gracefully shut down the runtime and wait for its workers.
    ///
    /// Workers still waiting for the slot withdraw their entries and record
    /// a failure. A worker already dispatching finishes its job first.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        info!("Initiating graceful shutdown of orchestrator runtime");

        self.shutdown_token.cancel();

        let handles = {
            let mut guard = self.worker_handles.lock().await;
            std::mem::take(&mut *guard)
        };

        let grace = std::time::Duration::from_secs(self.config.shutdown_timeout_secs);
        for handle in handles {
            match tokio::time::timeout(grace, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Worker task failed: {:?}", e),
                Err(_) => warn!("Worker task timed out during shutdown"),
            }
        }

        info!("Orchestrator runtime shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_shutdown_token_shared_state() {
        let token = ShutdownToken::new();
        let clone1 = token.clone();
        let clone2 = token.clone();

        token.cancel();

        assert!(clone1.is_cancelled());
        assert!(clone2.is_cancelled());
        timeout(Duration::from_secs(1), clone1.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_token_cancelled_wakes_clones() {
        let token = ShutdownToken::new();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let t = token.clone();
                tokio::spawn(async move { t.cancelled().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        let results = timeout(Duration::from_secs(5), futures::future::join_all(waiters))
            .await
            .expect("workers did not observe cancellation within 5 seconds");
        for r in results {
            r.expect("worker task panicked");
        }
    }

    #[tokio::test]
    async fn test_shutdown_token_default_not_cancelled() {
        assert!(!ShutdownToken::default().is_cancelled());
    }

    #[test]
    fn test_config_from_file_config() {
        let mut file = PkaqConfig::default();
        file.admission.poll_interval_ms = 5;
        let config = OrchestratorRuntimeConfig::from(&file);
        assert_eq!(config.admission.poll_interval_ms, 5);
        assert!(config.holder_prefix.starts_with("pkaq-"));
    }
}
