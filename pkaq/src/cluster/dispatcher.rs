use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::sleep;
use tracing::{info, warn, Instrument};

use super::cli::{ClusterCli, SubmitRequest};
use super::script::{render_script, write_script, BatchScript};
use super::{cluster_job_name, ClusterStrategy};
use crate::config::ClusterConfig;
use crate::dispatch::{DispatchReport, JobDispatcher};
use crate::error::{PkaqError, Result};
use crate::events::{InProcEventBus, JobEvent, JobEventPayload};
use crate::job::JobToken;
use crate::lease::{next_retry, RetryDecision};
use crate::runner::WorkItem;
use crate::store::{record_result_once, JobOutcome, LifecycleStore};
use crate::telemetry;

/// Error recorded when a cluster job left the queue without writing a Result.
pub const TIME_LIMIT_MESSAGE: &str = "Job cancelled due to time limit";

/// Prefix of the error recorded once resubmissions are exhausted.
pub const PERMANENT_FAILURE_PREFIX: &str = "Job permanently failed";

/// Submits one job to the batch cluster and waits for it to leave the queue.
///
/// The cluster job itself writes the Result through the `run-computation`
/// entry point. This side only fills the gap when it could not: a job
/// killed at its wall-clock limit, or one evicted too many times.
pub struct ClusterDispatcher<C: ClusterCli, S: LifecycleStore + ?Sized> {
    cli: Arc<C>,
    store: Arc<S>,
    config: ClusterConfig,
    strategy: ClusterStrategy,
    events: Option<Arc<InProcEventBus>>,
    active: Mutex<HashMap<JobToken, ActiveJob>>,
}

/// A dispatch in flight: its current cluster job and whether it was aborted.
#[derive(Debug, Default)]
struct ActiveJob {
    cluster_id: Option<String>,
    aborted: bool,
}

impl<C: ClusterCli, S: LifecycleStore + ?Sized> ClusterDispatcher<C, S> {
    pub fn new(cli: Arc<C>, store: Arc<S>, config: ClusterConfig, strategy: ClusterStrategy) -> Self {
        Self {
            cli,
            store,
            config,
            strategy,
            events: None,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_events(mut self, events: Arc<InProcEventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn strategy(&self) -> ClusterStrategy {
        self.strategy
    }

    pub fn stdout_path(&self, work: &WorkItem) -> PathBuf {
        self.config
            .submissions_dir
            .join(format!("{}.out", work.token))
    }

    pub fn stderr_path(&self, work: &WorkItem) -> PathBuf {
        self.config
            .submissions_dir
            .join(format!("{}.err", work.token))
    }

    pub fn script_path(&self, work: &WorkItem) -> PathBuf {
        self.config
            .submissions_dir
            .join(format!("slurm_{}.sh", work.token))
    }

    /// Generate, submit and wait. Returns the recorded outcome.
    pub async fn submit(&self, work: &WorkItem) -> Result<DispatchReport> {
        self.active.lock().insert(work.token.clone(), ActiveJob::default());
        let submitted = self.prepare_and_submit(work).await;
        self.active.lock().remove(&work.token);
        submitted?;

        self.detect_timeout(work).await
    }

    async fn prepare_and_submit(&self, work: &WorkItem) -> Result<()> {
        let script = render_script(&BatchScript {
            work,
            program: &self.config.runner_program,
            config: self.config.runner_config.as_deref(),
        })?;
        let script_path = write_script(&self.script_path(work), &script)?;

        match self.cli.idle_node_count().await {
            Ok(idle) => {
                info!(token = %work.token, idle_nodes = idle, "cluster capacity before submit");
                if idle == 0 && self.strategy == ClusterStrategy::PowerAware {
                    self.wake_node(work).await?;
                }
            }
            Err(e) => warn!(token = %work.token, error = %e, "could not query idle nodes"),
        }

        let request = SubmitRequest {
            script: script_path,
            job_name: cluster_job_name(&self.config.job_name_prefix, &work.token),
            cores: self.config.cores,
            partition: self.config.partition.clone(),
            time_limit_minutes: self.config.time_limit_minutes,
            stdout: self.stdout_path(work),
            stderr: self.stderr_path(work),
        };

        self.submit_until_run(work, &request).await
    }

    /// Cancel the cluster job of an in-flight dispatch and stop resubmitting.
    pub async fn abort(&self, work: &WorkItem) {
        let cluster_id = match self.active.lock().get_mut(&work.token) {
            Some(active) => {
                active.aborted = true;
                active.cluster_id.clone()
            }
            None => return,
        };
        if let Some(cluster_id) = cluster_id {
            warn!(token = %work.token, cluster_job = %cluster_id, "cancelling cluster job");
            if let Err(e) = self.cli.cancel(&cluster_id).await {
                warn!(token = %work.token, cluster_job = %cluster_id, error = %e, "cancel failed");
            }
        }
    }

    fn is_aborted(&self, work: &WorkItem) -> bool {
        self.active
            .lock()
            .get(&work.token)
            .is_some_and(|active| active.aborted)
    }

    async fn submit_until_run(&self, work: &WorkItem, request: &SubmitRequest) -> Result<()> {
        let mut resubmissions: u16 = 0;
        loop {
            if self.is_aborted(work) {
                return Ok(());
            }
            let cluster_id = self.cli.submit(request).await?;
            info!(token = %work.token, cluster_job = %cluster_id, "submitted cluster job");
            let aborted = match self.active.lock().get_mut(&work.token) {
                Some(active) => {
                    active.cluster_id = Some(cluster_id.clone());
                    active.aborted
                }
                None => false,
            };
            if aborted {
                // Aborted while sbatch was running.
                if let Err(e) = self.cli.cancel(&cluster_id).await {
                    warn!(token = %work.token, cluster_job = %cluster_id, error = %e, "cancel failed");
                }
            }

            self.wait_until_gone(&request.job_name, &cluster_id)
                .instrument(telemetry::cluster_poll_span(work.token.as_str(), &cluster_id))
                .await?;

            if self.strategy == ClusterStrategy::PowerAware
                && !request.stdout.exists()
                && !self.is_aborted(work)
            {
                match next_retry(resubmissions, &self.config.resubmit) {
                    RetryDecision::Retry { delay_ms } => {
                        resubmissions += 1;
                        telemetry::record_resubmission(work.token.as_str(), resubmissions);
                        self.emit(work, JobEventPayload::Resubmitted {
                            attempt: resubmissions,
                        });
                        sleep(std::time::Duration::from_millis(delay_ms)).await;
                        continue;
                    }
                    RetryDecision::GiveUp => {
                        let error = format!(
                            "{}: evicted {} times before it could run",
                            PERMANENT_FAILURE_PREFIX,
                            resubmissions + 1
                        );
                        warn!(token = %work.token, %error, "giving up on cluster job");
                        record_result_once(
                            self.store.as_ref(),
                            work.job_id,
                            work.protein_id,
                            &JobOutcome::failed(error),
                        )
                        .await?;
                    }
                }
            }
            return Ok(());
        }
    }

    /// Record the time-limit failure if the cluster job left no Result.
    ///
    /// Safe to run from several detectors at once: only one write succeeds.
    pub async fn detect_timeout(&self, work: &WorkItem) -> Result<DispatchReport> {
        if self.store.result_for(work.job_id).await?.is_none() {
            let written = record_result_once(
                self.store.as_ref(),
                work.job_id,
                work.protein_id,
                &JobOutcome::failed(TIME_LIMIT_MESSAGE),
            )
            .await?;
            if written {
                warn!(token = %work.token, "cluster job left the queue without a result");
            }
        }
        self.store.finalize(work.job_id).await?;

        let result = self
            .store
            .result_for(work.job_id)
            .await?
            .ok_or_else(|| PkaqError::Store(format!("result for job {} vanished", work.job_id)))?;
        Ok(match result.error {
            Some(error) => DispatchReport::Failed { error },
            None => DispatchReport::Succeeded,
        })
    }

    async fn wait_until_gone(&self, job_name: &str, cluster_id: &str) -> Result<()> {
        let started = Instant::now();
        loop {
            match self.cli.queue_contains(job_name).await {
                Ok(false) => return Ok(()),
                Ok(true) => {}
                Err(e) => warn!(job_name, error = %e, "cluster queue query failed"),
            }
            if started.elapsed() >= self.config.max_wait() {
                if let Err(e) = self.cli.cancel(cluster_id).await {
                    warn!(cluster_job = cluster_id, error = %e, "cancel after wait timeout failed");
                }
                return Err(PkaqError::WaitTimeout {
                    what: "cluster job to leave the queue",
                    waited: started.elapsed(),
                });
            }
            sleep(self.config.poll_interval()).await;
        }
    }

    async fn wake_node(&self, work: &WorkItem) -> Result<()> {
        let nodes = self.cli.powered_down_nodes().await?;
        let Some(node) = nodes.first() else {
            warn!(token = %work.token, "no idle node and none powered down; submitting anyway");
            return Ok(());
        };
        info!(token = %work.token, node = %node, "powering on node");
        self.cli.power_on(node).await?;

        let started = Instant::now();
        loop {
            match self.cli.idle_node_count().await {
                Ok(idle) if idle > 0 => return Ok(()),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "idle node query failed while powering on"),
            }
            if started.elapsed() >= self.config.power_on_timeout() {
                return Err(PkaqError::WaitTimeout {
                    what: "powered-on node to become idle",
                    waited: started.elapsed(),
                });
            }
            sleep(self.config.poll_interval()).await;
        }
    }

    fn emit(&self, work: &WorkItem, payload: JobEventPayload) {
        if let Some(events) = &self.events {
            events.emit(JobEvent::new(&work.token, payload));
        }
    }
}

#[async_trait]
impl<C, S> JobDispatcher for ClusterDispatcher<C, S>
where
    C: ClusterCli + 'static,
    S: LifecycleStore + ?Sized + 'static,
{
    async fn dispatch(&self, work: &WorkItem) -> Result<DispatchReport> {
        self.submit(work).await
    }

    async fn abort(&self, work: &WorkItem) {
        ClusterDispatcher::abort(self, work).await
    }

    fn mode(&self) -> &'static str {
        match self.strategy {
            ClusterStrategy::Plain => "cluster",
            ClusterStrategy::PowerAware => "power_aware_cluster",
        }
    }
}
