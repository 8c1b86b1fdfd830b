use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use pkaq::cluster::{ClusterCli, SubmitRequest};
use pkaq::error::Result;

/// Called once when a simulated cluster job leaves the queue.
///
/// Receives the submit request and the 1-based attempt number for its job
/// name. This is where a test plays the part of the job itself, usually by
/// writing a Result to the store.
pub type FinishHook = Arc<dyn Fn(SubmitRequest, u32) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug)]
struct SimulatedJob {
    cluster_id: String,
    request: SubmitRequest,
    attempt: u32,
    polls_left: u32,
    finished: bool,
}

#[derive(Default)]
struct ClusterState {
    jobs: Vec<SimulatedJob>,
    attempts: HashMap<String, u32>,
    idle_nodes: u32,
    powered_down: Vec<String>,
    powered_on: Vec<String>,
    cancelled: Vec<String>,
    next_id: u64,
}

/// An in-process [`ClusterCli`] that simulates a batch scheduler.
///
/// A submitted job stays in the queue for a fixed number of polls, then
/// leaves it. When it leaves, its stdout log is written if the attempt is
/// at least `log_from_attempt`, and the finish hook runs.
#[derive(Clone)]
pub struct MockClusterCli {
    state: Arc<Mutex<ClusterState>>,
    polls_before_exit: u32,
    log_from_attempt: Option<u32>,
    on_finish: Option<FinishHook>,
    never_exit: bool,
}

impl MockClusterCli {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ClusterState {
                idle_nodes: 1,
                next_id: 1000,
                ..ClusterState::default()
            })),
            polls_before_exit: 1,
            log_from_attempt: Some(1),
            on_finish: None,
            never_exit: false,
        }
    }

    pub fn with_polls_before_exit(mut self, polls: u32) -> Self {
        self.polls_before_exit = polls;
        self
    }

    /// Write the stdout log only from this attempt on; `None` never writes it.
    pub fn with_log_from_attempt(mut self, attempt: Option<u32>) -> Self {
        self.log_from_attempt = attempt;
        self
    }

    pub fn with_on_finish(mut self, hook: FinishHook) -> Self {
        self.on_finish = Some(hook);
        self
    }

    /// Jobs stay queued until cancelled.
    pub fn never_exiting(mut self) -> Self {
        self.never_exit = true;
        self
    }

    pub fn with_idle_nodes(self, idle: u32) -> Self {
        self.state.lock().idle_nodes = idle;
        self
    }

    pub fn with_powered_down(self, nodes: &[&str]) -> Self {
        self.state.lock().powered_down = nodes.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn submissions(&self) -> Vec<SubmitRequest> {
        self.state
            .lock()
            .jobs
            .iter()
            .map(|j| j.request.clone())
            .collect()
    }

    pub fn submission_count(&self) -> usize {
        self.state.lock().jobs.len()
    }

    pub fn powered_on(&self) -> Vec<String> {
        self.state.lock().powered_on.clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.state.lock().cancelled.clone()
    }

    fn write_log(request: &SubmitRequest, attempt: u32) {
        if let Some(parent) = request.stdout.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let _ = std::fs::write(&request.stdout, format!("attempt {attempt}\nMC Run: 1/1\n"));
    }
}

impl Default for MockClusterCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterCli for MockClusterCli {
    async fn submit(&self, request: &SubmitRequest) -> Result<String> {
        let mut state = self.state.lock();
        state.next_id += 1;
        let cluster_id = state.next_id.to_string();
        let attempt = {
            let count = state.attempts.entry(request.job_name.clone()).or_insert(0);
            *count += 1;
            *count
        };
        state.jobs.push(SimulatedJob {
            cluster_id: cluster_id.clone(),
            request: request.clone(),
            attempt,
            polls_left: self.polls_before_exit,
            finished: false,
        });
        Ok(cluster_id)
    }

    async fn queue_contains(&self, job_name: &str) -> Result<bool> {
        let finished = {
            let mut state = self.state.lock();
            let Some(job) = state
                .jobs
                .iter_mut()
                .rev()
                .find(|j| j.request.job_name == job_name)
            else {
                return Ok(false);
            };
            if job.finished {
                return Ok(false);
            }
            if self.never_exit || job.polls_left > 0 {
                job.polls_left = job.polls_left.saturating_sub(1);
                return Ok(true);
            }
            job.finished = true;
            (job.request.clone(), job.attempt)
        };

        let (request, attempt) = finished;
        if self.log_from_attempt.is_some_and(|from| attempt >= from) {
            Self::write_log(&request, attempt);
        }
        if let Some(hook) = &self.on_finish {
            hook(request, attempt).await;
        }
        Ok(false)
    }

    async fn idle_node_count(&self) -> Result<u32> {
        Ok(self.state.lock().idle_nodes)
    }

    async fn powered_down_nodes(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().powered_down.clone())
    }

    async fn power_on(&self, node: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.powered_down.retain(|n| n != node);
        state.powered_on.push(node.to_string());
        state.idle_nodes += 1;
        Ok(())
    }

    async fn cancel(&self, job_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.cancelled.push(job_id.to_string());
        if let Some(job) = state.jobs.iter_mut().find(|j| j.cluster_id == job_id) {
            job.finished = true;
        }
        Ok(())
    }
}
