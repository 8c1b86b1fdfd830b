//! How a worker holding the compute slot gets its job executed.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::warn;

use crate::error::Result;
use crate::job::JobToken;
use crate::routine::TitrationRoutine;
use crate::runner::{run_computation_until, ComputationRunner, WorkItem};
use crate::runtime::ShutdownToken;
use crate::store::{JobOutcome, LifecycleStore};

/// Terminal outcome as seen by the worker after dispatch returned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchReport {
    Succeeded,
    Failed { error: String },
}

impl DispatchReport {
    pub fn succeeded(&self) -> bool {
        matches!(self, DispatchReport::Succeeded)
    }
}

impl From<&JobOutcome> for DispatchReport {
    fn from(outcome: &JobOutcome) -> Self {
        match outcome {
            JobOutcome::Succeeded(_) => DispatchReport::Succeeded,
            JobOutcome::Failed { error } => DispatchReport::Failed {
                error: error.clone(),
            },
        }
    }
}

/// Executes one work item to completion and makes sure a Result exists.
///
/// `Err` means an infrastructure failure; the caller records it.
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    async fn dispatch(&self, work: &WorkItem) -> Result<DispatchReport>;

    /// Stop the computation of an in-flight [`dispatch`](Self::dispatch) for
    /// `work`. The pending `dispatch` call still returns afterwards.
    async fn abort(&self, _work: &WorkItem) {}

    /// Short label for logs and spans.
    fn mode(&self) -> &'static str;
}

/// Runs the titration routine inside this process.
pub struct LocalDispatcher<R: TitrationRoutine, S: LifecycleStore + ?Sized> {
    runner: ComputationRunner<R>,
    store: Arc<S>,
    running: Mutex<HashMap<JobToken, ShutdownToken>>,
}

impl<R: TitrationRoutine, S: LifecycleStore + ?Sized> LocalDispatcher<R, S> {
    pub fn new(runner: ComputationRunner<R>, store: Arc<S>) -> Self {
        Self {
            runner,
            store,
            running: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl<R, S> JobDispatcher for LocalDispatcher<R, S>
where
    R: TitrationRoutine,
    S: LifecycleStore + ?Sized + 'static,
{
    async fn dispatch(&self, work: &WorkItem) -> Result<DispatchReport> {
        let abort = ShutdownToken::new();
        self.running.lock().insert(work.token.clone(), abort.clone());
        let outcome = run_computation_until(&self.runner, self.store.as_ref(), work, &abort).await;
        self.running.lock().remove(&work.token);
        Ok(DispatchReport::from(&outcome?))
    }

    async fn abort(&self, work: &WorkItem) {
        if let Some(abort) = self.running.lock().get(&work.token) {
            warn!(token = %work.token, "aborting local titration");
            abort.cancel();
        }
    }

    fn mode(&self) -> &'static str {
        "local"
    }
}
