use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pkaq::error::Result;
use pkaq::*;

use crate::fixtures::sample_report;

/// What a [`MockDispatcher`] does with a work item.
#[derive(Clone, Debug)]
pub enum MockDispatch {
    /// Record a success.
    Succeed,
    /// Record a failure carrying this error.
    Fail(String),
    /// Return an infrastructure error without recording anything.
    Error(String),
}

#[derive(Clone, Debug)]
pub struct DispatchRecord {
    pub token: JobToken,
    pub job_id: JobId,
    pub protein_id: ProteinId,
}

/// A [`JobDispatcher`] that writes canned Results straight to the store.
pub struct MockDispatcher<S: LifecycleStore + ?Sized> {
    store: Arc<S>,
    dispatches: Arc<Mutex<Vec<DispatchRecord>>>,
    aborted: Arc<Mutex<Vec<JobToken>>>,
    result: Arc<Mutex<MockDispatch>>,
    delay: Duration,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl<S: LifecycleStore + ?Sized> MockDispatcher<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_result(store, MockDispatch::Succeed)
    }

    pub fn with_result(store: Arc<S>, result: MockDispatch) -> Self {
        Self {
            store,
            dispatches: Arc::new(Mutex::new(Vec::new())),
            aborted: Arc::new(Mutex::new(Vec::new())),
            result: Arc::new(Mutex::new(result)),
            delay: Duration::ZERO,
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Hold each dispatch open for `delay` before finishing.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn record(&self) -> Vec<DispatchRecord> {
        self.dispatches.lock().clone()
    }

    pub fn tokens(&self) -> Vec<String> {
        self.dispatches
            .lock()
            .iter()
            .map(|r| r.token.as_str().to_string())
            .collect()
    }

    pub fn assert_dispatch_count_eq(&self, expected: usize) {
        let actual = self.dispatches.lock().len();
        assert_eq!(
            actual, expected,
            "Expected {} dispatches, got {}",
            expected, actual
        );
    }

    /// Tokens whose dispatch was aborted.
    pub fn aborted(&self) -> Vec<String> {
        self.aborted
            .lock()
            .iter()
            .map(|t| t.as_str().to_string())
            .collect()
    }

    pub fn set_result(&self, result: MockDispatch) {
        *self.result.lock() = result;
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<S: LifecycleStore + ?Sized + 'static> JobDispatcher for MockDispatcher<S> {
    async fn dispatch(&self, work: &WorkItem) -> Result<DispatchReport> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        self.dispatches.lock().push(DispatchRecord {
            token: work.token.clone(),
            job_id: work.job_id,
            protein_id: work.protein_id,
        });

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let result = self.result.lock().clone();
        let report = match result {
            MockDispatch::Succeed => {
                let outcome = JobOutcome::Succeeded(sample_report());
                record_result_once(self.store.as_ref(), work.job_id, work.protein_id, &outcome)
                    .await
                    .map(|_| DispatchReport::from(&outcome))
            }
            MockDispatch::Fail(error) => {
                let outcome = JobOutcome::failed(error);
                record_result_once(self.store.as_ref(), work.job_id, work.protein_id, &outcome)
                    .await
                    .map(|_| DispatchReport::from(&outcome))
            }
            MockDispatch::Error(message) => Err(PkaqError::Cluster(message)),
        };
        let report = match report {
            Ok(report) => self.store.finalize(work.job_id).await.map(|_| report),
            Err(e) => Err(e),
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        report
    }

    async fn abort(&self, work: &WorkItem) {
        self.aborted.lock().push(work.token.clone());
    }

    fn mode(&self) -> &'static str {
        "mock"
    }
}
