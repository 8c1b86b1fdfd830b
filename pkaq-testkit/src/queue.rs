use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use parking_lot::Mutex;
use pkaq::error::{PkaqError, Result};
use pkaq::*;

/// An [`InMemoryAdmissionQueue`] whose renewals can be made to fail, the way
/// a database queue does when a connection drops.
#[derive(Clone, Default)]
pub struct FlakyQueue {
    inner: Arc<InMemoryAdmissionQueue>,
    failing: Arc<Mutex<HashMap<JobToken, usize>>>,
    failed: Arc<Mutex<usize>>,
}

impl FlakyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` renewals of entries for `token`.
    pub fn fail_renewals(&self, token: impl Into<JobToken>, count: usize) {
        self.failing.lock().insert(token.into(), count);
    }

    /// Renewals that failed so far.
    pub fn failed_renewals(&self) -> usize {
        *self.failed.lock()
    }

    async fn token_of(&self, lease_id: LeaseId) -> Result<Option<JobToken>> {
        Ok(self
            .inner
            .entries()
            .await?
            .into_iter()
            .find(|e| e.lease_id == lease_id)
            .map(|e| e.token))
    }
}

#[async_trait]
impl AdmissionQueue for FlakyQueue {
    async fn enqueue(&self, token: &JobToken, holder: &str, ttl: Duration) -> Result<QueueEntry> {
        self.inner.enqueue(token, holder, ttl).await
    }

    async fn peek_head(&self) -> Result<Option<QueueEntry>> {
        self.inner.peek_head().await
    }

    async fn dequeue(&self) -> Result<Option<QueueEntry>> {
        self.inner.dequeue().await
    }

    async fn release(&self, lease_id: LeaseId) -> Result<bool> {
        self.inner.release(lease_id).await
    }

    async fn contains(&self, token: &JobToken) -> Result<bool> {
        self.inner.contains(token).await
    }

    async fn renew(&self, renewal: LeaseRenewal) -> Result<QueueEntry> {
        if let Some(token) = self.token_of(renewal.lease_id).await? {
            let mut failing = self.failing.lock();
            if let Some(left) = failing.get_mut(&token) {
                if *left > 0 {
                    *left -= 1;
                    *self.failed.lock() += 1;
                    return Err(PkaqError::Store("connection reset by peer".to_string()));
                }
            }
        }
        self.inner.renew(renewal).await
    }

    async fn len(&self) -> Result<usize> {
        self.inner.len().await
    }

    async fn entries(&self) -> Result<Vec<QueueEntry>> {
        self.inner.entries().await
    }

    async fn remove_token(&self, token: &JobToken) -> Result<usize> {
        self.inner.remove_token(token).await
    }
}

#[async_trait]
impl LeaseExpiryScanner for FlakyQueue {
    async fn evict_expired(&self) -> Result<Vec<QueueEntry>> {
        self.inner.evict_expired().await
    }
}
