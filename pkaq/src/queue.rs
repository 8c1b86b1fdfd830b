use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::Mutex;

use crate::error::{PkaqError, Result};
use crate::job::JobToken;
use crate::lease::{LeaseId, LeaseRenewal, QueueEntry};

/// Strict FIFO sequence of job tokens guarding the single compute slot.
///
/// Only the entry at the head may hold the slot. Implementations are shared
/// stores polled by every worker; none of them offers a blocking wait.
#[async_trait]
pub trait AdmissionQueue: Send + Sync {
    /// Append a token at the tail. Duplicate tokens become distinct entries.
    async fn enqueue(&self, token: &JobToken, holder: &str, ttl: Duration) -> Result<QueueEntry>;

    /// The current head, if any.
    async fn peek_head(&self) -> Result<Option<QueueEntry>>;

    /// Remove the head unconditionally.
    async fn dequeue(&self) -> Result<Option<QueueEntry>>;

    /// Remove one specific entry wherever it sits. Returns false if it was gone.
    async fn release(&self, lease_id: LeaseId) -> Result<bool>;

    /// Whether any entry carries `token`.
    async fn contains(&self, token: &JobToken) -> Result<bool>;

    /// Extend an entry's expiry. Fails with `LeaseLost` if the entry is gone.
    async fn renew(&self, renewal: LeaseRenewal) -> Result<QueueEntry>;

    /// Number of entries.
    async fn len(&self) -> Result<usize>;

    /// All entries in FIFO order.
    async fn entries(&self) -> Result<Vec<QueueEntry>>;

    /// Out-of-band removal of every entry carrying `token`.
    async fn remove_token(&self, token: &JobToken) -> Result<usize>;
}

/// Evicts entries whose holders stopped sending heartbeats.
#[async_trait]
pub trait LeaseExpiryScanner: Send + Sync {
    /// Remove expired entries and return them.
    async fn evict_expired(&self) -> Result<Vec<QueueEntry>>;
}

/// Process-local admission queue.
#[derive(Clone, Debug, Default)]
pub struct InMemoryAdmissionQueue {
    entries: Arc<Mutex<VecDeque<QueueEntry>>>,
}

impl InMemoryAdmissionQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AdmissionQueue for InMemoryAdmissionQueue {
    async fn enqueue(&self, token: &JobToken, holder: &str, ttl: Duration) -> Result<QueueEntry> {
        let entry = QueueEntry::new(token.clone(), holder, ttl);
        self.entries.lock().push_back(entry.clone());
        Ok(entry)
    }

    async fn peek_head(&self) -> Result<Option<QueueEntry>> {
        Ok(self.entries.lock().front().cloned())
    }

    async fn dequeue(&self) -> Result<Option<QueueEntry>> {
        Ok(self.entries.lock().pop_front())
    }

    async fn release(&self, lease_id: LeaseId) -> Result<bool> {
        let mut entries = self.entries.lock();
        match entries.iter().position(|e| e.lease_id == lease_id) {
            Some(idx) => {
                entries.remove(idx);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn contains(&self, token: &JobToken) -> Result<bool> {
        Ok(self.entries.lock().iter().any(|e| &e.token == token))
    }

    async fn renew(&self, renewal: LeaseRenewal) -> Result<QueueEntry> {
        let mut entries = self.entries.lock();
        let entry = entries
            .iter_mut()
            .find(|e| e.lease_id == renewal.lease_id && e.holder == renewal.holder)
            .ok_or(PkaqError::LeaseLost(renewal.lease_id))?;
        entry.renew(renewal.ttl);
        Ok(entry.clone())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.entries.lock().len())
    }

    async fn entries(&self) -> Result<Vec<QueueEntry>> {
        Ok(self.entries.lock().iter().cloned().collect())
    }

    async fn remove_token(&self, token: &JobToken) -> Result<usize> {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| &e.token != token);
        Ok(before - entries.len())
    }
}

#[async_trait]
impl LeaseExpiryScanner for InMemoryAdmissionQueue {
    async fn evict_expired(&self) -> Result<Vec<QueueEntry>> {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        let (expired, live): (Vec<_>, Vec<_>) =
            entries.drain(..).partition(|e| e.is_expired_at(now));
        entries.extend(live);
        Ok(expired)
    }
}
