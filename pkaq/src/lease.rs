use std::fmt::Display;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::JobToken;

/// Unique identifier for one admission queue entry.
///
/// Tokens may be enqueued more than once, so the lease id (not the token)
/// is what identifies "my" entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct LeaseId(pub Uuid);

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseId {
    /// Create a new lease ID using UUID v7.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for LeaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A token waiting in (or at the head of) the admission queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Token of the submission this entry stands for.
    pub token: JobToken,
    /// Unique identifier for this entry.
    pub lease_id: LeaseId,
    /// Worker that enqueued the entry and must keep it alive.
    pub holder: String,
    /// Timestamp of the enqueue.
    pub enqueued_at: DateTime<Utc>,
    /// Timestamp after which the entry may be evicted.
    pub expires_at: DateTime<Utc>,
    /// Number of heartbeats received.
    pub renewals: u32,
}

impl QueueEntry {
    /// Creates a new entry that expires `ttl` from now.
    pub fn new(token: JobToken, holder: impl Into<String>, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            token,
            lease_id: LeaseId::new(),
            holder: holder.into(),
            enqueued_at: now,
            expires_at: now + ttl,
            renewals: 0,
        }
    }

    /// Checks if the entry has expired.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    /// Push the expiry to `ttl` from now. Never moves it backwards.
    pub fn renew(&mut self, ttl: Duration) {
        let candidate = Utc::now() + ttl;
        if candidate > self.expires_at {
            self.expires_at = candidate;
        }
        self.renewals += 1;
    }
}

/// Heartbeat for a queue entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LeaseRenewal {
    /// ID of the entry to renew.
    pub lease_id: LeaseId,
    /// Worker sending the heartbeat; must match the entry holder.
    pub holder: String,
    /// New time-to-live measured from now.
    pub ttl: Duration,
}

/// Bounded retry with exponential backoff.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retries before giving up.
    pub max_attempts: u16,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
    /// Maximum backoff delay in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 5000,
            max_backoff_ms: 300000, // 5 minutes
        }
    }
}

/// Computes the delay before retry number `attempts`.
///
/// Formula: delay = min(base_delay * 2^(attempts-1), max_backoff)
pub fn compute_retry_delay(attempts: u16, policy: &RetryPolicy) -> Duration {
    if attempts == 0 {
        return Duration::milliseconds(0);
    }

    let exp = (attempts.saturating_sub(1)) as i32;
    let scaled = (policy.base_delay_ms as f64) * 2f64.powi(exp);
    let capped = scaled.min(policy.max_backoff_ms as f64);
    let clamped_ms = capped.max(0.0) as i64;

    Duration::milliseconds(clamped_ms)
}

/// Returns true once `attempts` has used up the policy.
pub fn should_give_up(attempts: u16, max_attempts: u16) -> bool {
    attempts > max_attempts
}

/// What to do after one more failed attempt.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RetryDecision {
    /// Try again after the given delay.
    Retry {
        /// Delay in milliseconds.
        delay_ms: u64,
    },
    /// Attempts exhausted.
    GiveUp,
}

/// Decide whether retry number `current_attempts + 1` is allowed.
pub fn next_retry(current_attempts: u16, policy: &RetryPolicy) -> RetryDecision {
    let next_attempt = current_attempts.saturating_add(1);

    if should_give_up(next_attempt, policy.max_attempts) {
        RetryDecision::GiveUp
    } else {
        let delay = compute_retry_delay(next_attempt, policy);
        RetryDecision::Retry {
            delay_ms: delay.num_milliseconds() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_id_display() {
        let id = LeaseId::new();
        let s = id.to_string();
        assert!(!s.is_empty());
    }

    #[test]
    fn test_entry_expiry_and_renew() {
        let mut entry = QueueEntry::new(JobToken::from("a"), "w0", Duration::milliseconds(-10));
        assert!(entry.is_expired());

        entry.renew(Duration::seconds(30));
        assert!(!entry.is_expired());
        assert_eq!(entry.renewals, 1);
    }

    #[test]
    fn test_renew_never_shortens() {
        let mut entry = QueueEntry::new(JobToken::from("a"), "w0", Duration::seconds(600));
        let before = entry.expires_at;
        entry.renew(Duration::seconds(1));
        assert_eq!(entry.expires_at, before);
    }

    #[test]
    fn test_compute_retry_delay_exponential() {
        let policy = RetryPolicy::default();

        let delay1 = compute_retry_delay(1, &policy);
        assert_eq!(delay1.num_milliseconds() as u64, policy.base_delay_ms);

        let delay2 = compute_retry_delay(2, &policy);
        assert_eq!(delay2.num_milliseconds() as u64, policy.base_delay_ms * 2);

        let delay3 = compute_retry_delay(3, &policy);
        assert_eq!(delay3.num_milliseconds() as u64, policy.base_delay_ms * 4);
    }

    #[test]
    fn test_retry_delay_capped() {
        let policy = RetryPolicy {
            base_delay_ms: 1000,
            max_backoff_ms: 5000,
            ..Default::default()
        };

        let delay = compute_retry_delay(10, &policy);
        assert_eq!(delay.num_milliseconds() as u64, policy.max_backoff_ms);
    }

    #[test]
    fn test_should_give_up() {
        assert!(!should_give_up(0, 3));
        assert!(!should_give_up(3, 3));
        assert!(should_give_up(4, 3));
        assert!(should_give_up(1, 0));
    }

    #[test]
    fn test_next_retry_until_exhausted() {
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay_ms: 100,
            ..Default::default()
        };

        assert_eq!(next_retry(0, &policy), RetryDecision::Retry { delay_ms: 100 });
        assert_eq!(next_retry(1, &policy), RetryDecision::Retry { delay_ms: 200 });
        assert_eq!(next_retry(2, &policy), RetryDecision::GiveUp);
    }
}
