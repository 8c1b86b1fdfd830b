use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::job::{JobId, JobToken};
use crate::lease::LeaseId;

/// Metadata envelope attached to every job event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    pub token: JobToken,
    /// Stable key so consumers can drop replays.
    pub idempotency_key: String,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(token: JobToken, idempotency_key: impl Into<String>) -> Self {
        Self {
            version: 1,
            token,
            idempotency_key: idempotency_key.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Job lifecycle event with metadata and payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobEvent {
    pub meta: EventMeta,
    pub payload: JobEventPayload,
}

impl JobEvent {
    pub fn new(token: &JobToken, payload: JobEventPayload) -> Self {
        let key = format!("{}:{}", token, payload.name());
        Self {
            meta: EventMeta::new(token.clone(), key),
            payload,
        }
    }
}

/// Event payload emitted for job lifecycle transitions.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
#[non_exhaustive]
pub enum JobEventPayload {
    /// Job record created.
    Submitted { job_id: JobId },
    /// Entry appended to the admission queue.
    Enqueued { lease_id: LeaseId },
    /// Entry reached the head; the worker now holds the slot.
    SlotAcquired { lease_id: LeaseId, waited_ms: u64 },
    /// Work handed to a dispatcher.
    Dispatched { mode: String },
    /// Cluster job evicted before running and submitted again.
    Resubmitted { attempt: u16 },
    /// Outcome recorded and slot released.
    Finished { succeeded: bool },
    /// Entry dropped after its lease expired.
    Evicted { lease_id: LeaseId },
}

impl JobEventPayload {
    pub fn name(&self) -> &'static str {
        match self {
            JobEventPayload::Submitted { .. } => "submitted",
            JobEventPayload::Enqueued { .. } => "enqueued",
            JobEventPayload::SlotAcquired { .. } => "slot_acquired",
            JobEventPayload::Dispatched { .. } => "dispatched",
            JobEventPayload::Resubmitted { .. } => "resubmitted",
            JobEventPayload::Finished { .. } => "finished",
            JobEventPayload::Evicted { .. } => "evicted",
        }
    }
}

/// Publishes job lifecycle events.
#[async_trait]
pub trait JobEventPublisher: Send + Sync {
    async fn publish(&self, event: JobEvent) -> anyhow::Result<()>;
}

/// In-process fan-out event bus on a tokio broadcast channel.
///
/// Publishing never waits for slow subscribers; a subscriber that falls
/// behind by more than `capacity` events receives `RecvError::Lagged`.
pub struct InProcEventBus {
    sender: broadcast::Sender<JobEvent>,
    capacity: usize,
}

impl std::fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl Default for InProcEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl InProcEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publish to all current subscribers. Dropped silently if there are none.
    pub fn emit(&self, event: JobEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl JobEventPublisher for InProcEventBus {
    async fn publish(&self, event: JobEvent) -> anyhow::Result<()> {
        self.emit(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn event(i: u16) -> JobEvent {
        JobEvent::new(
            &JobToken::from(format!("t{i}")),
            JobEventPayload::Resubmitted { attempt: i },
        )
    }

    #[tokio::test]
    async fn test_event_bus_broadcast_to_multiple_subscribers() {
        let bus = InProcEventBus::new(100);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        for i in 0..5 {
            bus.publish(event(i)).await.unwrap();
        }

        for i in 0..5 {
            let a = timeout(Duration::from_millis(100), rx1.recv())
                .await
                .unwrap()
                .unwrap();
            let b = timeout(Duration::from_millis(100), rx2.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(a.meta.token.to_string(), format!("t{i}"));
            assert_eq!(b.meta.idempotency_key, format!("t{i}:resubmitted"));
        }
    }

    #[tokio::test]
    async fn test_lagged_subscriber_doesnt_block_publisher() {
        let bus = InProcEventBus::new(2);
        let mut rx = bus.subscribe();

        for i in 0..5 {
            bus.emit(event(i));
        }

        let result = timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(matches!(
            result,
            Ok(Err(broadcast::error::RecvError::Lagged(_))) | Ok(Ok(_))
        ));
    }

    #[test]
    fn test_payload_serializes_with_tag() {
        let json = serde_json::to_value(JobEventPayload::Finished { succeeded: false }).unwrap();
        assert_eq!(json["event"], "finished");
        assert_eq!(json["succeeded"], false);
    }

    #[test]
    fn test_event_bus_debug_format() {
        let bus = InProcEventBus::new(8);
        let _rx = bus.subscribe();
        let debug_str = format!("{:?}", bus);
        assert!(debug_str.contains("subscribers: 1"));
        assert!(debug_str.contains("capacity: 8"));
    }
}
