use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::supervisor::ShutdownToken;
use crate::config::AdmissionConfig;
use crate::error::{PkaqError, Result};
use crate::job::JobToken;
use crate::lease::{LeaseRenewal, QueueEntry};
use crate::queue::AdmissionQueue;
use crate::telemetry;

/// Poll the queue until `entry` is at the head.
///
/// The entry is renewed on every poll so a live waiter is never evicted.
/// Only [`PkaqError::LeaseLost`] ends the wait early; other queue errors are
/// retried until `max_wait`. On timeout or shutdown the entry is withdrawn
/// before the error is returned, so the queue never keeps a token nobody is
/// waiting for.
pub async fn wait_for_head<Q>(
    queue: &Q,
    entry: &QueueEntry,
    config: &AdmissionConfig,
    shutdown: &ShutdownToken,
) -> Result<QueueEntry>
where
    Q: AdmissionQueue + ?Sized,
{
    let started = Instant::now();
    let mut current = entry.clone();
    loop {
        match queue
            .renew(LeaseRenewal {
                lease_id: entry.lease_id,
                holder: entry.holder.clone(),
                ttl: config.lease_ttl(),
            })
            .await
        {
            Ok(renewed) => current = renewed,
            Err(e @ PkaqError::LeaseLost(_)) => return Err(e),
            Err(e) => warn!(token = %entry.token, error = %e, "waiting entry renewal failed"),
        }

        match queue.peek_head().await {
            Ok(Some(head)) if head.lease_id == entry.lease_id => {
                let waited = started.elapsed();
                telemetry::record_slot_acquired(entry.token.as_str(), waited.as_secs_f64());
                return Ok(current);
            }
            Ok(head) => {
                trace!(
                    token = %entry.token,
                    head = ?head.map(|h| h.token),
                    "not at head yet"
                );
            }
            Err(e) => warn!(token = %entry.token, error = %e, "queue head query failed"),
        }

        if started.elapsed() >= config.max_wait() {
            withdraw(queue, &current).await;
            return Err(PkaqError::WaitTimeout {
                what: "admission queue head",
                waited: started.elapsed(),
            });
        }

        tokio::select! {
            _ = shutdown.cancelled() => {
                withdraw(queue, &current).await;
                return Err(PkaqError::Shutdown);
            }
            _ = tokio::time::sleep(config.poll_interval()) => {}
        }
    }
}

async fn withdraw<Q: AdmissionQueue + ?Sized>(queue: &Q, entry: &QueueEntry) {
    match queue.release(entry.lease_id).await {
        Ok(true) => debug!(token = %entry.token, lease = %entry.lease_id, "queue entry withdrawn"),
        Ok(false) => {}
        Err(e) => warn!(token = %entry.token, error = %e, "failed to withdraw queue entry"),
    }
}

/// Enqueue `token` and wait until it holds the slot.
pub async fn acquire_slot<Q>(
    queue: Arc<Q>,
    token: &JobToken,
    holder: &str,
    config: &AdmissionConfig,
    shutdown: &ShutdownToken,
) -> Result<SlotHold<Q>>
where
    Q: AdmissionQueue + ?Sized + 'static,
{
    let entry = queue.enqueue(token, holder, config.lease_ttl()).await?;
    let head = wait_for_head(queue.as_ref(), &entry, config, shutdown).await?;
    Ok(SlotHold::start(queue, head, config))
}

/// The compute slot, held while its entry stays at the head of the queue.
///
/// A background task renews the entry until [`SlotHold::release`] is called.
/// Failed renewals are retried while the lease is still valid. Once the
/// entry is gone, or cannot be renewed before it expires, the renewer stops
/// and [`SlotHold::lease_lost`] fires; the holder must stop its work then,
/// because the next waiter may take the slot.
///
/// Dropping the hold without releasing stops the renewals, so the housekeeper
/// eventually evicts the entry.
pub struct SlotHold<Q: AdmissionQueue + ?Sized + 'static> {
    queue: Arc<Q>,
    entry: QueueEntry,
    lost: ShutdownToken,
    cancel_tx: mpsc::Sender<()>,
    renewer: Option<JoinHandle<()>>,
}

impl<Q: AdmissionQueue + ?Sized + 'static> SlotHold<Q> {
    pub fn start(queue: Arc<Q>, entry: QueueEntry, config: &AdmissionConfig) -> Self {
        let (cancel_tx, mut cancel_rx) = mpsc::channel::<()>(1);
        let lost = ShutdownToken::new();

        let renewer_q = Arc::clone(&queue);
        let renewer_lost = lost.clone();
        let lease_id = entry.lease_id;
        let holder = entry.holder.clone();
        let token = entry.token.clone();
        let ttl = config.lease_ttl();
        let renew_fraction = config.renew_at_fraction.clamp(0.0, 1.0);
        let renew_margin = Duration::from_millis(config.renew_min_margin_ms);
        let retry_delay = config.poll_interval().min(renew_margin).max(Duration::from_millis(1));
        // Tracked on the local clock; the entry's own timestamps may come
        // from another host.
        let mut local_expires_at = Utc::now() + ttl;

        let renewer = tokio::spawn(async move {
            let mut retry_after: Option<Duration> = None;
            loop {
                let now = Utc::now();
                let mut sleep_dur = Duration::from_millis(500);
                if let Some(delay) = retry_after.take() {
                    sleep_dur = delay;
                } else if local_expires_at > now {
                    let ttl_total = ttl.to_std().unwrap_or(Duration::from_secs(30));
                    let target = ttl_total.mul_f32(1.0 - renew_fraction);
                    let remaining = (local_expires_at - now).to_std().unwrap_or(Duration::ZERO);
                    sleep_dur = if remaining > target {
                        remaining - target
                    } else if remaining > renew_margin {
                        remaining - renew_margin
                    } else {
                        Duration::ZERO
                    };
                }

                tokio::select! {
                    _ = tokio::time::sleep(sleep_dur) => {}
                    _ = cancel_rx.recv() => break,
                }

                let sent_at = Utc::now();
                match renewer_q
                    .renew(LeaseRenewal {
                        lease_id,
                        holder: holder.clone(),
                        ttl,
                    })
                    .await
                {
                    Ok(updated) => {
                        local_expires_at = sent_at + ttl;
                        trace!(token = %token, renewals = updated.renewals, "slot lease renewed");
                    }
                    Err(PkaqError::LeaseLost(_)) => {
                        error!(token = %token, lease = %lease_id, "slot lease lost");
                        renewer_lost.cancel();
                        break;
                    }
                    Err(e) => {
                        let remaining = (local_expires_at - Utc::now())
                            .to_std()
                            .unwrap_or(Duration::ZERO);
                        if remaining <= renew_margin {
                            error!(
                                token = %token,
                                lease = %lease_id,
                                error = %e,
                                "slot lease could not be renewed before expiry"
                            );
                            renewer_lost.cancel();
                            break;
                        }
                        warn!(token = %token, lease = %lease_id, error = %e, "slot lease renewal failed, retrying");
                        retry_after = Some(retry_delay.min(remaining - renew_margin));
                    }
                }
            }
        });

        Self {
            queue,
            entry,
            lost,
            cancel_tx,
            renewer: Some(renewer),
        }
    }

    pub fn entry(&self) -> &QueueEntry {
        &self.entry
    }

    /// Signal that fires when the slot can no longer be held.
    pub fn lease_lost(&self) -> ShutdownToken {
        self.lost.clone()
    }

    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    /// Stop renewing and remove the entry, handing the slot to the next token.
    ///
    /// Returns false if the entry was already gone.
    pub async fn release(mut self) -> Result<bool> {
        let _ = self.cancel_tx.try_send(());
        if let Some(renewer) = self.renewer.take() {
            let _ = renewer.await;
        }
        let removed = self.queue.release(self.entry.lease_id).await?;
        if removed {
            info!(token = %self.entry.token, lease = %self.entry.lease_id, "slot released");
        } else {
            warn!(token = %self.entry.token, lease = %self.entry.lease_id, "slot entry was already gone");
        }
        Ok(removed)
    }
}

impl<Q: AdmissionQueue + ?Sized + 'static> Drop for SlotHold<Q> {
    fn drop(&mut self) {
        if let Some(renewer) = self.renewer.take() {
            renewer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryAdmissionQueue;

    fn fast_config() -> AdmissionConfig {
        AdmissionConfig {
            poll_interval_ms: 10,
            max_wait_ms: 200,
            lease_ttl_ms: 1_000,
            renew_at_fraction: 0.5,
            renew_min_margin_ms: 100,
            housekeeper_interval_ms: 50,
        }
    }

    #[tokio::test]
    async fn test_head_entry_acquires_immediately() {
        let queue = Arc::new(InMemoryAdmissionQueue::new());
        let shutdown = ShutdownToken::new();
        let hold = acquire_slot(queue.clone(), &"a".into(), "w1", &fast_config(), &shutdown)
            .await
            .unwrap();
        assert_eq!(hold.entry().token.as_str(), "a");
        assert!(hold.release().await.unwrap());
        assert_eq!(queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_wait_times_out_and_withdraws() {
        let queue = Arc::new(InMemoryAdmissionQueue::new());
        let shutdown = ShutdownToken::new();
        let config = fast_config();
        queue.enqueue(&"blocker".into(), "w0", config.lease_ttl()).await.unwrap();

        let err = acquire_slot(queue.clone(), &"b".into(), "w1", &config, &shutdown)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, PkaqError::WaitTimeout { .. }));
        assert!(!queue.contains(&"b".into()).await.unwrap());
        assert!(queue.contains(&"blocker".into()).await.unwrap());
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_wait() {
        let queue = Arc::new(InMemoryAdmissionQueue::new());
        let shutdown = ShutdownToken::new();
        let mut config = fast_config();
        config.max_wait_ms = 60_000;
        queue.enqueue(&"blocker".into(), "w0", config.lease_ttl()).await.unwrap();

        let waiter = {
            let queue = queue.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                acquire_slot(queue, &"b".into(), "w1", &config, &shutdown).await.err()
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.cancel();

        let err = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(err, Some(PkaqError::Shutdown)));
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_hold_keeps_entry_alive_past_ttl() {
        let queue = Arc::new(InMemoryAdmissionQueue::new());
        let shutdown = ShutdownToken::new();
        let mut config = fast_config();
        config.lease_ttl_ms = 200;
        config.renew_min_margin_ms = 50;

        let hold = acquire_slot(queue.clone(), &"a".into(), "w1", &config, &shutdown)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        use crate::queue::LeaseExpiryScanner;
        assert!(queue.evict_expired().await.unwrap().is_empty());
        let renewed = queue.peek_head().await.unwrap().unwrap();
        assert!(renewed.renewals > 0);
        hold.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_evicted_waiter_loses_lease() {
        let queue = Arc::new(InMemoryAdmissionQueue::new());
        let shutdown = ShutdownToken::new();
        let config = fast_config();
        let blocker = queue.enqueue(&"blocker".into(), "w0", config.lease_ttl()).await.unwrap();
        let entry = queue.enqueue(&"b".into(), "w1", config.lease_ttl()).await.unwrap();
        queue.release(entry.lease_id).await.unwrap();

        let err = wait_for_head(queue.as_ref(), &entry, &config, &shutdown)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, PkaqError::LeaseLost(id) if id == entry.lease_id));
        queue.release(blocker.lease_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_hold_signals_loss_when_entry_removed() {
        let queue = Arc::new(InMemoryAdmissionQueue::new());
        let shutdown = ShutdownToken::new();
        let mut config = fast_config();
        config.lease_ttl_ms = 200;
        config.renew_min_margin_ms = 50;

        let hold = acquire_slot(queue.clone(), &"a".into(), "w1", &config, &shutdown)
            .await
            .unwrap();
        assert!(!hold.is_lost());
        queue.remove_token(&"a".into()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), hold.lease_lost().cancelled())
            .await
            .unwrap();
        assert!(hold.is_lost());
        assert!(!hold.release().await.unwrap());
    }
}
