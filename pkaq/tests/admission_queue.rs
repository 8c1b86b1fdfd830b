//! Admission queue ordering and the slot protocol built on it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pkaq::*;
use pkaq_testkit::{fast_admission, FlakyQueue};
use tokio::time::timeout;

fn ttl() -> chrono::Duration {
    chrono::Duration::seconds(30)
}

#[tokio::test]
async fn test_head_follows_arrival_order() {
    let queue = InMemoryAdmissionQueue::new();
    for token in ["a", "b", "c"] {
        queue.enqueue(&token.into(), "w", ttl()).await.unwrap();
    }

    let head = |q: Option<QueueEntry>| q.map(|e| e.token.as_str().to_string());
    assert_eq!(head(queue.peek_head().await.unwrap()).as_deref(), Some("a"));
    queue.dequeue().await.unwrap();
    assert_eq!(head(queue.peek_head().await.unwrap()).as_deref(), Some("b"));
    queue.dequeue().await.unwrap();
    assert_eq!(head(queue.peek_head().await.unwrap()).as_deref(), Some("c"));
    queue.dequeue().await.unwrap();
    assert!(queue.peek_head().await.unwrap().is_none());
    assert!(queue.dequeue().await.unwrap().is_none());
}

#[tokio::test]
async fn test_waiters_take_the_slot_one_at_a_time_in_order() {
    let queue = Arc::new(InMemoryAdmissionQueue::new());
    let config = fast_admission();
    let shutdown = ShutdownToken::new();
    let order = Arc::new(Mutex::new(Vec::new()));
    let active = Arc::new(AtomicUsize::new(0));
    let max_active = Arc::new(AtomicUsize::new(0));

    let mut entries = Vec::new();
    for token in ["first", "second", "third", "fourth"] {
        entries.push(queue.enqueue(&token.into(), token, config.lease_ttl()).await.unwrap());
    }

    // Spawn in reverse so arrival order, not spawn order, decides.
    let mut handles = Vec::new();
    for entry in entries.into_iter().rev() {
        let queue = Arc::clone(&queue);
        let config = config.clone();
        let shutdown = shutdown.clone();
        let order = Arc::clone(&order);
        let active = Arc::clone(&active);
        let max_active = Arc::clone(&max_active);
        handles.push(tokio::spawn(async move {
            let head = wait_for_head(queue.as_ref(), &entry, &config, &shutdown)
                .await
                .unwrap();
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            max_active.fetch_max(now, Ordering::SeqCst);
            order.lock().push(head.token.as_str().to_string());
            tokio::time::sleep(Duration::from_millis(30)).await;
            active.fetch_sub(1, Ordering::SeqCst);
            assert!(queue.release(head.lease_id).await.unwrap());
        }));
    }

    for handle in handles {
        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }

    assert_eq!(*order.lock(), vec!["first", "second", "third", "fourth"]);
    assert_eq!(max_active.load(Ordering::SeqCst), 1);
    assert_eq!(queue.len().await.unwrap(), 0);
}

#[tokio::test]
async fn test_abandoned_head_is_evicted_and_next_waiter_proceeds() {
    let queue = Arc::new(InMemoryAdmissionQueue::new());
    let config = fast_admission();
    let shutdown = ShutdownToken::new();

    // A holder that crashed right after enqueueing never renews.
    let crashed = queue
        .enqueue(&"crashed".into(), "gone", chrono::Duration::milliseconds(100))
        .await
        .unwrap();

    let waiter = {
        let queue = Arc::clone(&queue);
        let config = config.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            acquire_slot(queue, &"next".into(), "live", &config, &shutdown).await
        })
    };

    let evicted = timeout(Duration::from_secs(5), async {
        loop {
            let evicted = queue.evict_expired().await.unwrap();
            if !evicted.is_empty() {
                return evicted;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(evicted.len(), 1);
    assert_eq!(evicted[0].lease_id, crashed.lease_id);

    let hold = timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(hold.entry().token.as_str(), "next");
    assert!(hold.release().await.unwrap());
    assert!(queue.peek_head().await.unwrap().is_none());
}

#[tokio::test]
async fn test_out_of_band_removal_fails_the_waiter() {
    let queue = Arc::new(InMemoryAdmissionQueue::new());
    let config = fast_admission();
    let shutdown = ShutdownToken::new();

    let blocker = queue.enqueue(&"blocker".into(), "b", ttl()).await.unwrap();
    let stuck = queue.enqueue(&"stuck".into(), "s", config.lease_ttl()).await.unwrap();

    let waiter = {
        let queue = Arc::clone(&queue);
        let config = config.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { wait_for_head(queue.as_ref(), &stuck, &config, &shutdown).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(queue.remove_token(&"stuck".into()).await.unwrap(), 1);

    let err = timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, PkaqError::LeaseLost(_)), "unexpected error: {err}");
    assert_eq!(queue.peek_head().await.unwrap().unwrap().lease_id, blocker.lease_id);
}

#[tokio::test]
async fn test_contains_tracks_queue_membership() {
    let queue = InMemoryAdmissionQueue::new();
    let entry = queue.enqueue(&"t".into(), "w", ttl()).await.unwrap();
    assert!(queue.contains(&"t".into()).await.unwrap());
    assert!(queue.release(entry.lease_id).await.unwrap());
    assert!(!queue.contains(&"t".into()).await.unwrap());
    assert!(!queue.release(entry.lease_id).await.unwrap());
}

#[tokio::test]
async fn test_holder_keeps_slot_through_a_failed_renewal() {
    let queue = Arc::new(FlakyQueue::new());
    let config = fast_admission();
    let shutdown = ShutdownToken::new();

    let hold = acquire_slot(Arc::clone(&queue), &"a".into(), "wa", &config, &shutdown)
        .await
        .unwrap();
    queue.fail_renewals("a", 1);

    let waiter = {
        let queue = Arc::clone(&queue);
        let config = config.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            acquire_slot(queue, &"b".into(), "wb", &config, &shutdown).await
        })
    };

    // Two full lease periods with the housekeeper sweeping.
    for _ in 0..40 {
        queue.evict_expired().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(queue.failed_renewals(), 1);
    assert!(!hold.is_lost());
    assert!(!waiter.is_finished(), "second waiter took the slot while it was held");
    assert_eq!(queue.peek_head().await.unwrap().unwrap().token.as_str(), "a");

    assert!(hold.release().await.unwrap());
    let next = timeout(Duration::from_secs(2), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(next.entry().token.as_str(), "b");
    next.release().await.unwrap();
}

#[tokio::test]
async fn test_waiter_retries_failed_renewals() {
    let queue = Arc::new(FlakyQueue::new());
    let config = fast_admission();
    let shutdown = ShutdownToken::new();
    let blocker = queue
        .enqueue(&"blocker".into(), "w0", config.lease_ttl())
        .await
        .unwrap();
    queue.fail_renewals("b", 3);

    let waiter = {
        let queue = Arc::clone(&queue);
        let config = config.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            acquire_slot(queue, &"b".into(), "wb", &config, &shutdown).await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    queue.release(blocker.lease_id).await.unwrap();

    let hold = timeout(Duration::from_secs(2), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(hold.entry().token.as_str(), "b");
    assert_eq!(queue.failed_renewals(), 3);
    hold.release().await.unwrap();
}
