//! PostgreSQL queue and store against a live database.
//!
//! Requires a running Postgres instance; the schema is applied by the tests.
//! Run with: `cargo test --test postgres --features postgres -- --ignored`

#![cfg(feature = "postgres")]

use pkaq::persistence::{connect, run_migrations, PostgresAdmissionQueue, PostgresLifecycleStore};
use pkaq::*;
use pkaq_testkit::sample_report;
use sqlx::PgPool;
use uuid::Uuid;

async fn pool() -> PgPool {
    let config = PersistenceConfig {
        connection_string: std::env::var("DATABASE_URL").expect("DATABASE_URL required"),
        max_connections: 4,
        ..PersistenceConfig::default()
    };
    let pool = connect(&config).await.expect("connect");
    run_migrations(&pool).await.expect("migrate");
    pool
}

fn unique(prefix: &str) -> String {
    format!("{prefix}{}", Uuid::new_v4().simple())
}

#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn queue_is_fifo_and_leases_expire() {
    let pool = pool().await;
    sqlx::query("DELETE FROM pkaq_queue")
        .execute(&pool)
        .await
        .expect("clear queue");
    let queue = PostgresAdmissionQueue::new(pool.clone());
    let ttl = chrono::Duration::seconds(30);

    let tokens: Vec<JobToken> = ["a", "b", "c"].iter().map(|p| unique(p).into()).collect();
    let mut entries = Vec::new();
    for token in &tokens {
        entries.push(queue.enqueue(token, "worker", ttl).await.expect("enqueue"));
    }
    assert_eq!(queue.len().await.unwrap(), 3);
    // Expiry is computed from the database clock at insert time.
    for entry in &entries {
        assert_eq!(entry.expires_at - entry.enqueued_at, ttl);
    }

    assert_eq!(queue.peek_head().await.unwrap().unwrap().token, tokens[0]);
    assert_eq!(queue.dequeue().await.unwrap().unwrap().token, tokens[0]);
    assert_eq!(queue.peek_head().await.unwrap().unwrap().token, tokens[1]);

    let err = queue
        .renew(LeaseRenewal {
            lease_id: entries[1].lease_id,
            holder: "someone-else".into(),
            ttl,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, PkaqError::LeaseLost(_)));

    let renewed = queue
        .renew(LeaseRenewal {
            lease_id: entries[1].lease_id,
            holder: "worker".into(),
            ttl,
        })
        .await
        .unwrap();
    assert_eq!(renewed.renewals, 1);

    // Shrink the second entry's lease to the past and sweep.
    sqlx::query("UPDATE pkaq_queue SET expires_at = NOW() - INTERVAL '1 second' WHERE lease_id = $1")
        .bind(entries[1].lease_id.0)
        .execute(&pool)
        .await
        .unwrap();
    let evicted = queue.evict_expired().await.unwrap();
    assert_eq!(evicted.len(), 1);
    assert_eq!(evicted[0].lease_id, entries[1].lease_id);
    assert_eq!(queue.peek_head().await.unwrap().unwrap().token, tokens[2]);

    assert!(queue.contains(&tokens[2]).await.unwrap());
    assert_eq!(queue.remove_token(&tokens[2]).await.unwrap(), 1);
    assert!(!queue.release(entries[2].lease_id).await.unwrap());
    assert_eq!(queue.len().await.unwrap(), 0);
}

#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn result_is_written_once() {
    let pool = pool().await;
    let store = PostgresLifecycleStore::new(pool);

    let token: JobToken = unique("job").into();
    let job_id = store.create_job(&SubmissionMeta::new(token.clone())).await.unwrap();
    assert!(store.create_job(&SubmissionMeta::new(token.clone())).await.is_err());

    let key = unique("pdb");
    let protein_id = store
        .resolve_or_create_protein(Some(&key), Some("ATOM"), ProteinCounts::default())
        .await
        .unwrap();
    let again = store
        .resolve_or_create_protein(Some(&key), None, ProteinCounts::default())
        .await
        .unwrap();
    assert_eq!(protein_id, again);

    store
        .record_result(job_id, protein_id, &JobOutcome::Succeeded(sample_report()))
        .await
        .unwrap();
    let err = store
        .record_result(job_id, protein_id, &JobOutcome::failed("Job cancelled due to time limit"))
        .await
        .unwrap_err();
    assert!(err.is_already_recorded());

    let result = store.result_for(job_id).await.unwrap().unwrap();
    assert!(result.error.is_none());
    assert_eq!(result.isoelectric_point, Some(7.25));
    let pkas = store.pkas_for(job_id).await.unwrap();
    let names: Vec<_> = pkas.iter().map(|p| p.res_name.as_str()).collect();
    assert_eq!(names, vec!["LYS", "GLU"]);

    assert!(store.finalize(job_id).await.unwrap());
    assert!(!store.finalize(job_id).await.unwrap());
    let job = store.find_job(&token).await.unwrap().unwrap();
    assert_eq!(job.id, job_id);
    assert!(job.finished_at.is_some());
}
