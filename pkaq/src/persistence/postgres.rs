use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::is_unique_violation;
use crate::config::PersistenceConfig;
use crate::error::{PkaqError, Result};
use crate::job::{JobId, JobToken, Provenance, ProteinId, SubmissionMeta};
use crate::lease::{LeaseId, LeaseRenewal, QueueEntry};
use crate::params::ResolvedParameters;
use crate::queue::{AdmissionQueue, LeaseExpiryScanner};
use crate::store::{
    sort_pkas, InputRecord, JobOutcome, JobRecord, LifecycleStore, ProteinCounts, ProteinRecord,
    ResultRecord, SitePka, SubmissionSummary,
};

const SCHEMA: &str = include_str!("../../migrations/0001_pkaq_schema.sql");

/// Open a connection pool with the configured limits.
pub async fn connect(config: &PersistenceConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(StdDuration::from_secs(config.acquire_timeout_seconds))
        .connect(&config.connection_string)
        .await?;
    Ok(pool)
}

/// Create the pkaq tables if they do not exist yet.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    Ok(())
}

/// PostgreSQL-backed admission queue.
///
/// FIFO order is the insertion sequence. The queue is shared by every
/// process using the same database, which is what makes the single compute
/// slot hold across hosts.
#[derive(Clone, Debug)]
pub struct PostgresAdmissionQueue {
    pool: PgPool,
}

impl PostgresAdmissionQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn entry_from_row(row: &PgRow) -> Result<QueueEntry> {
    let renewals: i32 = row.try_get("renewals")?;
    Ok(QueueEntry {
        token: JobToken::new(row.try_get::<String, _>("token")?),
        lease_id: LeaseId(row.try_get::<Uuid, _>("lease_id")?),
        holder: row.try_get("holder")?,
        enqueued_at: row.try_get("enqueued_at")?,
        expires_at: row.try_get("expires_at")?,
        renewals: renewals.max(0) as u32,
    })
}

#[async_trait]
impl AdmissionQueue for PostgresAdmissionQueue {
    async fn enqueue(&self, token: &JobToken, holder: &str, ttl: Duration) -> Result<QueueEntry> {
        // Timestamps come from the database clock, the same one renewal and
        // eviction compare against.
        let row = sqlx::query(
            r#"
            INSERT INTO pkaq_queue (lease_id, token, holder, enqueued_at, expires_at, renewals)
            VALUES ($1, $2, $3, NOW(), NOW() + ($4::bigint) * INTERVAL '1 millisecond', 0)
            RETURNING lease_id, token, holder, enqueued_at, expires_at, renewals
            "#,
        )
        .bind(LeaseId::new().0)
        .bind(token.as_str())
        .bind(holder)
        .bind(ttl.num_milliseconds())
        .fetch_one(&self.pool)
        .await?;
        let entry = entry_from_row(&row)?;
        debug!(token = %token, lease = %entry.lease_id, "enqueued");
        Ok(entry)
    }

    async fn peek_head(&self) -> Result<Option<QueueEntry>> {
        let row = sqlx::query(
            r#"
            SELECT lease_id, token, holder, enqueued_at, expires_at, renewals
            FROM pkaq_queue
            ORDER BY seq ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    async fn dequeue(&self) -> Result<Option<QueueEntry>> {
        let row = sqlx::query(
            r#"
            DELETE FROM pkaq_queue
            WHERE seq = (
                SELECT seq FROM pkaq_queue
                ORDER BY seq ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING lease_id, token, holder, enqueued_at, expires_at, renewals
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    async fn release(&self, lease_id: LeaseId) -> Result<bool> {
        let res = sqlx::query("DELETE FROM pkaq_queue WHERE lease_id = $1")
            .bind(lease_id.0)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn contains(&self, token: &JobToken) -> Result<bool> {
        let row = sqlx::query(
            "SELECT EXISTS (SELECT 1 FROM pkaq_queue WHERE token = $1) AS present",
        )
        .bind(token.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("present")?)
    }

    async fn renew(&self, renewal: LeaseRenewal) -> Result<QueueEntry> {
        let row = sqlx::query(
            r#"
            UPDATE pkaq_queue
            SET expires_at = GREATEST(expires_at, NOW() + ($1::bigint) * INTERVAL '1 millisecond'),
                renewals = renewals + 1
            WHERE lease_id = $2
              AND holder = $3
            RETURNING lease_id, token, holder, enqueued_at, expires_at, renewals
            "#,
        )
        .bind(renewal.ttl.num_milliseconds())
        .bind(renewal.lease_id.0)
        .bind(&renewal.holder)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => entry_from_row(&row),
            None => {
                warn!(lease = %renewal.lease_id, "renewal failed: entry not found");
                Err(PkaqError::LeaseLost(renewal.lease_id))
            }
        }
    }

    async fn len(&self) -> Result<usize> {
        let row = sqlx::query("SELECT COUNT(*)::bigint AS count FROM pkaq_queue")
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get("count")?;
        Ok(count as usize)
    }

    async fn entries(&self) -> Result<Vec<QueueEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT lease_id, token, holder, enqueued_at, expires_at, renewals
            FROM pkaq_queue
            ORDER BY seq ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn remove_token(&self, token: &JobToken) -> Result<usize> {
        let res = sqlx::query("DELETE FROM pkaq_queue WHERE token = $1")
            .bind(token.as_str())
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() as usize)
    }
}

#[async_trait]
impl LeaseExpiryScanner for PostgresAdmissionQueue {
    async fn evict_expired(&self) -> Result<Vec<QueueEntry>> {
        let rows = sqlx::query(
            r#"
            DELETE FROM pkaq_queue
            WHERE expires_at < NOW()
            RETURNING seq, lease_id, token, holder, enqueued_at, expires_at, renewals
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut evicted: Vec<(i64, QueueEntry)> = Vec::with_capacity(rows.len());
        for row in &rows {
            evicted.push((row.try_get("seq")?, entry_from_row(row)?));
        }
        evicted.sort_by_key(|(seq, _)| *seq);
        Ok(evicted.into_iter().map(|(_, entry)| entry).collect())
    }
}

/// PostgreSQL-backed lifecycle store.
#[derive(Clone, Debug)]
pub struct PostgresLifecycleStore {
    pool: PgPool,
}

impl PostgresLifecycleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn job_from_row(row: &PgRow) -> Result<JobRecord> {
    Ok(JobRecord {
        id: JobId(row.try_get("id")?),
        token: JobToken::new(row.try_get::<String, _>("token")?),
        submitted_at: row.try_get("submitted_at")?,
        finished_at: row.try_get("finished_at")?,
        email: row.try_get("email")?,
        provenance: Provenance {
            ip: row.try_get("ip")?,
            country: row.try_get("country")?,
            city: row.try_get("city")?,
        },
    })
}

fn result_from_row(row: &PgRow) -> Result<ResultRecord> {
    Ok(ResultRecord {
        job_id: JobId(row.try_get("job_id")?),
        tit_x: row.try_get("tit_x")?,
        tit_y: row.try_get("tit_y")?,
        isoelectric_point: row.try_get("isoelectric_point")?,
        output_structure: row.try_get("output_structure")?,
        output_structure_ph: row.try_get("output_structure_ph")?,
        error: row.try_get("error")?,
        recorded_at: row.try_get("recorded_at")?,
    })
}

#[async_trait]
impl LifecycleStore for PostgresLifecycleStore {
    async fn create_job(&self, meta: &SubmissionMeta) -> Result<JobId> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO pkaq_jobs (token, submitted_at, email, ip, country, city)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(meta.token.as_str())
        .bind(meta.submitted_at)
        .bind(&meta.email)
        .bind(&meta.provenance.ip)
        .bind(&meta.provenance.country)
        .bind(&meta.provenance.city)
        .fetch_one(&self.pool)
        .await;

        match inserted {
            Ok(row) => Ok(JobId(row.try_get("id")?)),
            Err(e) if is_unique_violation(&e) => Err(PkaqError::Store(format!(
                "token {} already in use",
                meta.token
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn resolve_or_create_protein(
        &self,
        natural_key: Option<&str>,
        structure: Option<&str>,
        counts: ProteinCounts,
    ) -> Result<ProteinId> {
        if let Some(key) = natural_key {
            // Concurrent creators converge on one row through the unique key.
            let row = sqlx::query(
                r#"
                INSERT INTO pkaq_proteins (natural_key, structure, nchains, nsites)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (natural_key) DO UPDATE SET natural_key = EXCLUDED.natural_key
                RETURNING id
                "#,
            )
            .bind(key)
            .bind(structure)
            .bind(counts.nchains)
            .bind(counts.nsites)
            .fetch_one(&self.pool)
            .await?;
            return Ok(ProteinId(row.try_get("id")?));
        }

        let row = sqlx::query(
            r#"
            INSERT INTO pkaq_proteins (natural_key, structure, nchains, nsites)
            VALUES (NULL, $1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(structure)
        .bind(counts.nchains)
        .bind(counts.nsites)
        .fetch_one(&self.pool)
        .await?;
        Ok(ProteinId(row.try_get("id")?))
    }

    async fn record_result(
        &self,
        job_id: JobId,
        protein_id: ProteinId,
        outcome: &JobOutcome,
    ) -> Result<()> {
        let record = ResultRecord::from_outcome(job_id, outcome);
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO pkaq_results (
                job_id, tit_x, tit_y, isoelectric_point,
                output_structure, output_structure_ph, error, recorded_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (job_id) DO NOTHING
            "#,
        )
        .bind(job_id.0)
        .bind(&record.tit_x)
        .bind(&record.tit_y)
        .bind(record.isoelectric_point)
        .bind(&record.output_structure)
        .bind(record.output_structure_ph)
        .bind(&record.error)
        .bind(record.recorded_at)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            if let Err(e) = tx.rollback().await {
                error!(job_id = %job_id, error = %e, "rollback after duplicate result failed");
            }
            return Err(PkaqError::ResultAlreadyRecorded(job_id));
        }

        let parameters = match outcome {
            JobOutcome::Succeeded(report) => Some(serde_json::to_value(&report.parameters)?),
            JobOutcome::Failed { .. } => None,
        };
        sqlx::query(
            r#"
            INSERT INTO pkaq_inputs (job_id, protein_id, parameters)
            VALUES ($1, $2, $3)
            ON CONFLICT (job_id) DO NOTHING
            "#,
        )
        .bind(job_id.0)
        .bind(protein_id.0)
        .bind(parameters)
        .execute(&mut *tx)
        .await?;

        if let JobOutcome::Succeeded(report) = outcome {
            for site in &report.pkas {
                let residue = sqlx::query(
                    r#"
                    INSERT INTO pkaq_residues (protein_id, chain, res_name, res_number)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (protein_id, chain, res_name, res_number)
                        DO UPDATE SET chain = EXCLUDED.chain
                    RETURNING id
                    "#,
                )
                .bind(protein_id.0)
                .bind(&site.chain)
                .bind(&site.res_name)
                .bind(site.res_number)
                .fetch_one(&mut *tx)
                .await?;
                let residue_id: i64 = residue.try_get("id")?;

                sqlx::query(
                    r#"
                    INSERT INTO pkaq_pkas (job_id, residue_id, pka)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (job_id, residue_id) DO NOTHING
                    "#,
                )
                .bind(job_id.0)
                .bind(residue_id)
                .bind(site.pka)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        debug!(job_id = %job_id, outcome = outcome.label(), "result recorded");
        Ok(())
    }

    async fn finalize(&self, job_id: JobId) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE pkaq_jobs
            SET finished_at = NOW()
            WHERE id = $1
              AND finished_at IS NULL
            "#,
        )
        .bind(job_id.0)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() > 0 {
            return Ok(true);
        }

        let exists = sqlx::query("SELECT 1 AS one FROM pkaq_jobs WHERE id = $1")
            .bind(job_id.0)
            .fetch_optional(&self.pool)
            .await?;
        match exists {
            Some(_) => Ok(false),
            None => Err(PkaqError::Store(format!("no job with id {}", job_id))),
        }
    }

    async fn find_job(&self, token: &JobToken) -> Result<Option<JobRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, token, submitted_at, finished_at, email, ip, country, city
            FROM pkaq_jobs
            WHERE token = $1
            "#,
        )
        .bind(token.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn result_for(&self, job_id: JobId) -> Result<Option<ResultRecord>> {
        let row = sqlx::query(
            r#"
            SELECT job_id, tit_x, tit_y, isoelectric_point, output_structure,
                   output_structure_ph, error, recorded_at
            FROM pkaq_results
            WHERE job_id = $1
            "#,
        )
        .bind(job_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(result_from_row).transpose()
    }

    async fn input_for(&self, job_id: JobId) -> Result<Option<InputRecord>> {
        let row = sqlx::query("SELECT job_id, protein_id, parameters FROM pkaq_inputs WHERE job_id = $1")
            .bind(job_id.0)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let parameters: Option<serde_json::Value> = row.try_get("parameters")?;
        let parameters = parameters
            .map(serde_json::from_value::<ResolvedParameters>)
            .transpose()?;
        Ok(Some(InputRecord {
            job_id: JobId(row.try_get("job_id")?),
            protein_id: ProteinId(row.try_get("protein_id")?),
            parameters,
        }))
    }

    async fn protein(&self, protein_id: ProteinId) -> Result<Option<ProteinRecord>> {
        let row = sqlx::query(
            "SELECT id, natural_key, structure, nchains, nsites FROM pkaq_proteins WHERE id = $1",
        )
        .bind(protein_id.0)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(ProteinRecord {
            id: ProteinId(row.try_get("id")?),
            natural_key: row.try_get("natural_key")?,
            structure: row.try_get("structure")?,
            counts: ProteinCounts {
                nchains: row.try_get("nchains")?,
                nsites: row.try_get("nsites")?,
            },
        }))
    }

    async fn pkas_for(&self, job_id: JobId) -> Result<Vec<SitePka>> {
        let rows = sqlx::query(
            r#"
            SELECT r.chain, r.res_name, r.res_number, p.pka
            FROM pkaq_pkas p
            JOIN pkaq_residues r ON r.id = p.residue_id
            WHERE p.job_id = $1
            "#,
        )
        .bind(job_id.0)
        .fetch_all(&self.pool)
        .await?;

        let mut pkas = rows
            .iter()
            .map(|row| {
                Ok(SitePka {
                    chain: row.try_get("chain")?,
                    res_name: row.try_get("res_name")?,
                    res_number: row.try_get("res_number")?,
                    pka: row.try_get("pka")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        sort_pkas(&mut pkas);
        Ok(pkas)
    }

    async fn recent_submissions(&self, limit: usize) -> Result<Vec<SubmissionSummary>> {
        let queued_rows = sqlx::query(
            r#"
            SELECT j.id, j.token, j.submitted_at
            FROM pkaq_jobs j
            WHERE NOT EXISTS (SELECT 1 FROM pkaq_results r WHERE r.job_id = j.id)
            ORDER BY j.id DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let finished_rows = sqlx::query(
            r#"
            SELECT j.id, j.token, j.submitted_at, p.natural_key
            FROM pkaq_inputs i
            JOIN pkaq_jobs j ON j.id = i.job_id
            LEFT JOIN pkaq_proteins p ON p.id = i.protein_id
            ORDER BY j.token DESC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(queued_rows.len() + finished_rows.len());
        for row in &queued_rows {
            out.push(SubmissionSummary {
                job_id: JobId(row.try_get("id")?),
                token: JobToken::new(row.try_get::<String, _>("token")?),
                submitted_at: row.try_get::<DateTime<Utc>, _>("submitted_at")?,
                protein_name: None,
                queued: true,
            });
        }
        for row in &finished_rows {
            out.push(SubmissionSummary {
                job_id: JobId(row.try_get("id")?),
                token: JobToken::new(row.try_get::<String, _>("token")?),
                submitted_at: row.try_get::<DateTime<Utc>, _>("submitted_at")?,
                protein_name: row.try_get("natural_key")?,
                queued: false,
            });
        }
        Ok(out)
    }
}
