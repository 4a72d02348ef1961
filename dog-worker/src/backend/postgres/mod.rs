//! Postgres-backed job store.
//!
//! Each `process` call claims, executes and commits inside one transaction.
//! The row lock taken by `FOR UPDATE SKIP LOCKED` is the only thing keeping
//! two workers off the same job; if a worker dies mid-job its connection
//! drops, the transaction aborts and the row becomes claimable again.

mod config;
mod schema;

use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub use config::PgConfig;

use crate::error::{WorkerError, WorkerResult};
use crate::job::{panic_message, Job, JobId, JobStatus};
use crate::processor::{dedup_ids, DeadJobManager, JobExecutor, JobProcessor, JobTypeStats};

/// Keeps each insert statement well under the bind parameter limit
const ENQUEUE_BATCH: usize = 1000;

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    #[sqlx(rename = "type")]
    job_type: String,
    run_at: DateTime<Utc>,
    payload: Vec<u8>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    attempts_done: i32,
    last_attempt_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl JobRow {
    fn into_job(self, status: JobStatus) -> Job {
        Job {
            id: JobId::from_uuid(self.id),
            job_type: self.job_type,
            payload: self.payload,
            run_at: self.run_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
            attempts_done: u32::try_from(self.attempts_done).unwrap_or(0),
            status,
            last_attempt_at: self.last_attempt_at,
            last_error: self.last_error.unwrap_or_default(),
        }
    }
}

/// Job store backed by the `jobs_queue` and `dead_jobs` tables.
#[derive(Clone)]
pub struct PgProcessor {
    pool: PgPool,
}

impl PgProcessor {
    /// Open a connection pool and verify the database is reachable.
    #[instrument(skip(cfg), fields(host = %cfg.host, db = %cfg.name))]
    pub async fn connect(cfg: &PgConfig) -> WorkerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_open_conns)
            .min_connections(cfg.max_idle_conns.min(cfg.max_open_conns))
            .idle_timeout(cfg.conn_max_idle_time)
            .max_lifetime(cfg.conn_max_lifetime_with_jitter())
            .connect_with(cfg.connect_options())
            .await?;

        info!("Connected to job store");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the job tables if they do not exist.
    pub async fn migrate(&self) -> WorkerResult<()> {
        for statement in schema::MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("Job tables are up to date");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl JobProcessor for PgProcessor {
    async fn enqueue(&self, jobs: Vec<Job>) -> WorkerResult<()> {
        if jobs.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for chunk in jobs.chunks(ENQUEUE_BATCH) {
            let mut query: QueryBuilder<Postgres> = QueryBuilder::new(schema::INSERT_JOBS_PREFIX);
            query.push_values(chunk, |mut row, job| {
                row.push_bind(*job.id.as_uuid())
                    .push_bind(job.job_type.clone())
                    .push_bind(job.run_at)
                    .push_bind(job.payload.clone())
                    .push_bind(job.created_at)
                    .push_bind(job.updated_at)
                    .push_bind(attempts_to_db(job.attempts_done))
                    .push_bind(job.last_attempt_at)
                    .push_bind(non_empty(&job.last_error));
            });
            query.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;

        debug!(count = jobs.len(), "Enqueued jobs");
        Ok(())
    }

    async fn process(&self, types: &[String], executor: JobExecutor) -> WorkerResult<bool> {
        let mut tx = self.pool.begin().await?;

        let row: Option<JobRow> = sqlx::query_as(schema::PICKUP_JOB)
            .bind(types.to_vec())
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(false);
        };

        let job = row.into_job(JobStatus::Pending);
        let id = *job.id.as_uuid();
        debug!(job_id = %id, job_type = %job.job_type, "Claimed job");

        let outcome = match AssertUnwindSafe(executor(job)).catch_unwind().await {
            Ok(job) => job,
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                warn!(job_id = %id, "Job executor panicked, rolling back: {}", msg);
                tx.rollback().await?;
                return Err(WorkerError::ExecutorPanic(msg));
            }
        };

        match outcome.status {
            JobStatus::Done => {
                let res = sqlx::query(schema::DELETE_JOB)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                expect_one_row(res.rows_affected(), "delete", id)?;
            }
            JobStatus::Dead => {
                sqlx::query(schema::INSERT_DEAD_JOB)
                    .bind(id)
                    .bind(&outcome.job_type)
                    .bind(&outcome.payload)
                    .bind(outcome.created_at)
                    .bind(outcome.updated_at)
                    .bind(attempts_to_db(outcome.attempts_done))
                    .bind(outcome.last_attempt_at)
                    .bind(non_empty(&outcome.last_error))
                    .execute(&mut *tx)
                    .await?;

                let res = sqlx::query(schema::DELETE_JOB)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                expect_one_row(res.rows_affected(), "delete", id)?;
            }
            JobStatus::Pending => {
                let res = sqlx::query(schema::UPDATE_JOB_RETRY)
                    .bind(id)
                    .bind(outcome.run_at)
                    .bind(outcome.updated_at)
                    .bind(non_empty(&outcome.last_error))
                    .bind(outcome.last_attempt_at)
                    .execute(&mut *tx)
                    .await?;
                expect_one_row(res.rows_affected(), "update", id)?;
            }
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn stats(&self) -> WorkerResult<Vec<JobTypeStats>> {
        let rows: Vec<(String, i64, i64)> = sqlx::query_as(schema::JOB_STATS)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(job_type, active, dead)| JobTypeStats {
                job_type,
                active: u64::try_from(active).unwrap_or(0),
                dead: u64::try_from(dead).unwrap_or(0),
            })
            .collect())
    }
}

#[async_trait]
impl DeadJobManager for PgProcessor {
    async fn dead_jobs(&self, size: u32, offset: u32) -> WorkerResult<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(schema::DEAD_JOBS_PAGE)
            .bind(i64::from(size))
            .bind(i64::from(offset))
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(|row| row.into_job(JobStatus::Dead)).collect())
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn resurrect(&self, ids: &[JobId]) -> WorkerResult<()> {
        let ids: Vec<Uuid> = dedup_ids(ids).iter().map(|id| *id.as_uuid()).collect();
        if ids.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        let res = sqlx::query(schema::RESURRECT_JOBS)
            .bind(&ids)
            .execute(&mut *tx)
            .await?;

        if res.rows_affected() != ids.len() as u64 {
            tx.rollback().await?;
            return Err(WorkerError::JobNotFound(format!(
                "only {} of {} jobs are in the dead set",
                res.rows_affected(),
                ids.len()
            )));
        }

        tx.commit().await?;
        info!("Resurrected dead jobs");
        Ok(())
    }

    async fn clear_dead_jobs(&self, ids: &[JobId]) -> WorkerResult<()> {
        let ids: Vec<Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();
        if ids.is_empty() {
            return Ok(());
        }

        let res = sqlx::query(schema::CLEAR_DEAD_JOBS)
            .bind(&ids)
            .execute(&self.pool)
            .await?;
        info!(deleted = res.rows_affected(), "Cleared dead jobs");
        Ok(())
    }
}

fn attempts_to_db(attempts: u32) -> i32 {
    i32::try_from(attempts).unwrap_or(i32::MAX)
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

fn expect_one_row(affected: u64, op: &str, id: Uuid) -> WorkerResult<()> {
    if affected == 1 {
        Ok(())
    } else {
        Err(WorkerError::Store(format!(
            "{op} job {id}: expected 1 row affected, got {affected}"
        )))
    }
}
