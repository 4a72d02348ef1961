use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{WorkerError, WorkerResult};
use crate::job::{panic_message, Job, JobId, JobStatus};
use crate::processor::{dedup_ids, DeadJobManager, JobExecutor, JobProcessor, JobTypeStats};

#[derive(Default)]
struct Tables {
    /// Ready set, ordered by ID
    ready: BTreeMap<JobId, Job>,
    /// Dead set, ordered by ID
    dead: BTreeMap<JobId, Job>,
    /// Ready rows currently held by a `process` call
    claimed: HashSet<JobId>,
}

/// In-process job store for tests, development and embedded use.
///
/// Claimed rows are skipped by concurrent `process` calls, mirroring
/// `FOR UPDATE SKIP LOCKED`. Nothing survives a restart.
#[derive(Clone, Default)]
pub struct MemoryProcessor {
    tables: Arc<Mutex<Tables>>,
}

/// Releases a claimed row when dropped, including when the `process`
/// future is dropped mid-execution.
struct Claim {
    tables: Arc<Mutex<Tables>>,
    id: JobId,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.tables.lock().claimed.remove(&self.id);
    }
}

impl MemoryProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the ready set, ordered by ID
    pub fn active_jobs(&self) -> Vec<Job> {
        self.tables.lock().ready.values().cloned().collect()
    }

    fn claim(&self, types: &[String]) -> Option<Claim> {
        let now = Utc::now();
        let mut tables = self.tables.lock();

        let id = tables
            .ready
            .values()
            .find(|job| {
                job.run_at <= now
                    && types.iter().any(|t| *t == job.job_type)
                    && !tables.claimed.contains(&job.id)
            })
            .map(|job| job.id)?;
        tables.claimed.insert(id);

        Some(Claim {
            tables: self.tables.clone(),
            id,
        })
    }

    fn commit(&self, id: JobId, job: Job) -> WorkerResult<()> {
        let mut tables = self.tables.lock();

        match job.status {
            JobStatus::Done => {
                tables
                    .ready
                    .remove(&id)
                    .ok_or_else(|| WorkerError::Internal(format!("claimed job {id} is missing")))?;
            }
            JobStatus::Dead => {
                if tables.dead.contains_key(&id) {
                    return Err(WorkerError::JobExists(format!("dead job {id}")));
                }
                tables
                    .ready
                    .remove(&id)
                    .ok_or_else(|| WorkerError::Internal(format!("claimed job {id} is missing")))?;
                // Dead rows have no run time of their own; report the move time.
                let mut job = job;
                job.run_at = job.updated_at;
                tables.dead.insert(id, job);
            }
            JobStatus::Pending => {
                let row = tables
                    .ready
                    .get_mut(&id)
                    .ok_or_else(|| WorkerError::Internal(format!("claimed job {id} is missing")))?;
                row.run_at = job.run_at;
                row.updated_at = job.updated_at;
                row.last_error = job.last_error;
                row.last_attempt_at = job.last_attempt_at;
                row.attempts_done = row.attempts_done.saturating_add(1);
            }
        }

        Ok(())
    }
}

#[async_trait]
impl JobProcessor for MemoryProcessor {
    async fn enqueue(&self, jobs: Vec<Job>) -> WorkerResult<()> {
        let mut tables = self.tables.lock();

        let mut batch = HashSet::with_capacity(jobs.len());
        for job in &jobs {
            if tables.ready.contains_key(&job.id) || !batch.insert(job.id) {
                return Err(WorkerError::JobExists(job.id.to_string()));
            }
        }

        for job in jobs {
            tables.ready.insert(job.id, job);
        }
        Ok(())
    }

    async fn process(&self, types: &[String], executor: JobExecutor) -> WorkerResult<bool> {
        let Some(claim) = self.claim(types) else {
            return Ok(false);
        };
        let id = claim.id;

        let job = self.tables.lock().ready.get(&id).cloned();
        let Some(job) = job else {
            return Err(WorkerError::Internal(format!("claimed job {id} is missing")));
        };

        debug!(job_id = %id, job_type = %job.job_type, "Claimed job");
        let outcome = match AssertUnwindSafe(executor(job)).catch_unwind().await {
            Ok(job) => job,
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                warn!(job_id = %id, "Job executor panicked, claim rolled back: {}", msg);
                return Err(WorkerError::ExecutorPanic(msg));
            }
        };

        let committed = self.commit(id, outcome);
        drop(claim);
        committed.map(|_| true)
    }

    async fn stats(&self) -> WorkerResult<Vec<JobTypeStats>> {
        let tables = self.tables.lock();

        let mut counts: BTreeMap<&str, (u64, u64)> = BTreeMap::new();
        for job in tables.ready.values() {
            counts.entry(job.job_type.as_str()).or_default().0 += 1;
        }
        for job in tables.dead.values() {
            counts.entry(job.job_type.as_str()).or_default().1 += 1;
        }

        Ok(counts
            .into_iter()
            .map(|(job_type, (active, dead))| JobTypeStats {
                job_type: job_type.to_string(),
                active,
                dead,
            })
            .collect())
    }
}

#[async_trait]
impl DeadJobManager for MemoryProcessor {
    async fn dead_jobs(&self, size: u32, offset: u32) -> WorkerResult<Vec<Job>> {
        let tables = self.tables.lock();
        Ok(tables
            .dead
            .values()
            .skip(offset as usize)
            .take(size as usize)
            .cloned()
            .collect())
    }

    async fn resurrect(&self, ids: &[JobId]) -> WorkerResult<()> {
        let ids = dedup_ids(ids);
        let mut tables = self.tables.lock();

        for id in &ids {
            if !tables.dead.contains_key(id) {
                return Err(WorkerError::JobNotFound(id.to_string()));
            }
            if tables.ready.contains_key(id) {
                return Err(WorkerError::JobExists(id.to_string()));
            }
        }

        let now = Utc::now();
        for id in ids {
            if let Some(mut job) = tables.dead.remove(&id) {
                job.status = JobStatus::Pending;
                job.run_at = now;
                job.updated_at = now;
                tables.ready.insert(id, job);
            }
        }
        Ok(())
    }

    async fn clear_dead_jobs(&self, ids: &[JobId]) -> WorkerResult<()> {
        let mut tables = self.tables.lock();
        for id in ids {
            tables.dead.remove(id);
        }
        Ok(())
    }
}
