use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Serialize;

use crate::error::WorkerResult;
use crate::job::{Job, JobId};

/// Callback invoked with a claimed job; returns the job with its outcome
/// (status, run time, last error) filled in.
pub type JobExecutor = Arc<dyn Fn(Job) -> BoxFuture<'static, Job> + Send + Sync>;

/// Row counts for one job type
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobTypeStats {
    #[serde(rename = "type")]
    pub job_type: String,
    pub active: u64,
    pub dead: u64,
}

/// Storage engine that owns job rows.
///
/// Implementations must keep the claim, the executor call and the outcome
/// write in one unit of work: a claimed row is invisible to every other
/// caller of [`JobProcessor::process`] until the outcome is committed or the
/// claim is rolled back.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// Insert all jobs into the ready set, or none of them.
    ///
    /// Fails with `WorkerError::JobExists` when an ID is already present.
    async fn enqueue(&self, jobs: Vec<Job>) -> WorkerResult<()>;

    /// Claim one ready job of the given types and run `executor` on it.
    ///
    /// Returns `Ok(false)` when no job is ready. A panicking executor rolls
    /// the claim back and leaves the row untouched.
    async fn process(&self, types: &[String], executor: JobExecutor) -> WorkerResult<bool>;

    /// Active and dead counts per job type, sorted by type
    async fn stats(&self) -> WorkerResult<Vec<JobTypeStats>>;
}

/// Administrative access to the dead set.
#[async_trait]
pub trait DeadJobManager: Send + Sync {
    /// Page of dead jobs ordered by ID
    async fn dead_jobs(&self, size: u32, offset: u32) -> WorkerResult<Vec<Job>>;

    /// Move dead jobs back into the ready set, runnable now.
    ///
    /// Either every ID is moved or none is.
    async fn resurrect(&self, ids: &[JobId]) -> WorkerResult<()>;

    /// Delete dead jobs. IDs that are not in the dead set are ignored.
    async fn clear_dead_jobs(&self, ids: &[JobId]) -> WorkerResult<()>;
}

pub(crate) fn dedup_ids(ids: &[JobId]) -> Vec<JobId> {
    let mut ids = ids.to_vec();
    ids.sort();
    ids.dedup();
    ids
}
