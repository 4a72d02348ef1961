//! # dog-worker: Durable Background Jobs on a Relational Store
//!
//! dog-worker decouples "enqueue now" from "execute eventually". Jobs live in
//! a ready table until a worker claims one, runs the handler registered for
//! its type and commits the outcome in the same transaction:
//!
//! - **At-least-once**: a job is deleted only after its handler succeeded;
//!   handlers are expected to be idempotent.
//! - **One attempt at a time**: claims use `FOR UPDATE SKIP LOCKED`, so
//!   concurrent workers (in one process or many) never run the same row.
//! - **Per-type retry policy**: attempts, timeout and backoff curve are set
//!   per job type. Only [`RetryableError`] failures are retried.
//! - **Dead-letter set**: jobs that exhaust their attempts, fail
//!   permanently or panic are moved aside for inspection, resurrection or
//!   deletion through a small HTTP surface.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dog_worker::prelude::*;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> WorkerResult<()> {
//! let processor = Arc::new(MemoryProcessor::new());
//! let worker = Arc::new(Worker::new(processor, WorkerConfig::default())?);
//!
//! worker.register(
//!     "send-email",
//!     JobHandler::new(|_ctx, spec: JobSpec| async move {
//!         if spec.payload.is_empty() {
//!             return Err(JobError::permanent("empty payload"));
//!         }
//!         Ok(())
//!     })
//!     .with_max_attempts(5),
//! )?;
//!
//! worker.enqueue(vec![JobSpec::new("send-email", b"hi".to_vec())]).await?;
//!
//! let cancel = CancellationToken::new();
//! worker.run(cancel).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Storage
//!
//! - [`backend::memory::MemoryProcessor`]: in-process, for tests and
//!   embedded use (feature `memory`).
//! - `backend::postgres::PgProcessor`: `jobs_queue` / `dead_jobs` tables
//!   (feature `postgres`).
//!
//! ## Feature Flags
//!
//! - `memory`, `postgres`: storage engines
//! - `metrics`: Prometheus instrumentation of any processor
//! - `admin`: axum router for the dead set

pub mod backend;
pub mod backoff;
pub mod config;
pub mod error;
pub mod handler;
pub mod job;
pub mod observability;
pub mod processor;
pub mod worker;

#[cfg(feature = "admin")]
pub mod admin;

pub use backoff::{
    BackoffFn, BackoffStrategy, ConstBackoff, ExponentialBackoff, LinearBackoff, LinearModBackoff,
    DEFAULT_EXPONENTIAL_BACKOFF,
};
pub use config::WorkerConfig;
pub use error::{BoxError, JobError, RetryableError, WorkerError, WorkerResult};
pub use handler::{JobContext, JobHandler, JobOptions};
pub use job::{Job, JobId, JobSpec, JobStatus, MIN_RETRY_BACKOFF};
pub use processor::{DeadJobManager, JobExecutor, JobProcessor, JobTypeStats};
pub use worker::Worker;

#[cfg(feature = "memory")]
pub use backend::memory::MemoryProcessor;

#[cfg(feature = "postgres")]
pub use backend::postgres::{PgConfig, PgProcessor};

/// Convenient imports for job producers and handler authors
pub mod prelude {
    pub use crate::{
        BackoffStrategy, ConstBackoff, DeadJobManager, ExponentialBackoff, Job, JobContext, JobError,
        JobHandler, JobId, JobProcessor, JobSpec, JobStatus, RetryableError, Worker, WorkerConfig,
        WorkerError, WorkerResult,
    };

    #[cfg(feature = "memory")]
    pub use crate::MemoryProcessor;

    #[cfg(feature = "postgres")]
    pub use crate::{PgConfig, PgProcessor};
}
