use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use parking_lot::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::backoff::{BackoffStrategy, ConstBackoff, ExponentialBackoff};
use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::handler::JobHandler;
use crate::job::{add_duration, normalize_type, Job, JobSpec};
use crate::processor::{JobExecutor, JobProcessor};

/// Retry delay for a claimed job whose type has no handler
const UNKNOWN_TYPE_BACKOFF: Duration = Duration::from_secs(5 * 60);

/// Upper bound for the idle backoff of passive workers
const PASSIVE_POLL_MAX_DELAY: Duration = Duration::from_secs(5);

/// Asynchronous job processing on top of a [`JobProcessor`].
///
/// Handlers are registered per job type; [`Worker::run`] then drives a pool
/// of polling loops that claim and attempt ready jobs.
pub struct Worker {
    processor: Arc<dyn JobProcessor>,
    config: WorkerConfig,
    handlers: RwLock<HashMap<String, JobHandler>>,
}

impl Worker {
    pub fn new(processor: Arc<dyn JobProcessor>, config: WorkerConfig) -> WorkerResult<Self> {
        Ok(Self {
            processor,
            config: config.sanitize()?,
            handlers: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Register the handler for a job type.
    ///
    /// Fails if the type already has a handler or the handler has no handle
    /// function.
    pub fn register(&self, job_type: &str, handler: JobHandler) -> WorkerResult<()> {
        let job_type = normalize_type(job_type);
        if job_type.is_empty() {
            return Err(WorkerError::InvalidJob("job type must be set".to_string()));
        }

        let mut handlers = self.handlers.write();
        if handlers.contains_key(&job_type) {
            return Err(WorkerError::TypeExists(job_type));
        }

        let handler = handler.sanitize()?;
        info!(job_type = %job_type, max_attempts = handler.options.max_attempts, "Registered job handler");
        handlers.insert(job_type, handler);
        Ok(())
    }

    /// Registered job types, sorted
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.read().keys().cloned().collect();
        types.sort();
        types
    }

    /// Validate the specs and hand the resulting jobs to the processor.
    ///
    /// Nothing is enqueued if any spec is invalid.
    #[instrument(skip(self, specs), fields(count = specs.len()))]
    pub async fn enqueue(&self, specs: Vec<JobSpec>) -> WorkerResult<()> {
        let jobs = specs
            .into_iter()
            .map(Job::new)
            .collect::<WorkerResult<Vec<_>>>()?;

        self.processor.enqueue(jobs).await
    }

    /// Run the worker pool until `cancel` fires.
    ///
    /// Cancellation is a clean shutdown and returns `Ok(())`; in-flight jobs
    /// see the cancellation and are rescheduled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> WorkerResult<()> {
        let active_workers = self.config.active_poll_workers();
        info!(
            workers = self.config.workers,
            active_workers,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Starting workers"
        );

        let mut pool = JoinSet::new();
        for worker_id in 0..self.config.workers {
            let worker = self.clone();
            let cancel = cancel.clone();
            let active_poll = worker_id < active_workers;
            pool.spawn(async move {
                worker.poll_loop(worker_id, active_poll, cancel).await;
                info!(worker_id, "Worker exited");
            });
        }

        let mut failure = None;
        while let Some(joined) = pool.join_next().await {
            if let Err(e) = joined {
                error!("Worker task failed: {}", e);
                cancel.cancel();
                failure.get_or_insert(WorkerError::Internal(format!("worker task failed: {e}")));
            }
        }

        info!("All workers exited");
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn poll_backoff(&self, active_poll: bool) -> Box<dyn BackoffStrategy> {
        if active_poll {
            Box::new(ConstBackoff::new(self.config.poll_interval))
        } else {
            Box::new(ExponentialBackoff {
                multiplier: 1.6,
                initial_delay: self.config.poll_interval,
                max_delay: PASSIVE_POLL_MAX_DELAY.max(self.config.poll_interval),
                jitter: 0.5,
            })
        }
    }

    async fn poll_loop(self: Arc<Self>, worker_id: usize, active_poll: bool, cancel: CancellationToken) {
        let backoff = self.poll_backoff(active_poll);
        let executor = self.executor(cancel.clone());
        let mut poll_attempt: u32 = 1;
        let mut wait = self.config.poll_interval;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }

            let types = self.registered_types();
            if types.is_empty() {
                warn!(worker_id, "No job handler registered, skipping processing");
                wait = self.config.poll_interval;
                continue;
            }

            debug!(worker_id, ?types, active_poll, "Looking for a job");
            match self.processor.process(&types, executor.clone()).await {
                Ok(true) => poll_attempt = 1,
                Ok(false) => poll_attempt = poll_attempt.saturating_add(1),
                Err(e) => {
                    error!(worker_id, "Process job failed: {}", e);
                    poll_attempt = 1;
                }
            }
            wait = backoff.backoff(poll_attempt);
        }
    }

    fn executor(self: &Arc<Self>, cancel: CancellationToken) -> JobExecutor {
        let worker = self.clone();
        Arc::new(move |job: Job| {
            let worker = worker.clone();
            let cancel = cancel.clone();
            async move { worker.process_job(job, &cancel).await }.boxed()
        })
    }

    async fn process_job(&self, mut job: Job, cancel: &CancellationToken) -> Job {
        let start = Instant::now();
        info!(job_id = %job.id, job_type = %job.job_type, "Got a job for processing");

        let handler = self.handlers.read().get(&job.job_type).cloned();
        let Some(handler) = handler else {
            // The processor only hands out registered types; kept as a guard.
            warn!(job_id = %job.id, job_type = %job.job_type, "No handler for job type");
            job.last_error = WorkerError::UnknownType(job.job_type.clone()).to_string();
            job.run_at = add_duration(Utc::now(), UNKNOWN_TYPE_BACKOFF);
            return job;
        };

        job.attempt(cancel, Utc::now(), &handler).await;

        info!(
            job_id = %job.id,
            attempts_done = job.attempts_done,
            job_status = %job.status,
            last_error = %job.last_error,
            time_ms = start.elapsed().as_millis() as u64,
            "Job attempted"
        );
        job
    }
}
