use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backoff::{BackoffStrategy, DEFAULT_EXPONENTIAL_BACKOFF};
use crate::error::{JobError, WorkerError, WorkerResult};
use crate::job::JobSpec;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Future returned by a job handle function
pub type JobFuture = BoxFuture<'static, Result<(), JobError>>;

/// Type-erased job handle function
pub type HandleFn = dyn Fn(JobContext, JobSpec) -> JobFuture + Send + Sync;

/// Execution context handed to a job handler for one attempt.
///
/// The token is cancelled when the attempt times out or the worker shuts
/// down. Handlers are expected to observe it; a handler that never yields
/// keeps its task alive even after its result has been discarded.
#[derive(Debug, Clone)]
pub struct JobContext {
    cancel: CancellationToken,
    deadline: Instant,
}

impl JobContext {
    pub(crate) fn new(cancel: CancellationToken, deadline: Instant) -> Self {
        Self { cancel, deadline }
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the attempt has been cancelled or timed out
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Point in time after which the attempt result is discarded
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// Per-type execution policy
#[derive(Clone, Default)]
pub struct JobOptions {
    /// Total number of attempts, including the first one
    pub max_attempts: u32,
    /// Upper bound for a single attempt
    pub timeout: Duration,
    /// Delay curve between retries
    pub backoff: Option<Arc<dyn BackoffStrategy>>,
}

impl fmt::Debug for JobOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobOptions")
            .field("max_attempts", &self.max_attempts)
            .field("timeout", &self.timeout)
            .field("backoff", &self.backoff)
            .finish()
    }
}

/// Handle function plus its execution policy for one job type.
#[derive(Clone, Default)]
pub struct JobHandler {
    pub handle: Option<Arc<HandleFn>>,
    pub options: JobOptions,
}

impl JobHandler {
    /// Wrap an async function as a handler with default options
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(JobContext, JobSpec) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        let handle: Arc<HandleFn> =
            Arc::new(move |ctx: JobContext, spec: JobSpec| -> JobFuture { f(ctx, spec).boxed() });
        Self {
            handle: Some(handle),
            options: JobOptions::default(),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.options.max_attempts = max_attempts;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: impl BackoffStrategy + 'static) -> Self {
        self.options.backoff = Some(Arc::new(backoff));
        self
    }

    /// Validate the handler and fill unset options with defaults.
    pub fn sanitize(mut self) -> WorkerResult<Self> {
        if self.handle.is_none() {
            return Err(WorkerError::InvalidJobHandler(
                "handle function must be set".to_string(),
            ));
        }

        if self.options.max_attempts == 0 {
            self.options.max_attempts = DEFAULT_MAX_ATTEMPTS;
        }
        if self.options.timeout.is_zero() {
            self.options.timeout = DEFAULT_TIMEOUT;
        }
        if self.options.backoff.is_none() {
            self.options.backoff = Some(Arc::new(DEFAULT_EXPONENTIAL_BACKOFF));
        }

        Ok(self)
    }

    pub(crate) fn max_attempts(&self) -> u32 {
        match self.options.max_attempts {
            0 => DEFAULT_MAX_ATTEMPTS,
            n => n,
        }
    }

    pub(crate) fn timeout(&self) -> Duration {
        if self.options.timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            self.options.timeout
        }
    }

    pub(crate) fn retry_delay(&self, attempt: u32) -> Duration {
        match &self.options.backoff {
            Some(backoff) => backoff.backoff(attempt),
            None => DEFAULT_EXPONENTIAL_BACKOFF.backoff(attempt),
        }
    }
}

impl fmt::Debug for JobHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandler")
            .field("handle", &self.handle.as_ref().map(|_| "fn"))
            .field("options", &self.options)
            .finish()
    }
}
