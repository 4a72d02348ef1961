use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{JobError, WorkerError, WorkerResult};
use crate::handler::{JobContext, JobHandler};

/// Delay applied when an attempt is interrupted by worker shutdown
pub const MIN_RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// Unique, time-sortable identifier for a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generate a new job ID; later IDs sort after earlier ones
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| WorkerError::InvalidJobId(s.to_string()))
    }
}

impl From<Uuid> for JobId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Outcome of the latest attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Not attempted yet, or scheduled for another attempt
    #[default]
    Pending,
    Done,
    Dead,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Done => "done",
            JobStatus::Dead => "dead",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a producer submits: a type, an opaque payload and an optional
/// earliest run time (`None` means "ready immediately").
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JobSpec {
    pub job_type: String,
    pub payload: Vec<u8>,
    pub run_at: Option<DateTime<Utc>>,
}

impl JobSpec {
    pub fn new(job_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            run_at: None,
        }
    }

    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }
}

/// A persisted unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(rename = "args", with = "payload_base64")]
    pub payload: Vec<u8>,
    pub run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub attempts_done: u32,
    #[serde(skip)]
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_error: String,
}

enum Outcome {
    Finished(Result<(), JobError>),
    Panicked(String),
    TimedOut,
    Canceled,
}

impl Job {
    /// Build a new job from a spec, assigning its ID and timestamps.
    pub fn new(spec: JobSpec) -> WorkerResult<Self> {
        Self::new_at(spec, Utc::now())
    }

    pub(crate) fn new_at(spec: JobSpec, now: DateTime<Utc>) -> WorkerResult<Self> {
        let job_type = normalize_type(&spec.job_type);
        if job_type.is_empty() {
            return Err(WorkerError::InvalidJob("job type must be set".to_string()));
        }

        Ok(Self {
            id: JobId::new(),
            job_type,
            payload: spec.payload,
            run_at: spec.run_at.unwrap_or(now),
            created_at: now,
            updated_at: now,
            attempts_done: 0,
            status: JobStatus::Pending,
            last_attempt_at: None,
            last_error: String::new(),
        })
    }

    /// The producer-facing view of this job
    pub fn spec(&self) -> JobSpec {
        JobSpec {
            job_type: self.job_type.clone(),
            payload: self.payload.clone(),
            run_at: Some(self.run_at),
        }
    }

    /// Run one attempt of this job with `handler` and record the outcome.
    ///
    /// `cancel` is the worker's shutdown token; the handler receives a child
    /// of it that is also cancelled when the handler's timeout expires.
    /// `attempts_done`, `last_attempt_at` and `updated_at` are updated on
    /// every path.
    pub async fn attempt(&mut self, cancel: &CancellationToken, now: DateTime<Utc>, handler: &JobHandler) {
        self.run_attempt(cancel, now, handler).await;

        self.attempts_done = self.attempts_done.saturating_add(1);
        self.last_attempt_at = Some(now);
        self.updated_at = now;
    }

    async fn run_attempt(&mut self, cancel: &CancellationToken, now: DateTime<Utc>, handler: &JobHandler) {
        if cancel.is_cancelled() {
            self.reschedule_canceled(now);
            return;
        }

        let Some(handle) = handler.handle.clone() else {
            self.status = JobStatus::Dead;
            self.last_error = WorkerError::InvalidJobHandler("handle function must be set".to_string()).to_string();
            return;
        };

        let timeout = handler.timeout();
        let token = cancel.child_token();
        let deadline = Instant::now()
            .checked_add(timeout)
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(365 * 24 * 60 * 60));
        let ctx = JobContext::new(token.clone(), deadline);
        let spec = self.spec();

        // Calling the handle inside the future so a panic before its first
        // await is caught as well.
        let run = AssertUnwindSafe(async move { handle(ctx, spec).await }).catch_unwind();

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Outcome::Canceled,
            res = tokio::time::timeout(timeout, run) => match res {
                Err(_) => Outcome::TimedOut,
                Ok(Err(payload)) => Outcome::Panicked(panic_message(payload.as_ref())),
                Ok(Ok(result)) => Outcome::Finished(result),
            },
        };
        token.cancel();

        // A result produced while the worker was shutting down is not trusted.
        let outcome = match outcome {
            Outcome::Finished(_) | Outcome::TimedOut if cancel.is_cancelled() => Outcome::Canceled,
            other => other,
        };

        match outcome {
            Outcome::Canceled => self.reschedule_canceled(now),
            Outcome::TimedOut => {
                self.status = JobStatus::Dead;
                self.last_error = format!("deadline exceeded: attempt did not finish within {timeout:?}");
            }
            Outcome::Panicked(msg) => {
                self.status = JobStatus::Dead;
                self.last_error = format!("panic: {msg}");
            }
            Outcome::Finished(Ok(())) => {
                self.status = JobStatus::Done;
            }
            Outcome::Finished(Err(err)) => {
                let next_attempt = self.attempts_done.saturating_add(1);
                if err.is_retryable() && next_attempt < handler.max_attempts() {
                    self.run_at = add_duration(now, handler.retry_delay(next_attempt));
                } else {
                    self.status = JobStatus::Dead;
                }
                self.last_error = err.to_string();
            }
        }
    }

    fn reschedule_canceled(&mut self, now: DateTime<Utc>) {
        self.run_at = add_duration(now, MIN_RETRY_BACKOFF);
        self.last_error = "canceled: worker is shutting down".to_string();
    }
}

pub(crate) fn normalize_type(job_type: &str) -> String {
    job_type.trim().to_lowercase()
}

pub(crate) fn add_duration(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(d)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

mod payload_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
