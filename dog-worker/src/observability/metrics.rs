use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use prometheus::{exponential_buckets, Encoder, HistogramOpts, HistogramVec, IntGaugeVec, Opts, Registry, TextEncoder};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{WorkerError, WorkerResult};
use crate::job::{Job, JobId, JobStatus};
use crate::processor::{DeadJobManager, JobExecutor, JobProcessor, JobTypeStats};

impl From<prometheus::Error> for WorkerError {
    fn from(err: prometheus::Error) -> Self {
        WorkerError::Internal(format!("metrics: {err}"))
    }
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

fn bool_label(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

/// Label value for a job outcome; pending after an attempt means a retry
fn status_label(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => "retry",
        other => other.as_str(),
    }
}

/// Decorates a [`JobProcessor`] with enqueue, dequeue-latency and
/// processing-duration histograms.
pub struct InstrumentedProcessor<P> {
    inner: P,
    enqueue_duration: HistogramVec,
    dequeue_latency: HistogramVec,
    process_duration: HistogramVec,
}

impl<P> InstrumentedProcessor<P> {
    /// Wrap `inner` and register the histograms on `registry`.
    pub fn new(inner: P, registry: &Registry) -> WorkerResult<Self> {
        let buckets = exponential_buckets(1.0, 2.5, 14)?;

        let enqueue_duration = HistogramVec::new(
            HistogramOpts::new(
                "worker_jobs_enqueue_duration_ms",
                "Time taken to enqueue a batch of jobs, in milliseconds",
            )
            .buckets(buckets.clone()),
            &["job_types", "success"],
        )?;
        let dequeue_latency = HistogramVec::new(
            HistogramOpts::new(
                "worker_job_dequeue_latency_ms",
                "Delay between a job becoming ready and being picked up, in milliseconds",
            )
            .buckets(buckets.clone()),
            &["job_type"],
        )?;
        let process_duration = HistogramVec::new(
            HistogramOpts::new(
                "worker_job_process_duration_ms",
                "Time taken to attempt a job, in milliseconds",
            )
            .buckets(buckets),
            &["job_type", "status", "success"],
        )?;

        registry.register(Box::new(enqueue_duration.clone()))?;
        registry.register(Box::new(dequeue_latency.clone()))?;
        registry.register(Box::new(process_duration.clone()))?;

        Ok(Self {
            inner,
            enqueue_duration,
            dequeue_latency,
            process_duration,
        })
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    fn instrument_executor(&self, executor: JobExecutor) -> JobExecutor {
        let dequeue_latency = self.dequeue_latency.clone();
        let process_duration = self.process_duration.clone();

        Arc::new(move |job: Job| {
            let waited = (Utc::now() - job.run_at).to_std().unwrap_or_default();
            dequeue_latency
                .with_label_values(&[job.job_type.as_str()])
                .observe(millis(waited));

            let executor = executor.clone();
            let process_duration = process_duration.clone();
            async move {
                let start = Instant::now();
                let job = executor(job).await;
                process_duration
                    .with_label_values(&[
                        job.job_type.as_str(),
                        status_label(job.status),
                        bool_label(job.status == JobStatus::Done),
                    ])
                    .observe(millis(start.elapsed()));
                job
            }
            .boxed()
        })
    }
}

#[async_trait]
impl<P: JobProcessor> JobProcessor for InstrumentedProcessor<P> {
    async fn enqueue(&self, jobs: Vec<Job>) -> WorkerResult<()> {
        let mut types: Vec<&str> = jobs.iter().map(|j| j.job_type.as_str()).collect();
        types.sort_unstable();
        types.dedup();
        let types = types.join(",");

        let start = Instant::now();
        let result = self.inner.enqueue(jobs).await;
        self.enqueue_duration
            .with_label_values(&[types.as_str(), bool_label(result.is_ok())])
            .observe(millis(start.elapsed()));
        result
    }

    async fn process(&self, types: &[String], executor: JobExecutor) -> WorkerResult<bool> {
        self.inner
            .process(types, self.instrument_executor(executor))
            .await
    }

    async fn stats(&self) -> WorkerResult<Vec<JobTypeStats>> {
        self.inner.stats().await
    }
}

#[async_trait]
impl<P: DeadJobManager> DeadJobManager for InstrumentedProcessor<P> {
    async fn dead_jobs(&self, size: u32, offset: u32) -> WorkerResult<Vec<Job>> {
        self.inner.dead_jobs(size, offset).await
    }

    async fn resurrect(&self, ids: &[JobId]) -> WorkerResult<()> {
        self.inner.resurrect(ids).await
    }

    async fn clear_dead_jobs(&self, ids: &[JobId]) -> WorkerResult<()> {
        self.inner.clear_dead_jobs(ids).await
    }
}

/// Per-type gauges of ready and dead jobs, fed from [`JobProcessor::stats`].
#[derive(Clone)]
pub struct JobStatsGauges {
    active: IntGaugeVec,
    dead: IntGaugeVec,
}

impl JobStatsGauges {
    pub fn new(registry: &Registry) -> WorkerResult<Self> {
        let active = IntGaugeVec::new(
            Opts::new("worker_active_jobs", "Number of jobs in the ready set"),
            &["job_type"],
        )?;
        let dead = IntGaugeVec::new(
            Opts::new("worker_dead_jobs", "Number of jobs in the dead set"),
            &["job_type"],
        )?;

        registry.register(Box::new(active.clone()))?;
        registry.register(Box::new(dead.clone()))?;
        Ok(Self { active, dead })
    }

    /// Reload the gauges. Types in `known_types` without rows report zero.
    pub async fn refresh(&self, processor: &dyn JobProcessor, known_types: &[String]) -> WorkerResult<()> {
        let stats = processor.stats().await?;

        self.active.reset();
        self.dead.reset();
        for job_type in known_types {
            self.active.with_label_values(&[job_type.as_str()]).set(0);
            self.dead.with_label_values(&[job_type.as_str()]).set(0);
        }
        for s in stats {
            self.active
                .with_label_values(&[s.job_type.as_str()])
                .set(i64::try_from(s.active).unwrap_or(i64::MAX));
            self.dead
                .with_label_values(&[s.job_type.as_str()])
                .set(i64::try_from(s.dead).unwrap_or(i64::MAX));
        }
        Ok(())
    }

    /// Refresh the gauges every `every` until `cancel` fires.
    pub fn spawn_refresh(
        self,
        processor: Arc<dyn JobProcessor>,
        known_types: Vec<String>,
        every: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(e) = self.refresh(processor.as_ref(), &known_types).await {
                            warn!("Failed to refresh job stats: {}", e);
                        }
                    }
                }
            }
        })
    }
}

/// Encode every metric in `registry` in the Prometheus text format.
pub fn render(registry: &Registry) -> WorkerResult<String> {
    let mut buf = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buf)?;
    String::from_utf8(buf).map_err(|e| WorkerError::Internal(format!("metrics: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryProcessor;
    use crate::job::JobSpec;
    use futures::future::BoxFuture;

    fn done_executor() -> JobExecutor {
        Arc::new(|mut job: Job| -> BoxFuture<'static, Job> {
            job.status = JobStatus::Done;
            Box::pin(async move { job })
        })
    }

    #[tokio::test]
    async fn records_enqueue_and_process() {
        let registry = Registry::new();
        let processor = InstrumentedProcessor::new(MemoryProcessor::new(), &registry).unwrap();

        let jobs = vec![
            Job::new(JobSpec::new("email", vec![])).unwrap(),
            Job::new(JobSpec::new("index", vec![])).unwrap(),
        ];
        processor.enqueue(jobs).await.unwrap();
        assert!(processor
            .process(&["email".to_string()], done_executor())
            .await
            .unwrap());

        let text = render(&registry).unwrap();
        assert!(text.contains(r#"worker_jobs_enqueue_duration_ms_count{job_types="email,index",success="true"} 1"#));
        assert!(text.contains(r#"worker_job_dequeue_latency_ms_count{job_type="email"} 1"#));
        assert!(text.contains(r#"worker_job_process_duration_ms_count{job_type="email",status="done",success="true"} 1"#));
    }

    #[tokio::test]
    async fn gauges_zero_fill_known_types() {
        let registry = Registry::new();
        let gauges = JobStatsGauges::new(&registry).unwrap();
        let store = MemoryProcessor::new();
        store
            .enqueue(vec![Job::new(JobSpec::new("email", vec![])).unwrap()])
            .await
            .unwrap();

        gauges
            .refresh(&store, &["email".to_string(), "index".to_string()])
            .await
            .unwrap();

        let text = render(&registry).unwrap();
        assert!(text.contains(r#"worker_active_jobs{job_type="email"} 1"#));
        assert!(text.contains(r#"worker_active_jobs{job_type="index"} 0"#));
        assert!(text.contains(r#"worker_dead_jobs{job_type="email"} 0"#));
    }

    #[test]
    fn duplicate_registration_fails() {
        let registry = Registry::new();
        JobStatsGauges::new(&registry).unwrap();
        assert!(matches!(JobStatsGauges::new(&registry), Err(WorkerError::Internal(_))));
    }
}
