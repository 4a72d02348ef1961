#![cfg(feature = "memory")]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use dog_worker::{
    DeadJobManager, JobContext, JobError, JobHandler, JobProcessor, JobSpec, MemoryProcessor,
    Worker, WorkerConfig,
};

fn fast_config(workers: usize) -> WorkerConfig {
    WorkerConfig {
        workers,
        poll_interval: Duration::from_millis(100),
        active_poll_percent: 100.0,
    }
}

/// Poll `check` until it holds or the deadline passes.
async fn eventually<F: Fn() -> bool>(check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// W1. A pool of workers runs every job exactly once
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pool_runs_each_job_once() {
    let store = MemoryProcessor::new();
    let worker = Arc::new(Worker::new(Arc::new(store.clone()), fast_config(4)).unwrap());

    let runs: Arc<Mutex<HashMap<Vec<u8>, usize>>> = Arc::new(Mutex::new(HashMap::new()));
    let sink = runs.clone();
    worker
        .register(
            "index",
            JobHandler::new(move |_ctx, spec: JobSpec| {
                *sink.lock().entry(spec.payload).or_default() += 1;
                async { Ok(()) }
            }),
        )
        .unwrap();

    let specs: Vec<JobSpec> = (0..40u32)
        .map(|i| JobSpec::new("index", i.to_be_bytes().to_vec()))
        .collect();
    worker.enqueue(specs).await.unwrap();

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(worker.clone().run(cancel.clone()));

    eventually(|| store.active_jobs().is_empty()).await;
    cancel.cancel();
    handle.await.unwrap().unwrap();

    let runs = runs.lock();
    assert_eq!(runs.len(), 40);
    assert!(runs.values().all(|count| *count == 1));
}

/// W2. Failed jobs can be resurrected and then succeed
#[tokio::test]
async fn test_dead_job_resurrected_and_completed() {
    let store = MemoryProcessor::new();
    let worker = Arc::new(Worker::new(Arc::new(store.clone()), fast_config(1)).unwrap());

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    worker
        .register(
            "report",
            JobHandler::new(move |_ctx, _spec| {
                let first = counter.fetch_add(1, Ordering::SeqCst) == 0;
                async move {
                    if first {
                        Err(JobError::permanent("upstream rejected report"))
                    } else {
                        Ok(())
                    }
                }
            }),
        )
        .unwrap();
    worker.enqueue(vec![JobSpec::new("Report", b"q3".to_vec())]).await.unwrap();

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(worker.clone().run(cancel.clone()));

    eventually(|| store.active_jobs().is_empty()).await;
    let dead = store.dead_jobs(10, 0).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].job_type, "report");
    assert_eq!(dead[0].last_error, "upstream rejected report");

    store.resurrect(&[dead[0].id]).await.unwrap();
    eventually(|| calls.load(Ordering::SeqCst) == 2 && store.active_jobs().is_empty()).await;

    cancel.cancel();
    handle.await.unwrap().unwrap();

    assert!(store.dead_jobs(10, 0).await.unwrap().is_empty());
    let stats = store.stats().await.unwrap();
    assert!(stats.is_empty());
}

/// W3. Shutdown during a handler reschedules the job instead of finishing it
#[tokio::test]
async fn test_shutdown_reschedules_in_flight_job() {
    let store = MemoryProcessor::new();
    let worker = Arc::new(Worker::new(Arc::new(store.clone()), fast_config(1)).unwrap());

    let started = Arc::new(Notify::new());
    let signal = started.clone();
    worker
        .register(
            "slow",
            JobHandler::new(move |ctx: JobContext, _spec| {
                let signal = signal.clone();
                async move {
                    signal.notify_one();
                    ctx.cancelled().await;
                    Err(JobError::permanent("interrupted"))
                }
            })
            .with_timeout(Duration::from_secs(30)),
        )
        .unwrap();
    worker.enqueue(vec![JobSpec::new("slow", vec![])]).await.unwrap();

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(worker.clone().run(cancel.clone()));

    tokio::time::timeout(Duration::from_secs(10), started.notified())
        .await
        .expect("handler never started");
    cancel.cancel();
    handle.await.unwrap().unwrap();

    let ready = store.active_jobs();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].attempts_done, 1);
    assert!(ready[0].last_error.starts_with("canceled:"));
    assert!(ready[0].run_at > chrono::Utc::now());
    assert!(store.dead_jobs(10, 0).await.unwrap().is_empty());
}

/// W4. Jobs of unregistered types are left alone
#[tokio::test]
async fn test_unregistered_types_are_not_claimed() {
    let store = MemoryProcessor::new();
    let worker = Arc::new(Worker::new(Arc::new(store.clone()), fast_config(1)).unwrap());
    worker
        .register("known", JobHandler::new(|_ctx, _spec| async { Ok(()) }))
        .unwrap();
    worker
        .enqueue(vec![JobSpec::new("known", vec![]), JobSpec::new("unknown", vec![])])
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(worker.clone().run(cancel.clone()));

    eventually(|| store.active_jobs().len() == 1).await;
    cancel.cancel();
    handle.await.unwrap().unwrap();

    let ready = store.active_jobs();
    assert_eq!(ready[0].job_type, "unknown");
    assert_eq!(ready[0].attempts_done, 0);
}
