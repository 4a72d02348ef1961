use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::Registry;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dog_worker::admin::dead_job_router;
use dog_worker::observability::{render, InstrumentedProcessor, JobStatsGauges};
use dog_worker::prelude::*;

const EMAIL_JOB: &str = "send-email";

#[derive(Debug, Deserialize)]
struct Email {
    to: String,
    subject: String,
}

/// Pretend mail delivery: malformed payloads are permanent failures,
/// addresses on `flaky.example` fail transiently.
async fn send_email(ctx: JobContext, spec: JobSpec) -> Result<(), JobError> {
    let email: Email = serde_json::from_slice(&spec.payload).map_err(JobError::permanent)?;
    if !email.to.contains('@') {
        return Err(JobError::permanent(format!("invalid recipient: {}", email.to)));
    }

    tokio::select! {
        _ = ctx.cancelled() => return Err(JobError::retryable("delivery interrupted")),
        _ = tokio::time::sleep(Duration::from_millis(200)) => {}
    }

    if email.to.ends_with("@flaky.example") {
        return Err(JobError::retryable(format!("smtp timeout for {}", email.to)));
    }

    info!(to = %email.to, subject = %email.subject, "Email sent");
    Ok(())
}

fn demo_jobs() -> Vec<JobSpec> {
    ["ada@example.com", "grace@flaky.example", "not-an-address"]
        .into_iter()
        .map(|to| {
            let body = serde_json::json!({ "to": to, "subject": "Welcome" });
            JobSpec::new(EMAIL_JOB, body.to_string().into_bytes())
        })
        .collect()
}

async fn metrics(State(registry): State<Registry>) -> impl IntoResponse {
    match render(&registry) {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let pg = PgProcessor::connect(&PgConfig::from_env()?).await?;
    pg.migrate().await?;

    let registry = Registry::new();
    let processor = Arc::new(InstrumentedProcessor::new(pg, &registry)?);

    let worker = Arc::new(Worker::new(processor.clone(), WorkerConfig::from_env()?)?);
    worker.register(
        EMAIL_JOB,
        JobHandler::new(send_email)
            .with_max_attempts(4)
            .with_timeout(Duration::from_secs(10)),
    )?;
    worker.enqueue(demo_jobs()).await?;

    let cancel = CancellationToken::new();

    let gauges = JobStatsGauges::new(&registry)?;
    let refresh = gauges.spawn_refresh(
        processor.clone(),
        worker.registered_types(),
        Duration::from_secs(15),
        cancel.clone(),
    );

    let app = dead_job_router(processor.clone())
        .merge(Router::new().route("/metrics", get(metrics)).with_state(registry));

    let addr = std::env::var("WORKER_ADMIN_ADDR").unwrap_or_else(|_| "127.0.0.1:3030".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    println!("[worker-demo] dead jobs on http://{addr}/dead-jobs, metrics on http://{addr}/metrics");

    let server_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
    });

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
        }
        shutdown.cancel();
    });

    if let Err(e) = worker.run(cancel.clone()).await {
        error!("Worker stopped: {}", e);
        cancel.cancel();
    }

    refresh.await?;
    server.await??;
    processor.inner().close().await;
    Ok(())
}
