//! HTTP surface for inspecting and managing the dead set.
//!
//! - `GET /dead-jobs?size=&offset=`: JSON when the `Accept` header asks for
//!   `application/json`, an HTML page otherwise.
//! - `POST /resurrect-jobs`, `POST /clear-jobs`: form-encoded, repeated
//!   `job_ids` fields. Both redirect back to `/dead-jobs`, with `?error=`
//!   set when the request failed.

use std::sync::Arc;

use askama::Template;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_extra::extract::{Form, FormRejection};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::{WorkerError, WorkerResult};
use crate::job::{Job, JobId};
use crate::processor::DeadJobManager;

pub const LIST_DEAD_JOBS_PATH: &str = "/dead-jobs";
pub const RESURRECT_JOBS_PATH: &str = "/resurrect-jobs";
pub const CLEAR_JOBS_PATH: &str = "/clear-jobs";

const DEFAULT_PAGE_SIZE: u32 = 20;

#[derive(Clone)]
struct AdminState {
    manager: Arc<dyn DeadJobManager>,
}

/// Router with the three dead-job endpoints.
pub fn dead_job_router(manager: Arc<dyn DeadJobManager>) -> Router {
    Router::new()
        .route(LIST_DEAD_JOBS_PATH, get(list_dead_jobs))
        .route(RESURRECT_JOBS_PATH, post(resurrect_jobs))
        .route(CLEAR_JOBS_PATH, post(clear_jobs))
        .with_state(AdminState { manager })
}

/// Serve [`dead_job_router`] on `listener` until `shutdown` fires.
pub async fn serve_admin(
    listener: TcpListener,
    manager: Arc<dyn DeadJobManager>,
    shutdown: CancellationToken,
) -> WorkerResult<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Dead job admin listening on http://{}", addr);
    }

    axum::serve(listener, dead_job_router(manager))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| WorkerError::Internal(format!("admin server: {e}")))
}

#[derive(Debug, Default, Deserialize)]
struct PageQuery {
    size: Option<String>,
    offset: Option<String>,
    error: Option<String>,
}

impl PageQuery {
    fn page_size(&self) -> u32 {
        self.size
            .as_deref()
            .and_then(|s| s.trim().parse::<u32>().ok())
            .filter(|size| *size > 0)
            .unwrap_or(DEFAULT_PAGE_SIZE)
    }

    /// Missing, malformed and negative offsets all mean the first page
    fn offset(&self) -> u32 {
        self.offset
            .as_deref()
            .and_then(|s| s.trim().parse::<u32>().ok())
            .unwrap_or(0)
    }

    fn error_message(&self) -> Option<String> {
        self.error
            .as_deref()
            .map(str::trim)
            .filter(|msg| !msg.is_empty())
            .map(str::to_string)
    }
}

struct DeadJobView {
    id: String,
    job_type: String,
    attempts_done: u32,
    created_at: String,
    last_attempt_at: String,
    last_error: String,
    payload: String,
}

impl From<&Job> for DeadJobView {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.to_string(),
            job_type: job.job_type.clone(),
            attempts_done: job.attempts_done,
            created_at: job.created_at.to_rfc3339(),
            last_attempt_at: job
                .last_attempt_at
                .map(|at| at.to_rfc3339())
                .unwrap_or_default(),
            last_error: job.last_error.clone(),
            payload: STANDARD.encode(&job.payload),
        }
    }
}

#[derive(Template)]
#[template(path = "dead_jobs.html")]
struct DeadJobsPage {
    jobs: Vec<DeadJobView>,
    page_size: u32,
    next_offset: u32,
    prev_offset: Option<u32>,
    has_next: bool,
    error: Option<String>,
}

fn wants_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("application/json"))
}

fn json_error(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(json!({ "error": msg.into() }))).into_response()
}

async fn list_dead_jobs(
    State(state): State<AdminState>,
    headers: HeaderMap,
    query: Result<Query<PageQuery>, QueryRejection>,
) -> Response {
    let query = query.map(|Query(q)| q).unwrap_or_default();
    let size = query.page_size();
    let offset = query.offset();

    let jobs = match state.manager.dead_jobs(size, offset).await {
        Ok(jobs) => jobs,
        Err(e) => {
            error!("Failed to list dead jobs: {}", e);
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    };

    if wants_json(&headers) {
        return Json(jobs).into_response();
    }

    let page = DeadJobsPage {
        has_next: jobs.len() as u32 >= size,
        jobs: jobs.iter().map(DeadJobView::from).collect(),
        page_size: size,
        next_offset: offset.saturating_add(size),
        prev_offset: (offset > 0).then(|| offset.saturating_sub(size)),
        error: query.error_message(),
    };

    match page.render() {
        Ok(body) => Html(body).into_response(),
        Err(e) => {
            error!("Failed to render dead jobs page: {}", e);
            json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

#[derive(Debug, Deserialize)]
struct JobIdsForm {
    #[serde(default)]
    job_ids: Vec<String>,
}

fn parse_job_ids(form: Result<Form<JobIdsForm>, FormRejection>) -> Result<Vec<JobId>, String> {
    let Form(form) = form.map_err(|e| format!("invalid form: {e}"))?;

    let ids: Vec<&str> = form
        .job_ids
        .iter()
        .map(|id| id.trim())
        .filter(|id| !id.is_empty())
        .collect();
    if ids.is_empty() {
        return Err("no job IDs specified".to_string());
    }

    ids.into_iter()
        .map(|id| id.parse::<JobId>().map_err(|e| e.to_string()))
        .collect()
}

fn back_to_list(result: Result<(), String>) -> Redirect {
    match result {
        Ok(()) => Redirect::to(LIST_DEAD_JOBS_PATH),
        Err(msg) => Redirect::to(&format!(
            "{}?error={}",
            LIST_DEAD_JOBS_PATH,
            urlencoding::encode(&msg)
        )),
    }
}

async fn resurrect_jobs(
    State(state): State<AdminState>,
    form: Result<Form<JobIdsForm>, FormRejection>,
) -> Redirect {
    let result = match parse_job_ids(form) {
        Ok(ids) => state.manager.resurrect(&ids).await.map_err(|e| e.to_string()),
        Err(msg) => Err(msg),
    };
    if let Err(msg) = &result {
        error!("Failed to resurrect jobs: {}", msg);
    }
    back_to_list(result)
}

async fn clear_jobs(
    State(state): State<AdminState>,
    form: Result<Form<JobIdsForm>, FormRejection>,
) -> Redirect {
    let result = match parse_job_ids(form) {
        Ok(ids) => state.manager.clear_dead_jobs(&ids).await.map_err(|e| e.to_string()),
        Err(msg) => Err(msg),
    };
    if let Err(msg) = &result {
        error!("Failed to clear jobs: {}", msg);
    }
    back_to_list(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(size: Option<&str>, offset: Option<&str>) -> PageQuery {
        PageQuery {
            size: size.map(str::to_string),
            offset: offset.map(str::to_string),
            error: None,
        }
    }

    #[test]
    fn page_size_defaults() {
        assert_eq!(query(None, None).page_size(), 20);
        assert_eq!(query(Some("abc"), None).page_size(), 20);
        assert_eq!(query(Some("0"), None).page_size(), 20);
        assert_eq!(query(Some("-4"), None).page_size(), 20);
        assert_eq!(query(Some("50"), None).page_size(), 50);
    }

    #[test]
    fn offset_defaults() {
        assert_eq!(query(None, None).offset(), 0);
        assert_eq!(query(None, Some("-10")).offset(), 0);
        assert_eq!(query(None, Some("x")).offset(), 0);
        assert_eq!(query(None, Some("40")).offset(), 40);
    }

    #[test]
    fn parse_job_ids_requires_ids() {
        let form = Ok(Form(JobIdsForm {
            job_ids: vec![" ".to_string()],
        }));
        assert_eq!(parse_job_ids(form).unwrap_err(), "no job IDs specified");
    }

    #[test]
    fn parse_job_ids_rejects_malformed_id() {
        let form = Ok(Form(JobIdsForm {
            job_ids: vec!["not-a-uuid".to_string()],
        }));
        assert!(parse_job_ids(form).unwrap_err().contains("invalid job id"));
    }
}
