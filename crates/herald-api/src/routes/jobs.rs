//! Job administration endpoints.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use herald_core::{Clock, Job, JobFilter, JobId, JobPage, JobStats, JobStatus, NewJob, Page};
use serde::Deserialize;
use tracing::info;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_jobs).post(enqueue_job))
        .route("/stats", get(job_stats))
        .route("/{id}", get(get_job))
        .route("/{id}/retry", post(retry_job))
        .route("/{id}/cancel", post(cancel_job))
}

/// Kept as strings so that blank parameters (`?status=&page=`) mean "unset".
#[derive(Debug, Deserialize)]
struct ListJobsQuery {
    status: Option<String>,
    #[serde(rename = "type")]
    job_type: Option<String>,
    page: Option<String>,
    per_page: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_count(name: &str, value: Option<String>) -> Result<Option<u32>, ApiError> {
    non_empty(value)
        .map(|v| {
            v.trim()
                .parse::<u32>()
                .map_err(|_| ApiError::BadRequest(format!("invalid {}: {}", name, v)))
        })
        .transpose()
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<JobPage>, ApiError> {
    let status = non_empty(query.status)
        .map(|s| s.parse::<JobStatus>())
        .transpose()?;
    let filter = JobFilter {
        status,
        job_type: non_empty(query.job_type),
    };
    let page = Page::new(
        parse_count("page", query.page)?,
        parse_count("per_page", query.per_page)?,
    );
    Ok(Json(state.store.list(&filter, page).await?))
}

async fn job_stats(State(state): State<AppState>) -> Result<Json<JobStats>, ApiError> {
    Ok(Json(state.store.stats(state.clock.now()).await?))
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.store.get(id).await?))
}

#[derive(Debug, Default, Deserialize)]
struct RetryRequest {
    #[serde(default)]
    reset_attempts: bool,
}

/// The body is optional; an empty body retries with attempts preserved.
async fn retry_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Job>, ApiError> {
    let id = parse_id(&id)?;
    let req = if body.iter().all(u8::is_ascii_whitespace) {
        RetryRequest::default()
    } else {
        serde_json::from_slice::<RetryRequest>(&body)
            .map_err(|e| ApiError::BadRequest(format!("invalid retry request: {}", e)))?
    };

    let job = state
        .store
        .retry(id, req.reset_attempts, state.clock.now())
        .await?;
    info!(job_id = %job.id, reset_attempts = req.reset_attempts, "Job retried by operator");
    Ok(Json(job))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let id = parse_id(&id)?;
    let job = state.store.cancel(id, state.clock.now()).await?;
    info!(job_id = %job.id, "Job cancelled by operator");
    Ok(Json(job))
}

#[derive(Debug, Deserialize)]
struct EnqueueRequest {
    job_type: String,
    payload: serde_json::Value,
    scheduled_for: Option<DateTime<Utc>>,
    max_attempts: Option<i32>,
}

async fn enqueue_job(
    State(state): State<AppState>,
    Json(req): Json<EnqueueRequest>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    let mut new_job = NewJob::new(req.job_type, req.payload)?
        .max_attempts(req.max_attempts.unwrap_or(state.max_attempts));
    if let Some(at) = req.scheduled_for {
        new_job = new_job.scheduled_for(at);
    }

    let job = state.store.enqueue(new_job, state.clock.now()).await?;
    info!(job_id = %job.id, job_type = %job.job_type, "Job enqueued by operator");
    Ok((StatusCode::CREATED, Json(job)))
}

fn parse_id(raw: &str) -> Result<JobId, ApiError> {
    raw.parse::<JobId>()
        .map_err(|_| ApiError::BadRequest(format!("invalid job id: {}", raw)))
}
