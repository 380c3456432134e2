//! Read endpoints plus the one authenticated mutation. Thin adapters from
//! HTTP to the store; nothing here caches queue state.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::{Form, Json};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use quern_core::{now_ts, JobState, JobUpdate, StoreError};

use crate::snapshot::Snapshot;
use crate::AppState;

type ApiError = (StatusCode, String);

fn internal(err: StoreError) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

fn parse_state(state: Option<&str>) -> Result<Option<JobState>, ApiError> {
    match state {
        None => Ok(None),
        Some(raw) => raw
            .parse::<JobState>()
            .map(Some)
            .map_err(|err| (StatusCode::BAD_REQUEST, err.to_string())),
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct JobsQuery {
    state: Option<String>,
    #[serde(default = "default_page")]
    page: i64,
    #[serde(default = "default_per_page")]
    per_page: i64,
}

fn default_page() -> i64 {
    1
}

fn default_per_page() -> i64 {
    20
}

pub(crate) async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<JobsQuery>,
) -> Result<Json<Value>, ApiError> {
    let filter = parse_state(query.state.as_deref())?;
    let (jobs, total) = state
        .store
        .list_jobs_paginated(filter, query.page, query.per_page)
        .await
        .map_err(internal)?;
    Ok(Json(json!({
        "jobs": jobs,
        "total": total,
        "page": query.page,
        "per_page": query.per_page,
    })))
}

pub(crate) async fn status(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let snapshot = Snapshot::build(state.store.as_ref())
        .await
        .map_err(internal)?;
    Ok(Json(snapshot.status_now()))
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventsQuery {
    #[serde(default = "default_event_limit")]
    limit: i64,
}

fn default_event_limit() -> i64 {
    100
}

#[derive(Debug, Serialize)]
pub(crate) struct EventView {
    event_type: String,
    message: Option<String>,
    created_at: String,
}

pub(crate) async fn job_events(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<EventView>>, ApiError> {
    let events = state
        .store
        .get_job_events(&job_id, query.limit)
        .await
        .map_err(internal)?;
    Ok(Json(
        events
            .into_iter()
            .map(|event| EventView {
                event_type: event.event_type,
                message: event.message,
                created_at: event.created_at,
            })
            .collect(),
    ))
}

#[derive(Debug, Deserialize)]
pub(crate) struct RetryForm {
    job_id: String,
}

pub(crate) async fn dlq_retry(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<RetryForm>,
) -> Result<Json<Value>, ApiError> {
    let provided = headers.get("x-api-key").and_then(|v| v.to_str().ok());
    if !state.token_matches(provided) {
        return Err((StatusCode::UNAUTHORIZED, "Unauthorized".to_string()));
    }

    let job = match state.store.get_job(&form.job_id).await {
        Ok(job) => job,
        Err(StoreError::NotFound(_)) => {
            return Err((StatusCode::NOT_FOUND, "Job not found".to_string()))
        }
        Err(err) => return Err(internal(err)),
    };
    if job.state != JobState::Dead {
        return Err((StatusCode::BAD_REQUEST, "Job not in DLQ".to_string()));
    }

    state
        .store
        .update_job_state(&form.job_id, &JobUpdate::requeue())
        .await
        .map_err(internal)?;
    state.refresh.notify_one();

    Ok(Json(json!({
        "status": "ok",
        "message": format!("Requeued {}", form.job_id),
    })))
}

pub(crate) async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "time": now_ts() }))
}
