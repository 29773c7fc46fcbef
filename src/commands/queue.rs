// Queue command handlers
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use super::AppState;
use crate::error::{AppError, Result};
use crate::models::{
    AddedItems, ClearResponse, ConcurrencyRequest, ConcurrencyResponse, EnqueueRequest,
    ProgressResponse, QueueSnapshot, StartResponse, StatusCounts, StopResponse,
};
use crate::progress::average_progress;
use crate::queue::{check_limit, ClearMode, MAX_CONCURRENCY_CEILING};

#[derive(Debug, Deserialize)]
pub struct ClearParams {
    #[serde(default)]
    pub mode: ClearMode,
}

pub(crate) fn bad_json(rejection: JsonRejection) -> AppError {
    AppError::Config(format!("Malformed request body: {}", rejection.body_text()))
}

fn auto_start(state: &AppState) {
    if state.settings.get().auto_start {
        state.dispatcher.start();
    }
}

/// GET /api/queue
pub async fn get_queue(State(state): State<AppState>) -> Json<QueueSnapshot> {
    Json(QueueSnapshot {
        running: state.dispatcher.is_running(),
        items: state.dispatcher.store().snapshot(),
    })
}

/// POST /api/queue - enqueue a batch of URLs or local files
pub async fn enqueue(
    State(state): State<AppState>,
    body: std::result::Result<Json<EnqueueRequest>, JsonRejection>,
) -> Result<Json<AddedItems>> {
    let Json(req) = body.map_err(bad_json)?;
    let added = state.dispatcher.submit(
        &req.sources,
        req.folder.as_deref(),
        req.stem_mode.as_deref(),
    )?;
    Ok(Json(AddedItems { added }))
}

/// POST /api/start
pub async fn start(State(state): State<AppState>) -> Json<StartResponse> {
    Json(StartResponse {
        started: state.dispatcher.start(),
    })
}

/// POST /api/stop - cancel queued items and signal running ones
pub async fn stop(State(state): State<AppState>) -> Json<StopResponse> {
    let canceled = state.dispatcher.stop_all();
    Json(StopResponse {
        stopping: true,
        canceled,
    })
}

/// POST /api/clear?mode=finished|reset
pub async fn clear(
    State(state): State<AppState>,
    params: std::result::Result<Query<ClearParams>, QueryRejection>,
) -> Result<Json<ClearResponse>> {
    let Query(params) = params.map_err(|e| AppError::Config(e.body_text()))?;
    let cleared = state.dispatcher.store().clear(params.mode);
    Ok(Json(ClearResponse { cleared }))
}

/// POST /api/cancel/:id - only queued items can be canceled
pub async fn cancel(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>> {
    state.dispatcher.store().cancel(&id)?;
    Ok(Json(json!({ "canceled": true })))
}

/// POST /api/retry/:id
pub async fn retry(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>> {
    let item = state.dispatcher.store().retry(&id)?;
    auto_start(&state);
    Ok(Json(json!({ "item": item })))
}

/// POST /api/retry-failed
pub async fn retry_failed(State(state): State<AppState>) -> Json<AddedItems> {
    let added = state.dispatcher.store().retry_failed();
    if !added.is_empty() {
        auto_start(&state);
    }
    Json(AddedItems { added })
}

/// GET /api/progress - raw average; smoothing is up to the client
pub async fn progress(State(state): State<AppState>) -> Json<ProgressResponse> {
    let items = state.dispatcher.store().snapshot();
    let weights = state.settings.phase_weights();
    Json(ProgressResponse {
        progress: average_progress(&items, &weights),
        counts: StatusCounts::from_items(&items),
        concurrency: state.dispatcher.admission().snapshot(),
    })
}

fn concurrency_response(state: &AppState) -> ConcurrencyResponse {
    let admission = state.dispatcher.admission();
    ConcurrencyResponse {
        active: admission.active(),
        max: admission.max(),
        server_max: MAX_CONCURRENCY_CEILING,
    }
}

/// GET /api/concurrency
pub async fn get_concurrency(State(state): State<AppState>) -> Json<ConcurrencyResponse> {
    Json(concurrency_response(&state))
}

/// POST /api/concurrency - change the limit and remember it
pub async fn set_concurrency(
    State(state): State<AppState>,
    body: std::result::Result<Json<ConcurrencyRequest>, JsonRejection>,
) -> Result<Json<ConcurrencyResponse>> {
    let Json(req) = body.map_err(bad_json)?;
    let max = check_limit(req.max)?;
    let admission = state.dispatcher.admission();
    state
        .settings
        .set_max_concurrency(max, |max| admission.set_limit(max as i64))?;
    Ok(Json(concurrency_response(&state)))
}
