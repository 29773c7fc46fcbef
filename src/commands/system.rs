// Liveness and shutdown handlers used by the process supervisor
use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use super::AppState;

/// GET /api/health
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// POST /api/shutdown - begin graceful shutdown
pub async fn shutdown(State(state): State<AppState>) -> Json<Value> {
    log::info!("Shutdown requested over the API");
    state.shutdown.cancel();
    Json(json!({ "shutting_down": true }))
}
