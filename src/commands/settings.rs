// Settings command handlers
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;

use super::queue::bad_json;
use super::AppState;
use crate::error::Result;
use crate::models::{Settings, SettingsUpdate};

/// GET /api/config
pub async fn get_settings(State(state): State<AppState>) -> Json<Settings> {
    Json(state.settings.get())
}

/// POST /api/config - partial update
pub async fn update_settings(
    State(state): State<AppState>,
    body: std::result::Result<Json<SettingsUpdate>, JsonRejection>,
) -> Result<Json<Settings>> {
    let Json(update) = body.map_err(bad_json)?;
    Ok(Json(state.settings.update(update)?))
}
