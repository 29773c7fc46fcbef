// Status API handlers - one file per domain
pub mod queue;
pub mod server;
pub mod settings;
pub mod system;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::file_manager::SettingsStore;
use crate::queue::Dispatcher;

pub use server::{router, serve};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub settings: Arc<SettingsStore>,
    /// Fired by POST /api/shutdown
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(dispatcher: Arc<Dispatcher>, settings: Arc<SettingsStore>) -> Self {
        Self {
            dispatcher,
            settings,
            shutdown: CancellationToken::new(),
        }
    }
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Source(_) | AppError::Config(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidState(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            log::error!("Request failed: {}", self);
        }
        (
            status,
            Json(json!({ "error": self.to_string(), "kind": self.kind() })),
        )
            .into_response()
    }
}
