// Error taxonomy shared by the queue engine, the Status API and the supervisor
use thiserror::Error;

/// Longest error message stored on a queue item
pub const MAX_ITEM_ERROR_LEN: usize = 300;

#[derive(Debug, Error)]
pub enum AppError {
    /// Invalid or unreachable source, at enqueue time or during phase 1
    #[error("{0}")]
    Source(String),

    /// Phase-2 failure (separation engine crash, bad input)
    #[error("{0}")]
    Transform(String),

    /// Rejected configuration or malformed request payload
    #[error("{0}")]
    Config(String),

    /// Backend process died and could not be recovered
    #[error("backend process crashed: {0}")]
    ProcessCrash(String),

    #[error("queue item not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("canceled")]
    Canceled,

    #[error("worker error: {0}")]
    Worker(String),

    #[error("request failed: {0}")]
    Http(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    /// Short machine-readable name used in API error bodies
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Source(_) => "source_error",
            AppError::Transform(_) => "transform_error",
            AppError::Config(_) => "config_error",
            AppError::ProcessCrash(_) => "process_crash",
            AppError::NotFound(_) => "not_found",
            AppError::InvalidState(_) => "invalid_state",
            AppError::Canceled => "canceled",
            AppError::Worker(_) => "worker_error",
            AppError::Http(_) => "http_error",
            AppError::Io(_) => "io_error",
            AppError::Json(_) => "json_error",
        }
    }

    /// Message as stored on a failed queue item
    pub fn item_message(&self) -> String {
        truncate_message(&self.to_string(), MAX_ITEM_ERROR_LEN)
    }
}

/// Truncate on a char boundary so multi-byte output from workers never panics
pub fn truncate_message(message: &str, max_len: usize) -> String {
    let trimmed = message.trim();
    if trimmed.len() <= max_len {
        return trimmed.to_string();
    }
    let mut end = max_len;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    trimmed[..end].to_string()
}
