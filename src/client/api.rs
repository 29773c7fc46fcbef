// Blocking Status API client used by the CLI
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::error::{AppError, Result};
use crate::models::{
    AddedItems, ClearResponse, ConcurrencyResponse, ProgressResponse, QueueSnapshot, Settings,
    StopResponse,
};
use crate::queue::ClearMode;

pub struct StatusClient {
    base_url: String,
    agent: ureq::Agent,
}

impl StatusClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(2))
            .timeout_read(Duration::from_secs(10))
            .timeout_write(Duration::from_secs(10))
            .build();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            agent,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn health(&self) -> bool {
        self.get::<Value>("/api/health").is_ok()
    }

    pub fn get_queue(&self) -> Result<QueueSnapshot> {
        self.get("/api/queue")
    }

    pub fn get_progress(&self) -> Result<ProgressResponse> {
        self.get("/api/progress")
    }

    pub fn enqueue(
        &self,
        sources: &[String],
        folder: Option<&str>,
        stem_mode: Option<&str>,
    ) -> Result<AddedItems> {
        self.post(
            "/api/queue",
            json!({ "sources": sources, "folder": folder, "stem_mode": stem_mode }),
        )
    }

    pub fn stop(&self) -> Result<StopResponse> {
        self.post("/api/stop", json!({}))
    }

    pub fn clear(&self, mode: ClearMode) -> Result<ClearResponse> {
        let mode = match mode {
            ClearMode::Finished => "finished",
            ClearMode::Reset => "reset",
        };
        self.post(&format!("/api/clear?mode={}", mode), json!({}))
    }

    pub fn retry_failed(&self) -> Result<AddedItems> {
        self.post("/api/retry-failed", json!({}))
    }

    pub fn get_concurrency(&self) -> Result<ConcurrencyResponse> {
        self.get("/api/concurrency")
    }

    pub fn get_settings(&self) -> Result<Settings> {
        self.get("/api/config")
    }

    pub fn set_concurrency(&self, max: i64) -> Result<ConcurrencyResponse> {
        self.post("/api/concurrency", json!({ "max": max }))
    }

    fn get<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, endpoint);
        handle_response(self.agent.get(&url).call())
    }

    fn post<T: DeserializeOwned>(&self, endpoint: &str, body: Value) -> Result<T> {
        let url = format!("{}{}", self.base_url, endpoint);
        handle_response(self.agent.post(&url).send_json(body))
    }
}

fn handle_response<T: DeserializeOwned>(
    response: std::result::Result<ureq::Response, ureq::Error>,
) -> Result<T> {
    match response {
        Ok(resp) => resp
            .into_json::<T>()
            .map_err(|e| AppError::Http(format!("Failed to parse response: {}", e))),
        Err(ureq::Error::Status(code, resp)) => {
            let text = resp.into_string().unwrap_or_default();
            let message = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
                .unwrap_or(text);
            Err(match code {
                400 => AppError::Config(message),
                404 => AppError::NotFound(message),
                409 => AppError::InvalidState(message),
                _ => AppError::Http(format!("Server error {}: {}", code, message)),
            })
        }
        Err(e) => Err(AppError::Http(format!("Failed to reach backend: {}", e))),
    }
}
