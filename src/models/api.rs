// Status API request/response payloads
use serde::{Deserialize, Serialize};

use super::queue_item::{ItemStatus, QueueItem};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnqueueRequest {
    #[serde(alias = "urls", alias = "files")]
    pub sources: Vec<String>,
    #[serde(default)]
    pub folder: Option<String>,
    #[serde(default)]
    pub stem_mode: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddedItems {
    pub added: Vec<QueueItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub running: bool,
    pub items: Vec<QueueItem>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConcurrencyInfo {
    pub active: usize,
    pub max: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyResponse {
    pub active: usize,
    pub max: usize,
    pub server_max: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConcurrencyRequest {
    pub max: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub queued: usize,
    pub running: usize,
    pub done: usize,
    pub error: usize,
    pub canceled: usize,
}

impl StatusCounts {
    pub fn from_items<'a>(items: impl IntoIterator<Item = &'a QueueItem>) -> Self {
        let mut counts = Self::default();
        for item in items {
            counts.add(item.status);
        }
        counts
    }

    pub fn add(&mut self, status: ItemStatus) {
        match status {
            ItemStatus::Queued => self.queued += 1,
            ItemStatus::Running => self.running += 1,
            ItemStatus::Done => self.done += 1,
            ItemStatus::Error => self.error += 1,
            ItemStatus::Canceled => self.canceled += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.queued + self.running + self.done + self.error + self.canceled
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressResponse {
    pub progress: f64,
    pub counts: StatusCounts,
    pub concurrency: ConcurrencyInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopResponse {
    pub stopping: bool,
    pub canceled: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearResponse {
    pub cleared: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartResponse {
    pub started: bool,
}
