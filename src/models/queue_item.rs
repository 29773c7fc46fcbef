// Queue item data models
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::settings::StemMode;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Queued,
    Running,
    Done,
    Error,
    Canceled,
}

impl ItemStatus {
    /// Terminal statuses never transition again without an explicit retry
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemStatus::Done | ItemStatus::Error | ItemStatus::Canceled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::Queued => "queued",
            ItemStatus::Running => "running",
            ItemStatus::Done => "done",
            ItemStatus::Error => "error",
            ItemStatus::Canceled => "canceled",
        }
    }
}

/// Where an item's audio comes from; decides the phase-1 strategy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Source {
    Remote { url: String },
    Local { path: PathBuf },
}

impl Source {
    pub fn is_local(&self) -> bool {
        matches!(self, Source::Local { .. })
    }

    /// Human-readable form, also used as the initial title
    pub fn label(&self) -> String {
        match self {
            Source::Remote { url } => url.clone(),
            Source::Local { path } => path.to_string_lossy().to_string(),
        }
    }

    pub fn local_path(&self) -> Option<&Path> {
        match self {
            Source::Local { path } => Some(path.as_path()),
            Source::Remote { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueItem {
    pub id: String,
    pub source: Source,
    pub title: String,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub folder: String,
    pub status: ItemStatus,
    #[serde(default)]
    pub downloaded: bool,
    #[serde(default)]
    pub processing: bool,
    /// Phase-1 completion in [0,1]
    #[serde(default)]
    pub download_progress: f64,
    /// Phase-2 completion in [0,1], not the blended value
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub download_eta_sec: Option<f64>,
    #[serde(default)]
    pub processing_eta_sec: Option<f64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub dest_path: Option<String>,
    #[serde(default)]
    pub stem_mode: Option<StemMode>,
    pub created_at: String,
    #[serde(default)]
    pub completed_at: Option<String>,
}

impl QueueItem {
    pub fn new(source: Source, folder: String, stem_mode: Option<StemMode>) -> Self {
        let title = match &source {
            Source::Local { path } => title_from_path(path),
            Source::Remote { url } => url.clone(),
        };

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source,
            title,
            channel: None,
            folder,
            status: ItemStatus::Queued,
            downloaded: false,
            processing: false,
            download_progress: 0.0,
            progress: 0.0,
            download_eta_sec: None,
            processing_eta_sec: None,
            error: None,
            dest_path: None,
            stem_mode,
            created_at: chrono::Utc::now().to_rfc3339(),
            completed_at: None,
        }
    }

    /// Build an item that failed validation before any work started
    pub fn rejected(source: Source, folder: String, stem_mode: Option<StemMode>, error: String) -> Self {
        let mut item = Self::new(source, folder, stem_mode);
        item.status = ItemStatus::Error;
        item.error = Some(error);
        item.completed_at = Some(chrono::Utc::now().to_rfc3339());
        item
    }

    /// Clear every per-attempt field; used when the dispatcher claims the item
    pub fn reset_progress(&mut self) {
        self.downloaded = false;
        self.processing = false;
        self.download_progress = 0.0;
        self.progress = 0.0;
        self.download_eta_sec = None;
        self.processing_eta_sec = None;
        self.error = None;
        self.dest_path = None;
        self.completed_at = None;
    }

    pub fn mark_done(&mut self, dest_path: String) {
        self.status = ItemStatus::Done;
        self.downloaded = true;
        self.download_progress = 1.0;
        self.processing = false;
        self.progress = 1.0;
        self.download_eta_sec = None;
        self.processing_eta_sec = None;
        self.error = None;
        self.dest_path = Some(dest_path);
        self.completed_at = Some(chrono::Utc::now().to_rfc3339());
    }

    pub fn mark_error(&mut self, message: String) {
        self.status = ItemStatus::Error;
        self.processing = false;
        self.download_eta_sec = None;
        self.processing_eta_sec = None;
        self.dest_path = None;
        self.error = Some(if message.trim().is_empty() {
            "unknown error".to_string()
        } else {
            message
        });
        self.completed_at = Some(chrono::Utc::now().to_rfc3339());
    }

    pub fn mark_canceled(&mut self) {
        self.status = ItemStatus::Canceled;
        self.processing = false;
        self.download_eta_sec = None;
        self.processing_eta_sec = None;
        self.completed_at = Some(chrono::Utc::now().to_rfc3339());
    }
}

/// Title derived from a file name ("Artist - Song.mp3" -> "Artist - Song")
pub fn title_from_path(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "untitled".to_string())
}
