// Phase collaborators: fetch/ingest and separation
pub mod fetch;
pub mod separate;
pub mod tags;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::models::{QualityPreset, Source, StemMode};

pub use fetch::{LocalIngest, RemoteFetcher};
pub use separate::{parse_artist_song, sanitize_filename, stage_stems, DemucsSeparator};
pub use tags::{read_audio_tags, AudioTags};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PhaseProgress {
    /// Completion in [0,1]
    pub fraction: f64,
    pub eta_sec: Option<f64>,
}

pub type ProgressFn = Arc<dyn Fn(PhaseProgress) + Send + Sync>;

/// Phase-1 output
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedMedia {
    pub path: PathBuf,
    pub title: Option<String>,
    pub channel: Option<String>,
    /// Scratch directory to remove once the item is finished
    pub scratch_dir: Option<PathBuf>,
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(
        &self,
        source: &Source,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<FetchedMedia>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeparationRequest {
    pub input: PathBuf,
    pub title: String,
    pub channel: Option<String>,
    pub folder: PathBuf,
    pub model: String,
    pub stem_mode: StemMode,
    pub quality: QualityPreset,
}

/// Phase-2 output
#[derive(Debug, Clone, PartialEq)]
pub struct SeparationOutput {
    pub dest_path: PathBuf,
    pub stems: Vec<PathBuf>,
}

#[async_trait]
pub trait Separator: Send + Sync {
    async fn separate(
        &self,
        request: SeparationRequest,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<SeparationOutput>;
}

/// The collaborators the dispatcher drives, one per phase and source kind
#[derive(Clone)]
pub struct Pipeline {
    pub remote: Arc<dyn Fetcher>,
    pub local: Arc<dyn Fetcher>,
    pub separator: Arc<dyn Separator>,
}

impl Pipeline {
    pub fn fetcher_for(&self, source: &Source) -> Arc<dyn Fetcher> {
        match source {
            Source::Remote { .. } => Arc::clone(&self.remote),
            Source::Local { .. } => Arc::clone(&self.local),
        }
    }
}
