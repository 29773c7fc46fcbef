// Phase 1: download remote sources, ingest local files
use std::fs;
use std::path::PathBuf;

use async_trait::async_trait;
use log::{debug, info};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::tags::read_audio_tags;
use super::{FetchedMedia, Fetcher, PhaseProgress, ProgressFn};
use crate::error::{AppError, Result};
use crate::models::{title_from_path, Source};
use crate::process_manager::WorkerRuntime;
use crate::queue::validate_local_file;

const FETCH_SCRIPT: &str = "fetch_worker.py";

#[derive(Debug, Deserialize)]
struct FetchResult {
    file_path: PathBuf,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    channel: Option<String>,
}

/// Downloads best audio for a URL through `fetch_worker.py`
pub struct RemoteFetcher {
    runtime: WorkerRuntime,
    work_root: PathBuf,
}

impl RemoteFetcher {
    pub fn new(runtime: WorkerRuntime, work_root: PathBuf) -> Self {
        Self { runtime, work_root }
    }
}

#[async_trait]
impl Fetcher for RemoteFetcher {
    async fn fetch(
        &self,
        source: &Source,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<FetchedMedia> {
        let Source::Remote { url } = source else {
            return Err(AppError::Source("Remote fetcher needs a URL".to_string()));
        };

        let scratch = self.work_root.join(format!("fetch-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&scratch)?;
        info!("Fetching {}", url);

        let input = json!({ "url": url, "output_dir": scratch });
        let outcome = self
            .runtime
            .run(FETCH_SCRIPT, &input, &progress, &cancel)
            .await
            .and_then(|data| Ok(serde_json::from_value::<FetchResult>(data)?))
            .and_then(|result| {
                if result.file_path.is_file() {
                    Ok(result)
                } else {
                    Err(AppError::Source(format!(
                        "Downloaded file is missing: {:?}",
                        result.file_path
                    )))
                }
            });

        match outcome {
            Ok(result) => Ok(FetchedMedia {
                path: result.file_path,
                title: result.title.filter(|t| !t.trim().is_empty()),
                channel: result.channel.filter(|c| !c.trim().is_empty()),
                scratch_dir: Some(scratch),
            }),
            Err(e) => {
                if let Err(rm) = fs::remove_dir_all(&scratch) {
                    debug!("Could not remove scratch dir {:?}: {}", scratch, rm);
                }
                Err(match e {
                    AppError::Worker(message) => AppError::Source(message),
                    other => other,
                })
            }
        }
    }
}

/// Local files need no transfer, only a fresh validation. Embedded title and
/// artist tags win over the file name.
#[derive(Debug, Default)]
pub struct LocalIngest;

#[async_trait]
impl Fetcher for LocalIngest {
    async fn fetch(
        &self,
        source: &Source,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<FetchedMedia> {
        let Some(path) = source.local_path() else {
            return Err(AppError::Source("Local ingest needs a file path".to_string()));
        };
        if cancel.is_cancelled() {
            return Err(AppError::Canceled);
        }

        let path = validate_local_file(path)?;
        let tag_path = path.clone();
        let tags = tokio::task::spawn_blocking(move || read_audio_tags(&tag_path))
            .await
            .unwrap_or_default();
        debug!("Tags for {:?}: {:?}", path, tags);

        progress(PhaseProgress {
            fraction: 1.0,
            eta_sec: None,
        });

        Ok(FetchedMedia {
            title: Some(tags.title.unwrap_or_else(|| title_from_path(&path))),
            path,
            channel: tags.artist,
            scratch_dir: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_local_ingest_reports_completion() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("Band - Tune.wav");
        fs::write(&file, b"RIFF").unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let progress: ProgressFn = Arc::new(move |p| sink.lock().push(p.fraction));

        let media = LocalIngest
            .fetch(&Source::Local { path: file }, progress, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(media.title.as_deref(), Some("Band - Tune"));
        assert!(media.channel.is_none());
        assert!(media.scratch_dir.is_none());
        assert_eq!(seen.lock().as_slice(), &[1.0]);
    }

    #[tokio::test]
    async fn test_local_ingest_prefers_embedded_tags() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("track01.wav");
        fs::write(&file, crate::pipeline::tags::tagged_wav("Bad Kingdom", "Moderat")).unwrap();

        let progress: ProgressFn = Arc::new(|_| {});
        let media = LocalIngest
            .fetch(&Source::Local { path: file }, progress, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(media.title.as_deref(), Some("Bad Kingdom"));
        assert_eq!(media.channel.as_deref(), Some("Moderat"));
    }

    #[tokio::test]
    async fn test_local_ingest_rejects_vanished_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("gone.mp3");
        let progress: ProgressFn = Arc::new(|_| {});
        let err = LocalIngest
            .fetch(&Source::Local { path: file }, progress, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Source(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_remote_failure_is_a_source_error() {
        let workers = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        fs::write(
            workers.path().join(FETCH_SCRIPT),
            "echo '{\"type\":\"error\",\"message\":\"HTTP Error 404\"}'\nexit 1\n",
        )
        .unwrap();

        let fetcher = RemoteFetcher::new(
            WorkerRuntime::new("sh", workers.path()),
            work.path().to_path_buf(),
        );
        let progress: ProgressFn = Arc::new(|_| {});
        let err = fetcher
            .fetch(
                &Source::Remote { url: "https://example.com/x".into() },
                progress,
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Source(ref m) if m.contains("404")));
        // Scratch space is cleaned up on failure
        assert_eq!(fs::read_dir(work.path()).unwrap().count(), 0);
    }
}
