// Worker dispatch loop
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::admission::{AdmissionController, AdmissionPermit};
use super::sources::validate_folder;
use super::store::JobStore;
use crate::error::{AppError, Result};
use crate::file_manager::SettingsStore;
use crate::models::{ItemStatus, QueueItem, StemMode};
use crate::pipeline::{PhaseProgress, Pipeline, ProgressFn, SeparationOutput, SeparationRequest};

const DISPATCH_TICK: Duration = Duration::from_millis(300);
/// Phase 1 never shows as complete until the fetcher has returned
const MAX_DOWNLOAD_PROGRESS: f64 = 0.999;

/// Admits queued items up to the concurrency limit and drives each through
/// fetch then separation. An item task holds its admission permit until the
/// item's final status is written.
pub struct Dispatcher {
    store: Arc<JobStore>,
    admission: Arc<AdmissionController>,
    pipeline: Pipeline,
    settings: Arc<SettingsStore>,
    running: AtomicBool,
    start_requested: AtomicBool,
    cancel: Mutex<CancellationToken>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<JobStore>,
        admission: Arc<AdmissionController>,
        pipeline: Pipeline,
        settings: Arc<SettingsStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            admission,
            pipeline,
            settings,
            running: AtomicBool::new(false),
            start_requested: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
        })
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Enqueue raw sources into `folder` (or the configured default) and
    /// start the loop when auto-start is on
    pub fn submit(
        self: &Arc<Self>,
        sources: &[String],
        folder: Option<&str>,
        stem_mode: Option<&str>,
    ) -> Result<Vec<QueueItem>> {
        let folder = match validate_folder(folder.unwrap_or_default())? {
            Some(folder) => folder,
            None => self.settings.output_dir(),
        };
        let stem_mode = match stem_mode.map(str::trim).filter(|s| !s.is_empty()) {
            Some(raw) => Some(StemMode::parse(raw).ok_or_else(|| {
                AppError::Config(format!("Invalid stem mode '{}', expected 2, 4 or 6", raw))
            })?),
            None => None,
        };

        let added = self.store.enqueue_batch(sources, &folder, stem_mode)?;
        if self.settings.get().auto_start {
            self.start();
        }
        Ok(added)
    }

    /// Start the loop if it isn't running. Returns whether a new loop was started.
    pub fn start(self: &Arc<Self>) -> bool {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // Picked up by the running loop, or by its exit check
            self.start_requested.store(true, Ordering::SeqCst);
            return false;
        }
        self.start_requested.store(false, Ordering::SeqCst);

        let token = {
            let mut guard = self.cancel.lock();
            if guard.is_cancelled() {
                *guard = CancellationToken::new();
            }
            guard.clone()
        };
        tokio::spawn(Arc::clone(self).run_loop(token));
        true
    }

    /// Cancel queued items, flag running ones and signal their workers
    pub fn stop_all(&self) -> usize {
        let canceled = self.store.stop_all();
        self.cancel.lock().cancel();
        info!("Stop requested; {} item(s) canceled", canceled);
        canceled
    }

    async fn run_loop(self: Arc<Self>, token: CancellationToken) {
        info!("Dispatch loop started");

        loop {
            if token.is_cancelled() {
                break;
            }
            // Requests that arrive while we're running are already served here
            self.start_requested.store(false, Ordering::SeqCst);

            while let Some(permit) = self.admission.try_admit() {
                match self.store.claim_next() {
                    Some(item) => {
                        info!("Starting {} ({})", item.title, item.id);
                        tokio::spawn(Arc::clone(&self).process_item(item, permit, token.child_token()));
                    }
                    None => break,
                }
            }

            if !self.store.has_pending_work() && self.admission.active() == 0 {
                break;
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = self.store.changed() => {}
                _ = self.admission.released() => {}
                _ = tokio::time::sleep(DISPATCH_TICK) => {}
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!("Dispatch loop stopped");

        let requested = self.start_requested.swap(false, Ordering::SeqCst);
        let stranded = !token.is_cancelled() && self.store.counts().queued > 0;
        if requested || stranded {
            self.start();
        }
    }

    async fn process_item(
        self: Arc<Self>,
        item: QueueItem,
        permit: AdmissionPermit,
        token: CancellationToken,
    ) {
        let id = item.id.clone();
        let worker = tokio::spawn(Arc::clone(&self).run_item(item, token));
        if let Err(e) = worker.await {
            error!("Worker for {} aborted: {}", id, e);
            let _ = self.store.update_running(&id, |item| {
                item.mark_error("worker panicked".to_string())
            });
        }
        drop(permit);
    }

    async fn run_item(self: Arc<Self>, item: QueueItem, token: CancellationToken) {
        let id = item.id.clone();
        let mut scratch = ScratchDir::default();
        let outcome = self.execute(item, &token, &mut scratch).await;

        let finalized = self.store.update_running(&id, |item| match &outcome {
            Ok(output) => item.mark_done(output.dest_path.to_string_lossy().to_string()),
            Err(AppError::Canceled) => item.mark_canceled(),
            Err(e) => item.mark_error(e.item_message()),
        });

        match (&outcome, finalized) {
            (Ok(output), Ok(true)) => info!("Finished {} -> {:?}", id, output.dest_path),
            (Err(AppError::Canceled), _) => info!("Canceled {}", id),
            (Err(e), Ok(true)) => warn!("Item {} failed: {}", id, e),
            (_, Ok(false)) => debug!("Item {} was canceled before it finished", id),
            (_, Err(e)) => debug!("Item {} vanished before finalizing: {}", id, e),
        }
    }

    async fn execute(
        &self,
        item: QueueItem,
        token: &CancellationToken,
        scratch: &mut ScratchDir,
    ) -> Result<SeparationOutput> {
        let id = item.id.clone();
        let settings = self.settings.get();
        self.checkpoint(&id, token)?;

        // Phase 1
        let fetcher = self.pipeline.fetcher_for(&item.source);
        let media = fetcher
            .fetch(&item.source, self.download_sink(&id), token.clone())
            .await?;
        scratch.0 = media.scratch_dir.clone();

        let current = self
            .store
            .update(&id, |it| {
                if it.status == ItemStatus::Running {
                    it.downloaded = true;
                    it.download_progress = 1.0;
                    it.download_eta_sec = None;
                    if let Some(title) = &media.title {
                        it.title = title.clone();
                    }
                    if media.channel.is_some() {
                        it.channel = media.channel.clone();
                    }
                }
                it.clone()
            })?;

        self.checkpoint(&id, token)?;

        // Phase 2
        self.store.update_running(&id, |it| {
            it.processing = true;
            it.progress = 0.0;
        })?;

        let folder = if current.folder.trim().is_empty() {
            PathBuf::from(&settings.output_dir)
        } else {
            PathBuf::from(&current.folder)
        };
        let request = SeparationRequest {
            input: media.path.clone(),
            title: current.title.clone(),
            channel: current.channel.clone(),
            folder,
            model: settings.demucs_model.clone(),
            stem_mode: current.stem_mode.unwrap_or(settings.stem_mode),
            quality: settings.quality_preset,
        };

        let output = self
            .pipeline
            .separator
            .separate(request, self.processing_sink(&id), token.clone())
            .await?;
        self.checkpoint(&id, token)?;
        Ok(output)
    }

    /// Fails with `Canceled` once stop-all has reached this item
    fn checkpoint(&self, id: &str, token: &CancellationToken) -> Result<()> {
        if token.is_cancelled() || self.store.status(id) != Some(ItemStatus::Running) {
            return Err(AppError::Canceled);
        }
        Ok(())
    }

    fn download_sink(&self, id: &str) -> ProgressFn {
        let store = Arc::clone(&self.store);
        let id = id.to_string();
        Arc::new(move |p: PhaseProgress| {
            let _ = store.update_running(&id, |item| {
                let fraction = p.fraction.min(MAX_DOWNLOAD_PROGRESS);
                item.download_progress = item.download_progress.max(fraction);
                item.download_eta_sec = p.eta_sec;
            });
        })
    }

    fn processing_sink(&self, id: &str) -> ProgressFn {
        let store = Arc::clone(&self.store);
        let id = id.to_string();
        Arc::new(move |p: PhaseProgress| {
            let _ = store.update_running(&id, |item| {
                item.progress = item.progress.max(p.fraction);
                item.processing_eta_sec = p.eta_sec;
            });
        })
    }
}

/// Removes a phase-1 scratch directory when the item is done with it
#[derive(Default)]
struct ScratchDir(Option<PathBuf>);

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Some(dir) = self.0.take() {
            remove_scratch(&dir);
        }
    }
}

fn remove_scratch(dir: &Path) {
    if let Err(e) = std::fs::remove_dir_all(dir) {
        debug!("Could not remove scratch dir {:?}: {}", dir, e);
    }
}
