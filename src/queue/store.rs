// Authoritative in-memory queue
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use super::sources::parse_source;
use crate::error::{AppError, Result};
use crate::models::{ItemStatus, QueueItem, Source, StatusCounts, StemMode};

/// What `clear` removes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClearMode {
    /// Terminal items only (done, error, canceled)
    #[default]
    Finished,
    /// Everything except running items, including queued ones
    Reset,
}

impl ClearMode {
    fn removes(self, status: ItemStatus) -> bool {
        match self {
            ClearMode::Finished => status.is_terminal(),
            ClearMode::Reset => status != ItemStatus::Running,
        }
    }
}

#[derive(Default)]
struct Entries {
    order: Vec<String>,
    items: HashMap<String, Arc<Mutex<QueueItem>>>,
}

impl Entries {
    fn push(&mut self, item: QueueItem) {
        self.order.push(item.id.clone());
        self.items.insert(item.id.clone(), Arc::new(Mutex::new(item)));
    }

    fn remove(&mut self, id: &str) {
        self.items.remove(id);
        self.order.retain(|existing| existing != id);
    }
}

/// Items live behind their own mutex so progress writes from different
/// workers never contend on a global lock. The outer `RwLock` only guards
/// membership and order, and is never held across I/O.
#[derive(Default)]
pub struct JobStore {
    entries: RwLock<Entries>,
    changed: Notify,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one already-validated source
    pub fn enqueue(&self, source: Source, folder: &Path, stem_mode: Option<StemMode>) -> String {
        let item = QueueItem::new(source, folder.to_string_lossy().to_string(), stem_mode);
        let id = item.id.clone();
        self.entries.write().push(item);
        self.changed.notify_one();
        id
    }

    /// Append a batch of raw source strings.
    ///
    /// Every string yields exactly one new item. Strings that fail
    /// validation are recorded directly in `error` status; the rest of
    /// the batch is unaffected.
    pub fn enqueue_batch(
        &self,
        raw_sources: &[String],
        folder: &Path,
        stem_mode: Option<StemMode>,
    ) -> Result<Vec<QueueItem>> {
        if raw_sources.is_empty() {
            return Err(AppError::Config("No sources provided".to_string()));
        }

        let folder_str = folder.to_string_lossy().to_string();
        let created: Vec<QueueItem> = raw_sources
            .iter()
            .map(|raw| raw.trim())
            .map(|raw| {
                if raw.is_empty() {
                    warn!("Rejected blank source");
                    let source = Source::Local { path: PathBuf::new() };
                    return QueueItem::rejected(
                        source,
                        folder_str.clone(),
                        stem_mode,
                        "Empty source".to_string(),
                    );
                }
                match parse_source(raw) {
                    Ok(source) => QueueItem::new(source, folder_str.clone(), stem_mode),
                    Err((source, err)) => {
                        warn!("Rejected source {}: {}", raw, err);
                        QueueItem::rejected(source, folder_str.clone(), stem_mode, err.item_message())
                    }
                }
            })
            .collect();

        {
            let mut entries = self.entries.write();
            for item in &created {
                entries.push(item.clone());
            }
        }
        info!("Enqueued {} item(s)", created.len());
        self.changed.notify_one();
        Ok(created)
    }

    /// Point-in-time copy of every item in insertion order.
    ///
    /// All item locks are held together while copying, so no item in the
    /// result reflects a later write than any other.
    pub fn snapshot(&self) -> Vec<QueueItem> {
        let entries = self.entries.read();
        let guards: Vec<_> = entries
            .order
            .iter()
            .filter_map(|id| entries.items.get(id))
            .map(|item| item.lock())
            .collect();
        guards.iter().map(|guard| (**guard).clone()).collect()
    }

    pub fn get(&self, id: &str) -> Option<QueueItem> {
        self.handle(id).map(|item| item.lock().clone())
    }

    pub fn status(&self, id: &str) -> Option<ItemStatus> {
        self.handle(id).map(|item| item.lock().status)
    }

    fn handle(&self, id: &str) -> Option<Arc<Mutex<QueueItem>>> {
        self.entries.read().items.get(id).cloned()
    }

    /// Atomic read-modify-write of one item
    pub fn update<R>(&self, id: &str, mutate: impl FnOnce(&mut QueueItem) -> R) -> Result<R> {
        let item = self
            .handle(id)
            .ok_or_else(|| AppError::NotFound(id.to_string()))?;
        let mut guard = item.lock();
        Ok(mutate(&mut guard))
    }

    /// Like `update`, but only while the item is still running.
    /// Returns `false` when the item was canceled or finalized meanwhile.
    pub fn update_running(&self, id: &str, mutate: impl FnOnce(&mut QueueItem)) -> Result<bool> {
        self.update(id, |item| {
            if item.status == ItemStatus::Running {
                mutate(item);
                true
            } else {
                false
            }
        })
    }

    /// Cancel an item that has not started yet
    pub fn cancel(&self, id: &str) -> Result<QueueItem> {
        self.update(id, |item| {
            if item.status != ItemStatus::Queued {
                return Err(AppError::InvalidState(format!(
                    "Only queued items can be canceled (item is {})",
                    item.status.as_str()
                )));
            }
            item.mark_canceled();
            Ok(item.clone())
        })?
    }

    /// Claim the oldest queued item, flipping it to running with progress reset
    pub fn claim_next(&self) -> Option<QueueItem> {
        let entries = self.entries.read();
        for id in &entries.order {
            let Some(item) = entries.items.get(id) else { continue };
            let mut guard = item.lock();
            if guard.status == ItemStatus::Queued {
                guard.status = ItemStatus::Running;
                guard.reset_progress();
                debug!("Claimed item {}", guard.id);
                return Some(guard.clone());
            }
        }
        None
    }

    /// Cancel every queued item and flag every running one.
    /// Returns how many items changed.
    pub fn stop_all(&self) -> usize {
        let entries = self.entries.read();
        let mut canceled = 0;
        for item in entries.items.values() {
            let mut guard = item.lock();
            if matches!(guard.status, ItemStatus::Queued | ItemStatus::Running) {
                guard.mark_canceled();
                canceled += 1;
            }
        }
        canceled
    }

    /// Remove items according to `mode`; running items are never removed
    pub fn clear(&self, mode: ClearMode) -> usize {
        let mut entries = self.entries.write();
        let doomed: Vec<String> = entries
            .order
            .iter()
            .filter(|id| {
                entries
                    .items
                    .get(*id)
                    .map(|item| mode.removes(item.lock().status))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        for id in &doomed {
            entries.remove(id);
        }
        if !doomed.is_empty() {
            info!("Cleared {} item(s) ({:?})", doomed.len(), mode);
        }
        doomed.len()
    }

    /// Replace a failed or canceled item with a fresh queued attempt.
    /// The new item has a new id; the old entry is removed.
    pub fn retry(&self, id: &str) -> Result<QueueItem> {
        let fresh = {
            let mut entries = self.entries.write();
            let old = entries
                .items
                .get(id)
                .map(|item| item.lock().clone())
                .ok_or_else(|| AppError::NotFound(id.to_string()))?;
            if !matches!(old.status, ItemStatus::Error | ItemStatus::Canceled) {
                return Err(AppError::InvalidState(format!(
                    "Only failed or canceled items can be retried (item is {})",
                    old.status.as_str()
                )));
            }
            entries.remove(id);
            let fresh = QueueItem::new(old.source, old.folder, old.stem_mode);
            entries.push(fresh.clone());
            fresh
        };
        self.changed.notify_one();
        Ok(fresh)
    }

    /// Re-enqueue every failed item once per distinct source
    pub fn retry_failed(&self) -> Vec<QueueItem> {
        let added = {
            let mut entries = self.entries.write();
            let failed: Vec<QueueItem> = entries
                .order
                .iter()
                .filter_map(|id| entries.items.get(id))
                .map(|item| item.lock().clone())
                .filter(|item| item.status == ItemStatus::Error)
                .collect();

            let mut seen = HashSet::new();
            let mut added = Vec::new();
            for old in failed {
                entries.remove(&old.id);
                if seen.insert(old.source.clone()) {
                    let fresh = QueueItem::new(old.source, old.folder, old.stem_mode);
                    entries.push(fresh.clone());
                    added.push(fresh);
                }
            }
            added
        };
        if !added.is_empty() {
            info!("Retrying {} failed item(s)", added.len());
            self.changed.notify_one();
        }
        added
    }

    pub fn counts(&self) -> StatusCounts {
        let entries = self.entries.read();
        let mut counts = StatusCounts::default();
        for item in entries.items.values() {
            counts.add(item.lock().status);
        }
        counts
    }

    /// True while anything is queued or running
    pub fn has_pending_work(&self) -> bool {
        let counts = self.counts();
        counts.queued > 0 || counts.running > 0
    }

    pub fn len(&self) -> usize {
        self.entries.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves after the next enqueue or retry
    pub async fn changed(&self) {
        self.changed.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn remote(n: usize) -> String {
        format!("https://example.com/watch?v={}", n)
    }

    fn store_with(n: usize) -> (JobStore, Vec<QueueItem>) {
        let store = JobStore::new();
        let sources: Vec<String> = (0..n).map(remote).collect();
        let added = store
            .enqueue_batch(&sources, Path::new("/tmp/out"), None)
            .unwrap();
        (store, added)
    }

    #[test]
    fn test_batch_conserves_count_and_isolates_bad_sources() {
        let (store, first) = store_with(2);
        let before = store.snapshot();

        let batch = vec![
            remote(10),
            "/no/such/file.mp3".to_string(),
            "http://".to_string(),
        ];
        let added = store.enqueue_batch(&batch, Path::new("/tmp/out"), None).unwrap();

        assert_eq!(added.len(), 3);
        assert_eq!(store.len(), 5);
        assert_eq!(added[0].status, ItemStatus::Queued);
        assert_eq!(added[1].status, ItemStatus::Error);
        assert!(added[1].error.as_deref().unwrap_or_default().contains("not found"));
        assert_eq!(added[2].status, ItemStatus::Error);

        // Pre-existing items untouched
        let after = store.snapshot();
        assert_eq!(&after[..2], &before[..]);
        assert_eq!(after[0].id, first[0].id);
    }

    #[test]
    fn test_empty_batch_is_a_config_error() {
        let store = JobStore::new();
        let err = store.enqueue_batch(&[], Path::new("/tmp"), None).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_blank_entries_become_error_items() {
        let store = JobStore::new();
        let raw = vec![
            "https://example.com/a".to_string(),
            "   ".to_string(),
            String::new(),
        ];
        let added = store.enqueue_batch(&raw, Path::new("/tmp"), None).unwrap();

        assert_eq!(added.len(), 3);
        assert_eq!(store.len(), 3);
        assert_eq!(added[0].status, ItemStatus::Queued);
        for item in &added[1..] {
            assert_eq!(item.status, ItemStatus::Error);
            assert_eq!(item.error.as_deref(), Some("Empty source"));
        }
        assert_eq!(store.counts().error, 2);
    }

    #[test]
    fn test_claim_is_fifo_and_resets_progress() {
        let (store, added) = store_with(3);
        store
            .update(&added[0].id, |item| item.download_progress = 0.7)
            .unwrap();

        let first = store.claim_next().unwrap();
        assert_eq!(first.id, added[0].id);
        assert_eq!(first.status, ItemStatus::Running);
        assert_eq!(first.download_progress, 0.0);

        assert_eq!(store.claim_next().unwrap().id, added[1].id);
        assert_eq!(store.claim_next().unwrap().id, added[2].id);
        assert!(store.claim_next().is_none());
    }

    #[test]
    fn test_cancel_only_while_queued() {
        let (store, added) = store_with(2);
        let canceled = store.cancel(&added[1].id).unwrap();
        assert_eq!(canceled.status, ItemStatus::Canceled);

        store.claim_next().unwrap();
        assert!(matches!(store.cancel(&added[0].id), Err(AppError::InvalidState(_))));
        assert!(matches!(store.cancel("missing"), Err(AppError::NotFound(_))));
    }

    #[test]
    fn test_update_running_skips_canceled_items() {
        let (store, added) = store_with(1);
        store.claim_next().unwrap();
        assert_eq!(store.stop_all(), 1);

        let applied = store
            .update_running(&added[0].id, |item| item.progress = 0.9)
            .unwrap();
        assert!(!applied);
        let item = store.get(&added[0].id).unwrap();
        assert_eq!(item.status, ItemStatus::Canceled);
        assert_eq!(item.progress, 0.0);
    }

    #[test]
    fn test_clear_modes_never_remove_running() {
        let (store, added) = store_with(4);
        store.claim_next().unwrap();
        store.update(&added[1].id, |i| i.mark_done("/tmp/out".into())).unwrap();
        store.update(&added[2].id, |i| i.mark_error("boom".into())).unwrap();

        assert_eq!(store.clear(ClearMode::Finished), 2);
        let remaining: Vec<_> = store.snapshot().into_iter().map(|i| i.id).collect();
        assert_eq!(remaining, vec![added[0].id.clone(), added[3].id.clone()]);

        assert_eq!(store.clear(ClearMode::Reset), 1);
        let remaining = store.snapshot();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].status, ItemStatus::Running);
    }

    #[test]
    fn test_retry_replaces_entry_with_fresh_item() {
        let (store, added) = store_with(2);
        store.claim_next().unwrap();
        store
            .update(&added[0].id, |i| {
                i.download_progress = 0.9;
                i.mark_error("network down".into());
            })
            .unwrap();

        let fresh = store.retry(&added[0].id).unwrap();
        assert_ne!(fresh.id, added[0].id);
        assert_eq!(fresh.status, ItemStatus::Queued);
        assert_eq!(fresh.download_progress, 0.0);
        assert_eq!(fresh.source, added[0].source);
        assert!(store.get(&added[0].id).is_none());
        assert_eq!(store.len(), 2);

        assert!(matches!(store.retry(&added[1].id), Err(AppError::InvalidState(_))));
    }

    #[test]
    fn test_retry_failed_dedupes_by_source() {
        let store = JobStore::new();
        let sources = vec![remote(1), remote(1), remote(2)];
        let added = store.enqueue_batch(&sources, Path::new("/tmp"), None).unwrap();
        for item in &added {
            store.update(&item.id, |i| i.mark_error("x".into())).unwrap();
        }

        let retried = store.retry_failed();
        assert_eq!(retried.len(), 2);
        assert_eq!(store.len(), 2);
        assert!(store.snapshot().iter().all(|i| i.status == ItemStatus::Queued));
    }

    #[test]
    fn test_single_enqueue_and_counts() {
        let store = JobStore::new();
        let id = store.enqueue(
            Source::Local { path: PathBuf::from("/tmp/a.mp3") },
            Path::new("/tmp"),
            Some(StemMode::Two),
        );
        assert_eq!(store.status(&id), Some(ItemStatus::Queued));
        assert!(store.has_pending_work());
        assert_eq!(store.counts().queued, 1);
    }

    #[test]
    fn test_concurrent_updates_are_not_torn() {
        let (store, added) = store_with(1);
        let store = Arc::new(store);
        let id = added[0].id.clone();
        store.claim_next().unwrap();

        let writers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                let id = id.clone();
                std::thread::spawn(move || {
                    for n in 0..500 {
                        let v = n as f64 / 500.0;
                        store
                            .update(&id, |item| {
                                item.download_progress = v;
                                item.progress = v;
                            })
                            .unwrap();
                    }
                })
            })
            .collect();

        for _ in 0..500 {
            let snap = store.snapshot();
            assert_eq!(snap[0].download_progress, snap[0].progress);
        }
        for w in writers {
            w.join().unwrap();
        }
    }
}
