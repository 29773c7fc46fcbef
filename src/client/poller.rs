// Client-side view of the queue
use std::time::Duration;

use log::warn;

use super::api::StatusClient;
use crate::models::{ItemStatus, QueueItem, QueueSnapshot};
use crate::progress::{GlobalAggregator, PhaseWeights, PollBackoff};

#[derive(Debug, Default)]
pub struct ClientState {
    aggregator: GlobalAggregator,
    backoff: PollBackoff,
    snapshot: Option<QueueSnapshot>,
    global: f64,
}

impl ClientState {
    pub fn new(weights: PhaseWeights, backoff: PollBackoff) -> Self {
        Self {
            aggregator: GlobalAggregator::new(weights),
            backoff,
            snapshot: None,
            global: 0.0,
        }
    }

    /// Fold in a fresh snapshot; returns the delay before the next poll
    pub fn apply(&mut self, snapshot: QueueSnapshot) -> Duration {
        self.global = self.aggregator.update(&snapshot.items);
        let active = is_active(&snapshot);
        self.snapshot = Some(snapshot);
        self.backoff.record(active)
    }

    /// A failed poll counts as idle so an absent backend is not hammered
    pub fn poll_failed(&mut self) -> Duration {
        self.backoff.record(false)
    }

    pub fn global_progress(&self) -> f64 {
        self.global
    }

    pub fn item_progress(&self, id: &str) -> f64 {
        self.aggregator.item_progress(id).unwrap_or(0.0)
    }

    pub fn snapshot(&self) -> Option<&QueueSnapshot> {
        self.snapshot.as_ref()
    }

    pub fn is_idle(&self) -> bool {
        self.snapshot.as_ref().map_or(true, |s| !is_active(s))
    }

    pub fn display_items(&self) -> Vec<&QueueItem> {
        self.snapshot
            .as_ref()
            .map(|s| display_order(&s.items))
            .unwrap_or_default()
    }

    pub fn backoff(&self) -> &PollBackoff {
        &self.backoff
    }
}

fn is_active(snapshot: &QueueSnapshot) -> bool {
    snapshot.running
        || snapshot
            .items
            .iter()
            .any(|i| matches!(i.status, ItemStatus::Queued | ItemStatus::Running))
}

fn bucket(status: ItemStatus) -> u8 {
    match status {
        ItemStatus::Running => 0,
        ItemStatus::Queued => 1,
        ItemStatus::Error | ItemStatus::Canceled => 2,
        ItemStatus::Done => 3,
    }
}

/// Running first, then queued, then failed or canceled, done last.
/// Insertion order is kept inside each bucket.
pub fn display_order(items: &[QueueItem]) -> Vec<&QueueItem> {
    let mut ordered: Vec<&QueueItem> = items.iter().collect();
    ordered.sort_by_key(|item| bucket(item.status));
    ordered
}

/// One status line per item, as printed by `stemdeck watch`
pub fn render_line(item: &QueueItem, value: f64) -> String {
    let stage = match item.status {
        ItemStatus::Running if item.processing => "separating",
        ItemStatus::Running => "fetching",
        other => other.as_str(),
    };
    let mut line = format!("{:>10} {:>6.1}%  {}", stage, value * 100.0, item.title);
    if let Some(error) = &item.error {
        line.push_str(&format!("  ({})", error));
    }
    line
}

/// Poll until the queue goes idle (when `until_idle`) or forever,
/// calling `on_update` after every successful poll
pub fn watch(
    client: &StatusClient,
    state: &mut ClientState,
    until_idle: bool,
    mut on_update: impl FnMut(&ClientState),
) {
    loop {
        let delay = match client.get_queue() {
            Ok(snapshot) => {
                let delay = state.apply(snapshot);
                on_update(state);
                if until_idle && state.is_idle() {
                    return;
                }
                delay
            }
            Err(e) => {
                warn!("Poll failed: {}", e);
                state.poll_failed()
            }
        };
        std::thread::sleep(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Source;
    use crate::progress::PollStage;

    fn item(title: &str, status: ItemStatus) -> QueueItem {
        let mut item = QueueItem::new(
            Source::Remote { url: format!("https://example.com/{}", title) },
            String::new(),
            None,
        );
        item.title = title.to_string();
        item.status = status;
        item
    }

    #[test]
    fn test_display_order_puts_done_last() {
        let items = vec![
            item("a", ItemStatus::Done),
            item("b", ItemStatus::Queued),
            item("c", ItemStatus::Error),
            item("d", ItemStatus::Running),
            item("e", ItemStatus::Queued),
        ];
        let titles: Vec<&str> = display_order(&items).iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles, vec!["d", "b", "e", "c", "a"]);
    }

    #[test]
    fn test_state_tracks_global_and_backoff() {
        let mut state = ClientState::default();
        assert!(state.is_idle());

        let mut running = item("a", ItemStatus::Running);
        running.download_progress = 0.5;
        let delay = state.apply(QueueSnapshot { running: true, items: vec![running] });
        assert_eq!(delay, Duration::from_millis(750));
        assert!((state.global_progress() - 0.15).abs() < 1e-9);
        assert!(!state.is_idle());

        let mut done = item("a", ItemStatus::Done);
        done.downloaded = true;
        done.progress = 1.0;
        for _ in 0..3 {
            state.apply(QueueSnapshot { running: false, items: vec![done.clone()] });
        }
        assert!(state.is_idle());
        assert_eq!(state.backoff().stage(), PollStage::Medium);
    }

    #[test]
    fn test_failed_polls_back_off() {
        let mut state = ClientState::default();
        for _ in 0..3 {
            state.poll_failed();
        }
        assert_eq!(state.backoff().stage(), PollStage::Medium);
    }

    #[test]
    fn test_render_line_shows_stage_and_error() {
        let mut running = item("Song", ItemStatus::Running);
        running.processing = true;
        assert!(render_line(&running, 0.5).contains("separating"));
        assert!(render_line(&running, 0.5).contains("50.0%"));

        let mut failed = item("Bad", ItemStatus::Error);
        failed.error = Some("HTTP Error 404".to_string());
        let line = render_line(&failed, 0.0);
        assert!(line.contains("error"));
        assert!(line.contains("HTTP Error 404"));
    }
}
