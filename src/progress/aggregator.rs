// Client-side global progress and adaptive poll interval
use std::collections::BTreeSet;
use std::time::Duration;

use super::blend::{PhaseWeights, ProgressTracker};
use crate::models::{ItemStatus, QueueItem};

/// Averages per-item blended progress into a single completion value.
///
/// Only items that are queued, running or done are tracked; failed and
/// canceled items drop out of the average. The result never decreases
/// while the tracked set stays the same. Adding or removing items resets
/// the floor so a new batch can pull the average down.
#[derive(Debug, Default)]
pub struct GlobalAggregator {
    tracker: ProgressTracker,
    tracked: BTreeSet<String>,
    last: Option<f64>,
}

impl GlobalAggregator {
    pub fn new(weights: PhaseWeights) -> Self {
        Self {
            tracker: ProgressTracker::new(weights),
            tracked: BTreeSet::new(),
            last: None,
        }
    }

    /// Fold a fresh queue snapshot in and return the global value in [0,1]
    pub fn update(&mut self, items: &[QueueItem]) -> f64 {
        let mut sum = 0.0;
        let mut tracked = BTreeSet::new();

        for item in items {
            // Per-item floors are kept for every item so a retry still resets cleanly
            let value = self.tracker.observe(item);
            if is_tracked(item.status) {
                sum += value;
                tracked.insert(item.id.clone());
            }
        }
        self.tracker.retain_ids(items.iter().map(|i| i.id.as_str()));

        let average = if tracked.is_empty() {
            0.0
        } else {
            sum / tracked.len() as f64
        };

        let value = match self.last {
            Some(last) if tracked == self.tracked => average.max(last),
            _ => average,
        };

        self.tracked = tracked;
        self.last = Some(value);
        value
    }

    pub fn last(&self) -> Option<f64> {
        self.last
    }

    /// Per-item value as last displayed
    pub fn item_progress(&self, id: &str) -> Option<f64> {
        self.tracker.last(id)
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }
}

fn is_tracked(status: ItemStatus) -> bool {
    matches!(status, ItemStatus::Queued | ItemStatus::Running | ItemStatus::Done)
}

/// Plain average of blended progress over tracked items, without smoothing
pub fn average_progress(items: &[QueueItem], weights: &PhaseWeights) -> f64 {
    let values: Vec<f64> = items
        .iter()
        .filter(|item| is_tracked(item.status))
        .map(|item| weights.blend(item))
        .collect();
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStage {
    Fast,
    Medium,
    Slow,
}

impl PollStage {
    fn next(self) -> Self {
        match self {
            PollStage::Fast => PollStage::Medium,
            PollStage::Medium | PollStage::Slow => PollStage::Slow,
        }
    }
}

/// Three-stage polling backoff: fast while anything is active, slowing down
/// after `idle_threshold` consecutive idle polls per stage.
#[derive(Debug, Clone)]
pub struct PollBackoff {
    fast: Duration,
    medium: Duration,
    slow: Duration,
    idle_threshold: u32,
    stage: PollStage,
    idle_streak: u32,
}

impl Default for PollBackoff {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(750),
            Duration::from_secs(3),
            Duration::from_secs(10),
            3,
        )
    }
}

impl PollBackoff {
    pub fn new(fast: Duration, medium: Duration, slow: Duration, idle_threshold: u32) -> Self {
        Self {
            fast,
            medium,
            slow,
            idle_threshold: idle_threshold.max(1),
            stage: PollStage::Fast,
            idle_streak: 0,
        }
    }

    /// Record one poll result and return the delay before the next poll
    pub fn record(&mut self, active: bool) -> Duration {
        if active {
            self.stage = PollStage::Fast;
            self.idle_streak = 0;
        } else {
            self.idle_streak += 1;
            if self.idle_streak >= self.idle_threshold && self.stage != PollStage::Slow {
                self.stage = self.stage.next();
                self.idle_streak = 0;
            }
        }
        self.interval()
    }

    pub fn stage(&self) -> PollStage {
        self.stage
    }

    pub fn interval(&self) -> Duration {
        match self.stage {
            PollStage::Fast => self.fast,
            PollStage::Medium => self.medium,
            PollStage::Slow => self.slow,
        }
    }
}
