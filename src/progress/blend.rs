// Two-phase progress blending and the per-item monotonic rule
use std::collections::HashMap;

use crate::error::{AppError, Result};
use crate::models::{ItemStatus, QueueItem, DEFAULT_DOWNLOAD_WEIGHT};

/// Slack allowed at the phase-1/phase-2 hand-off before a drop counts as a regression
pub const SEAM_TOLERANCE: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseWeights {
    download: f64,
}

impl Default for PhaseWeights {
    fn default() -> Self {
        Self { download: DEFAULT_DOWNLOAD_WEIGHT }
    }
}

impl PhaseWeights {
    pub fn new(download: f64) -> Result<Self> {
        if !download.is_finite() || download <= 0.0 || download >= 1.0 {
            return Err(AppError::Config(format!(
                "download weight must be between 0 and 1 (exclusive), got {}",
                download
            )));
        }
        Ok(Self { download })
    }

    pub fn download(&self) -> f64 {
        self.download
    }

    pub fn processing(&self) -> f64 {
        1.0 - self.download
    }

    /// Single [0,1] value for an item's current state
    pub fn blend(&self, item: &QueueItem) -> f64 {
        if item.status == ItemStatus::Done {
            1.0
        } else if item.processing {
            self.download + clamp_unit(item.progress) * self.processing()
        } else if item.downloaded {
            self.download
        } else if item.status == ItemStatus::Running {
            clamp_unit(item.download_progress) * self.download
        } else {
            0.0
        }
    }
}

/// Clamp into [0,1]; NaN counts as missing and becomes 0
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Copy)]
struct Observed {
    value: f64,
    processing: bool,
}

/// Remembers the last reported blended value per item id and refuses to
/// report anything lower, except across a restart or at the phase seam.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    weights: PhaseWeights,
    observed: HashMap<String, Observed>,
}

impl ProgressTracker {
    pub fn new(weights: PhaseWeights) -> Self {
        Self {
            weights,
            observed: HashMap::new(),
        }
    }

    pub fn weights(&self) -> PhaseWeights {
        self.weights
    }

    /// Record an observation of `item` and return the value to display
    pub fn observe(&mut self, item: &QueueItem) -> f64 {
        let raw = self.weights.blend(item);

        let value = match self.observed.get(&item.id) {
            // Failed or re-queued items start over
            _ if matches!(item.status, ItemStatus::Error | ItemStatus::Queued) => 0.0,
            None => raw,
            Some(last) => {
                let seam_handoff = item.processing
                    && !last.processing
                    && last.value <= self.weights.download() + SEAM_TOLERANCE
                    && raw >= self.weights.download();
                if seam_handoff {
                    raw
                } else {
                    raw.max(last.value)
                }
            }
        };

        self.observed.insert(
            item.id.clone(),
            Observed {
                value,
                processing: item.processing,
            },
        );
        value
    }

    /// Last reported value, if the item has been observed
    pub fn last(&self, id: &str) -> Option<f64> {
        self.observed.get(id).map(|o| o.value)
    }

    /// Drop ids that are no longer in the queue
    pub fn retain_ids<'a>(&mut self, ids: impl IntoIterator<Item = &'a str>) {
        let keep: std::collections::HashSet<&str> = ids.into_iter().collect();
        self.observed.retain(|id, _| keep.contains(id.as_str()));
    }

    pub fn len(&self) -> usize {
        self.observed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observed.is_empty()
    }
}
