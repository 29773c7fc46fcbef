// Progress model and client-side aggregation
pub mod aggregator;
pub mod blend;

pub use aggregator::{average_progress, GlobalAggregator, PollBackoff, PollStage};
pub use blend::{clamp_unit, PhaseWeights, ProgressTracker, SEAM_TOLERANCE};
