// Data models
pub mod api;
pub mod queue_item;
pub mod settings;

pub use api::*;
pub use queue_item::{title_from_path, ItemStatus, QueueItem, Source};
pub use settings::*;
