// Job queue: admission, storage, source validation and dispatch
pub mod admission;
pub mod dispatch;
pub mod sources;
pub mod store;

pub use admission::{check_limit, AdmissionController, AdmissionPermit, MAX_CONCURRENCY_CEILING};
pub use dispatch::Dispatcher;
pub use sources::{parse_source, validate_folder, validate_local_file, AUDIO_EXTENSIONS};
pub use store::{ClearMode, JobStore};
