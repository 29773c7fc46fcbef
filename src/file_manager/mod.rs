pub mod json_ops;
pub mod settings_store;

pub use json_ops::*;
pub use settings_store::SettingsStore;
