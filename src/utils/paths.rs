use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;

use log::info;

use crate::error::Result;

pub const DATA_DIR_ENV: &str = "STEMDECK_DATA_DIR";
pub const WORKERS_DIR_ENV: &str = "STEMDECK_WORKERS_DIR";
const APP_DIR_NAME: &str = "StemDeck";

static APP_DATA_DIR: OnceLock<PathBuf> = OnceLock::new();

pub fn get_app_data_dir() -> PathBuf {
    APP_DATA_DIR
        .get_or_init(|| match std::env::var(DATA_DIR_ENV) {
            Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir.trim()),
            _ => dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(APP_DIR_NAME),
        })
        .clone()
}

pub fn get_data_dir() -> PathBuf {
    get_app_data_dir().join("data")
}

pub fn get_logs_dir() -> PathBuf {
    get_app_data_dir().join("logs")
}

/// Per-item scratch space for downloads
pub fn get_work_dir() -> PathBuf {
    get_app_data_dir().join("work")
}

pub fn get_settings_json_path() -> PathBuf {
    get_data_dir().join("settings.json")
}

/// Base name; the supervisor writes one dated file per day next to it
pub fn get_backend_log_path() -> PathBuf {
    get_logs_dir().join("backend.log")
}

/// Where stems land when no output folder is configured
pub fn default_output_dir() -> PathBuf {
    dirs::desktop_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR_NAME)
}

pub fn initialize_data_directories() -> Result<()> {
    let directories = [get_data_dir(), get_logs_dir(), get_work_dir()];

    for dir in &directories {
        if !dir.exists() {
            fs::create_dir_all(dir)?;
            info!("Created directory: {:?}", dir);
        }
    }

    info!("Data directories initialized at: {:?}", get_app_data_dir());
    Ok(())
}
