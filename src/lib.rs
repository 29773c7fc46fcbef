pub mod client;
pub mod commands;
pub mod error;
pub mod file_manager;
pub mod logging;
pub mod models;
pub mod pipeline;
pub mod process_manager;
pub mod progress;
pub mod queue;
pub mod utils;

use std::net::SocketAddr;
use std::sync::Arc;

use log::{info, warn};

use commands::AppState;
use error::{AppError, Result};
use file_manager::SettingsStore;
use pipeline::{DemucsSeparator, LocalIngest, Pipeline, RemoteFetcher};
use process_manager::WorkerRuntime;
use queue::{AdmissionController, Dispatcher, JobStore};
use utils::{get_logs_dir, get_settings_json_path, get_work_dir, initialize_data_directories};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 9000;

fn initialize_app_data() -> Result<()> {
    initialize_data_directories()?;

    let removed = logging::cleanup_old_logs(&get_logs_dir());
    if removed > 0 {
        info!("Removed {} old log file(s)", removed);
    }
    Ok(())
}

/// Wire settings, admission, pipeline and dispatcher into handler state
pub fn build_state(settings: Arc<SettingsStore>) -> AppState {
    let current = settings.get();
    let runtime = WorkerRuntime::from_settings(&current);
    info!("Python workers directory: {:?}", runtime.workers_dir());

    let pipeline = Pipeline {
        remote: Arc::new(RemoteFetcher::new(runtime.clone(), get_work_dir())),
        local: Arc::new(LocalIngest),
        separator: Arc::new(DemucsSeparator::new(runtime, get_work_dir())),
    };
    let dispatcher = Dispatcher::new(
        Arc::new(JobStore::new()),
        Arc::new(AdmissionController::new(current.max_concurrency)),
        pipeline,
        Arc::clone(&settings),
    );
    AppState::new(dispatcher, settings)
}

/// Run the Status API and queue engine until shutdown
pub async fn run_backend(host: &str, port: u16) -> Result<()> {
    if let Err(e) = initialize_app_data() {
        warn!("Failed to initialize app data: {}", e);
    }

    let settings = Arc::new(SettingsStore::load(get_settings_json_path()));
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .map_err(|e| AppError::Config(format!("Invalid bind address {}:{}: {}", host, port, e)))?;

    commands::serve(build_state(settings), addr).await
}
