// Python worker process management
// Spawns a worker script, feeds it one JSON request and follows its JSON-lines output

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::tree::kill_process_tree;
use crate::error::{truncate_message, AppError, Result, MAX_ITEM_ERROR_LEN};
use crate::models::Settings;
use crate::pipeline::{PhaseProgress, ProgressFn};
use crate::progress::clamp_unit;
use crate::utils::WORKERS_DIR_ENV;

#[cfg(windows)]
use std::os::windows::process::CommandExt;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

const STDERR_TAIL_LINES: usize = 20;
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Progress {
        fraction: f64,
        #[serde(default)]
        eta_sec: Option<f64>,
        #[serde(default)]
        stage: Option<String>,
    },
    Result {
        data: serde_json::Value,
    },
    Error {
        message: String,
    },
    Log {
        level: String,
        message: String,
    },
}

pub fn get_python_path(configured: Option<&str>) -> String {
    if let Some(path) = configured.filter(|p| !p.trim().is_empty()) {
        return path.to_string();
    }

    #[cfg(target_os = "windows")]
    let paths = ["python", "python3", "py"];

    #[cfg(not(target_os = "windows"))]
    let paths = ["python3", "python"];

    for path in paths {
        let mut cmd = std::process::Command::new(path);
        cmd.arg("--version");

        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        if cmd.output().is_ok() {
            return path.to_string();
        }
    }

    "python".to_string()
}

/// Locate the python_workers directory
pub fn get_workers_dir(configured: Option<&str>) -> PathBuf {
    if let Some(dir) = configured.filter(|d| !d.trim().is_empty()) {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var(WORKERS_DIR_ENV) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }

    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            let workers_dir = exe_dir.join("python_workers");
            if workers_dir.exists() {
                return workers_dir;
            }

            let mut current = exe_dir;
            for _ in 0..3 {
                if let Some(parent) = current.parent() {
                    let dev_workers_dir = parent.join("python_workers");
                    if dev_workers_dir.exists() {
                        debug!("Found python_workers at: {:?}", dev_workers_dir);
                        return dev_workers_dir;
                    }
                    current = parent;
                }
            }
        }
    }

    let cwd_workers = std::env::current_dir()
        .unwrap_or_default()
        .join("python_workers");

    debug!("Fallback to current dir python_workers: {:?}", cwd_workers);
    cwd_workers
}

/// Interpreter plus script directory, resolved once
#[derive(Debug, Clone)]
pub struct WorkerRuntime {
    python: String,
    workers_dir: PathBuf,
}

impl WorkerRuntime {
    pub fn new(python: impl Into<String>, workers_dir: impl Into<PathBuf>) -> Self {
        Self {
            python: python.into(),
            workers_dir: workers_dir.into(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            get_python_path(settings.python_path.as_deref()),
            get_workers_dir(settings.workers_dir.as_deref()),
        )
    }

    pub fn workers_dir(&self) -> &Path {
        &self.workers_dir
    }

    /// Run `script` with `input` on stdin until it exits or `cancel` fires.
    ///
    /// Fails if the worker reported an error, exited non-zero or never
    /// produced a result. On cancellation the whole process tree is killed.
    pub async fn run(
        &self,
        script: &str,
        input: &serde_json::Value,
        progress: &ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value> {
        let script_path = self.workers_dir.join(script);
        if !script_path.exists() {
            return Err(AppError::Worker(format!(
                "Worker script not found: {:?}",
                script_path
            )));
        }

        info!("Spawning Python worker: {:?}", script_path);

        let mut cmd = Command::new(&self.python);
        cmd.arg(&script_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("PYTHONUNBUFFERED", "1")
            .kill_on_drop(true);

        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let mut child = cmd
            .spawn()
            .map_err(|e| AppError::Worker(format!("Failed to spawn Python process: {}", e)))?;

        let input_json = serde_json::to_string(input)?;
        if let Some(mut stdin) = child.stdin.take() {
            // A worker that exits early closes the pipe; its exit status tells the story
            if let Err(e) = stdin.write_all(input_json.as_bytes()).await {
                warn!("Failed to write worker input: {}", e);
            }
            let _ = stdin.shutdown().await;
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Worker("Failed to capture stdout".to_string()))?;

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let stderr_task = child.stderr.take().map(|stderr| {
            let tail = Arc::clone(&stderr_tail);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[Python stderr] {}", line);
                    let mut guard = tail.lock();
                    if guard.len() == STDERR_TAIL_LINES {
                        guard.pop_front();
                    }
                    guard.push_back(line);
                }
            })
        });

        let mut reader = BufReader::new(stdout).lines();
        let mut last_result: Option<serde_json::Value> = None;
        let mut last_error: Option<String> = None;

        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => {
                    if let Some(pid) = child.id() {
                        kill_process_tree(pid);
                    }
                    let _ = child.kill().await;
                    info!("Python worker {} canceled", script);
                    return Err(AppError::Canceled);
                }
                line = reader.next_line() => line,
            };

            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to read worker output: {}", e);
                    break;
                }
            };

            match serde_json::from_str::<WorkerMessage>(&line) {
                Ok(WorkerMessage::Progress { fraction, eta_sec, stage }) => {
                    if let Some(stage) = stage {
                        debug!("[Python] stage: {}", stage);
                    }
                    progress(PhaseProgress {
                        fraction: clamp_unit(fraction),
                        eta_sec: eta_sec.filter(|eta| eta.is_finite() && *eta >= 0.0),
                    });
                }
                Ok(WorkerMessage::Result { data }) => last_result = Some(data),
                Ok(WorkerMessage::Error { message }) => last_error = Some(message),
                Ok(WorkerMessage::Log { level, message }) => match level.as_str() {
                    "error" | "warning" | "warn" => warn!("[Python {}] {}", level, message),
                    "info" => info!("[Python] {}", message),
                    _ => debug!("[Python {}] {}", level, message),
                },
                Err(_) => debug!("[Python] {}", line),
            }
        }

        let status = child.wait().await?;
        if let Some(task) = stderr_task {
            // Grandchildren may keep stderr open; don't wait on them forever
            let _ = tokio::time::timeout(STDERR_DRAIN_TIMEOUT, task).await;
        }
        let exit_code = status.code().unwrap_or(-1);
        debug!("Python worker exited with code: {}", exit_code);

        if let Some(error) = last_error {
            return Err(AppError::Worker(truncate_message(&error, MAX_ITEM_ERROR_LEN)));
        }

        if exit_code != 0 {
            let tail = stderr_tail.lock().iter().cloned().collect::<Vec<_>>().join("\n");
            let message = if tail.trim().is_empty() {
                format!("Python worker exited with code: {}", exit_code)
            } else {
                format!("exit code {}: {}", exit_code, tail)
            };
            return Err(AppError::Worker(truncate_message(&message, MAX_ITEM_ERROR_LEN)));
        }

        last_result.ok_or_else(|| AppError::Worker("No result from Python worker".to_string()))
    }
}
