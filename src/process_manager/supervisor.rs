// Backend process supervision
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::TcpListener;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use super::tree::kill_process_tree;
use crate::logging::dated_log_path;
use crate::error::{AppError, Result};

const EPHEMERAL_PORTS: std::ops::RangeInclusive<u16> = 49152..=65535;
const RANDOM_PORT_ATTEMPTS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Stopped,
    Starting,
    Ready,
    /// Health wait timed out but the process is still alive
    Degraded,
    Crashed,
    Restarting,
    Stopping,
    /// Crash budget exhausted; no further automatic restarts
    Failed,
}

impl SupervisorState {
    fn is_live(self) -> bool {
        matches!(
            self,
            SupervisorState::Starting
                | SupervisorState::Ready
                | SupervisorState::Degraded
                | SupervisorState::Crashed
                | SupervisorState::Restarting
        )
    }
}

/// Sliding-window crash budget
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    window: Duration,
    max_crashes: usize,
    crashes: VecDeque<Instant>,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(5 * 60), 3)
    }
}

impl RestartPolicy {
    pub fn new(window: Duration, max_crashes: usize) -> Self {
        Self {
            window,
            max_crashes: max_crashes.max(1),
            crashes: VecDeque::new(),
        }
    }

    /// Record a crash at `now`. Returns whether another restart is allowed.
    pub fn record_crash(&mut self, now: Instant) -> bool {
        while let Some(oldest) = self.crashes.front() {
            if now.saturating_duration_since(*oldest) > self.window {
                self.crashes.pop_front();
            } else {
                break;
            }
        }
        self.crashes.push_back(now);
        self.crashes.len() < self.max_crashes
    }

    /// Crashes currently inside the window
    pub fn crash_count(&self) -> usize {
        self.crashes.len()
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub host: String,
    pub preferred_port: u16,
    /// Captured stdout/stderr lines are appended here
    pub log_path: Option<PathBuf>,
    /// Poll `/api/health` before declaring the backend ready
    pub health_check: bool,
    pub health_interval: Duration,
    pub health_timeout: Duration,
    pub shutdown_request_timeout: Duration,
    pub graceful_wait: Duration,
    pub restart_delay: Duration,
    pub restart_window: Duration,
    pub max_crashes: usize,
}

impl SupervisorConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            host: "127.0.0.1".to_string(),
            preferred_port: 9000,
            log_path: None,
            health_check: true,
            health_interval: Duration::from_millis(150),
            health_timeout: Duration::from_secs(15),
            shutdown_request_timeout: Duration::from_millis(400),
            graceful_wait: Duration::from_secs(2),
            restart_delay: Duration::from_millis(500),
            restart_window: Duration::from_secs(5 * 60),
            max_crashes: 3,
        }
    }
}

struct Running {
    pid: Option<u32>,
    kill: Option<oneshot::Sender<()>>,
    monitor: JoinHandle<()>,
}

/// Launches the backend on a free local port, restarts it after unexpected
/// exits within a crash budget, and kills the process tree only when a
/// graceful shutdown fails.
pub struct Supervisor {
    config: SupervisorConfig,
    state: watch::Sender<SupervisorState>,
    policy: Mutex<RestartPolicy>,
    running: Mutex<Option<Running>>,
    port: AtomicU16,
    stop_requested: AtomicBool,
    /// Serializes start and stop so concurrent callers share one sequence
    lifecycle: tokio::sync::Mutex<()>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Arc<Self> {
        let policy = RestartPolicy::new(config.restart_window, config.max_crashes);
        let (state, _) = watch::channel(SupervisorState::Stopped);
        Arc::new(Self {
            config,
            state,
            policy: Mutex::new(policy),
            running: Mutex::new(None),
            port: AtomicU16::new(0),
            stop_requested: AtomicBool::new(false),
            lifecycle: tokio::sync::Mutex::new(()),
        })
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    /// Port of the current (or last) backend instance
    pub fn port(&self) -> u16 {
        self.port.load(Ordering::SeqCst)
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.config.host, self.port())
    }

    pub fn crash_count(&self) -> usize {
        self.policy.lock().crash_count()
    }

    fn set_state(&self, next: SupervisorState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!("Supervisor state: {:?} -> {:?}", previous, next);
        }
    }

    /// Launch the backend and wait for it to become healthy.
    /// Returns `false` if it was already running.
    pub async fn start(self: &Arc<Self>) -> Result<bool> {
        {
            let _guard = self.lifecycle.lock().await;
            if self.state().is_live() {
                return Ok(false);
            }
            self.stop_requested.store(false, Ordering::SeqCst);
            self.set_state(SupervisorState::Starting);
            match self.spawn_instance() {
                Ok(running) => *self.running.lock() = Some(running),
                Err(e) => {
                    self.set_state(SupervisorState::Failed);
                    return Err(e);
                }
            }
        }
        self.wait_ready().await;
        Ok(true)
    }

    fn spawn_instance(self: &Arc<Self>) -> Result<Running> {
        let port = pick_port(&self.config.host, self.config.preferred_port);
        self.port.store(port, Ordering::SeqCst);

        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .envs(self.config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("STEMDECK_HOST", &self.config.host)
            .env("STEMDECK_PORT", port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            AppError::ProcessCrash(format!(
                "failed to launch {:?}: {}",
                self.config.program, e
            ))
        })?;
        let pid = child.id();
        info!("Backend started (pid {:?}) on port {}", pid, port);

        let sink = self.open_log_sink();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(capture_lines(stdout, "stdout", sink.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(capture_lines(stderr, "stderr", sink));
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        let monitor = tokio::spawn(Arc::clone(self).monitor(child, kill_rx));
        Ok(Running {
            pid,
            kill: Some(kill_tx),
            monitor,
        })
    }

    /// Each launch appends to the file for the current day
    fn open_log_sink(&self) -> Option<Arc<Mutex<File>>> {
        let base = self.config.log_path.as_ref()?;
        let path = dated_log_path(base, Local::now().date_naive());
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => Some(Arc::new(Mutex::new(file))),
            Err(e) => {
                warn!("Cannot open backend log {:?}: {}", path, e);
                None
            }
        }
    }

    async fn monitor(self: Arc<Self>, mut child: Child, kill_rx: oneshot::Receiver<()>) {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = kill_rx => {
                if let Some(pid) = child.id() {
                    kill_process_tree(pid);
                }
                let _ = child.kill().await;
                let _ = child.wait().await;
                info!("Backend killed");
                return;
            }
        };

        if self.stop_requested.load(Ordering::SeqCst) {
            debug!("Backend exited after shutdown request: {:?}", status);
            return;
        }

        match &status {
            Ok(status) => warn!("Backend exited unexpectedly: {}", status),
            Err(e) => warn!("Backend wait failed: {}", e),
        }
        self.set_state(SupervisorState::Crashed);

        let allowed = self.policy.lock().record_crash(Instant::now());
        if !allowed {
            error!(
                "Backend crashed {} times within {:?}; giving up",
                self.crash_count(),
                self.config.restart_window
            );
            self.set_state(SupervisorState::Failed);
            return;
        }

        self.set_state(SupervisorState::Restarting);
        tokio::time::sleep(self.config.restart_delay).await;

        if self.stop_requested.load(Ordering::SeqCst) {
            return;
        }
        let launched = {
            // Stop raises the flag before taking the slot, so checking it
            // under the slot lock means stop always sees the new instance
            let mut slot = self.running.lock();
            if self.stop_requested.load(Ordering::SeqCst) {
                return;
            }
            self.set_state(SupervisorState::Starting);
            self.spawn_instance().map(|running| *slot = Some(running))
        };
        match launched {
            Ok(()) => self.wait_ready().await,
            Err(e) => {
                error!("Backend restart failed: {}", e);
                self.set_state(SupervisorState::Failed);
            }
        }
    }

    async fn wait_ready(&self) {
        if !self.config.health_check {
            self.promote(SupervisorState::Ready);
            return;
        }

        let url = format!("{}/api/health", self.base_url());
        let deadline = Instant::now() + self.config.health_timeout;
        while Instant::now() < deadline {
            if self.state() != SupervisorState::Starting {
                return;
            }
            if probe_health(url.clone(), self.config.health_interval * 4).await {
                info!("Backend ready at {}", self.base_url());
                self.promote(SupervisorState::Ready);
                return;
            }
            tokio::time::sleep(self.config.health_interval).await;
        }

        warn!("Backend did not become healthy within {:?}", self.config.health_timeout);
        self.promote(SupervisorState::Degraded);
    }

    /// Move out of `Starting` only; a crash or stop that happened meanwhile wins
    fn promote(&self, next: SupervisorState) {
        self.state.send_if_modified(|state| {
            if *state == SupervisorState::Starting {
                *state = next;
                true
            } else {
                false
            }
        });
    }

    /// Graceful shutdown, then forced termination of the process tree.
    ///
    /// Safe to call repeatedly and concurrently; callers queue behind the
    /// first one and return `false` once it has finished.
    pub async fn stop(&self) -> bool {
        let _guard = self.lifecycle.lock().await;
        self.stop_requested.store(true, Ordering::SeqCst);

        let Some(mut running) = self.running.lock().take() else {
            if self.state() != SupervisorState::Failed {
                self.set_state(SupervisorState::Stopped);
            }
            return false;
        };

        self.set_state(SupervisorState::Stopping);
        let url = format!("{}/api/shutdown", self.base_url());
        if request_shutdown(url, self.config.shutdown_request_timeout).await {
            debug!("Shutdown request accepted");
        }

        let exited = tokio::time::timeout(self.config.graceful_wait, &mut running.monitor)
            .await
            .is_ok();

        if !exited {
            warn!("Backend did not exit in {:?}; killing process tree", self.config.graceful_wait);
            match running.kill.take().map(|kill| kill.send(())) {
                Some(Ok(())) => {}
                _ => {
                    if let Some(pid) = running.pid {
                        kill_process_tree(pid);
                    }
                }
            }
            if tokio::time::timeout(self.config.graceful_wait, &mut running.monitor)
                .await
                .is_err()
            {
                running.monitor.abort();
            }
        }

        self.set_state(SupervisorState::Stopped);
        info!("Backend stopped");
        true
    }
}

async fn capture_lines<R>(stream: R, label: &'static str, sink: Option<Arc<Mutex<File>>>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match &sink {
            Some(file) => {
                let entry = format!("{} [{}] {}\n", chrono::Utc::now().to_rfc3339(), label, line);
                if let Err(e) = file.lock().write_all(entry.as_bytes()) {
                    debug!("Backend log write failed: {}", e);
                }
            }
            None => debug!("[backend {}] {}", label, line),
        }
    }
}

/// Preferred port if free, else a random ephemeral one, else whatever the OS hands out
pub fn pick_port(host: &str, preferred: u16) -> u16 {
    if preferred != 0 && TcpListener::bind((host, preferred)).is_ok() {
        return preferred;
    }

    let mut rng = rand::thread_rng();
    for _ in 0..RANDOM_PORT_ATTEMPTS {
        let port = rng.gen_range(EPHEMERAL_PORTS);
        if TcpListener::bind((host, port)).is_ok() {
            return port;
        }
    }

    TcpListener::bind((host, 0))
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .unwrap_or(preferred)
}

async fn probe_health(url: String, timeout: Duration) -> bool {
    tokio::task::spawn_blocking(move || {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        matches!(agent.get(&url).call(), Ok(resp) if resp.status() == 200)
    })
    .await
    .unwrap_or(false)
}

async fn request_shutdown(url: String, timeout: Duration) -> bool {
    tokio::task::spawn_blocking(move || {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        agent.post(&url).send_string("").is_ok()
    })
    .await
    .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_cap_within_window() {
        let mut policy = RestartPolicy::default();
        let t0 = Instant::now();
        assert!(policy.record_crash(t0));
        assert!(policy.record_crash(t0 + Duration::from_secs(60)));
        // Third crash inside five minutes exhausts the budget
        assert!(!policy.record_crash(t0 + Duration::from_secs(120)));

        // A crash after the window has passed starts counting afresh
        assert!(policy.record_crash(t0 + Duration::from_secs(120 + 5 * 60 + 1)));
        assert_eq!(policy.crash_count(), 1);
    }

    #[test]
    fn test_spread_out_crashes_keep_restarting() {
        let mut policy = RestartPolicy::new(Duration::from_secs(10), 3);
        let t0 = Instant::now();
        for n in 0..10 {
            assert!(policy.record_crash(t0 + Duration::from_secs(n * 6)));
        }
        assert!(policy.crash_count() <= 2);
    }

    #[test]
    fn test_crashed_counts_as_live() {
        for state in [
            SupervisorState::Starting,
            SupervisorState::Ready,
            SupervisorState::Degraded,
            SupervisorState::Crashed,
            SupervisorState::Restarting,
        ] {
            assert!(state.is_live(), "{:?}", state);
        }
        for state in [
            SupervisorState::Stopped,
            SupervisorState::Stopping,
            SupervisorState::Failed,
        ] {
            assert!(!state.is_live(), "{:?}", state);
        }
    }

    #[test]
    fn test_pick_port_prefers_free_port() {
        let taken = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let busy = taken.local_addr().unwrap().port();
        let port = pick_port("127.0.0.1", busy);
        assert_ne!(port, busy);
        assert_ne!(port, 0);
    }

    #[cfg(unix)]
    fn sh_config(script: &str) -> SupervisorConfig {
        let mut config = SupervisorConfig::new("sh");
        config.args = vec!["-c".to_string(), script.to_string()];
        config.preferred_port = 0;
        config.health_check = false;
        config.restart_delay = Duration::from_millis(20);
        config.graceful_wait = Duration::from_millis(300);
        config.shutdown_request_timeout = Duration::from_millis(100);
        config
    }

    #[cfg(unix)]
    async fn wait_for(sup: &Supervisor, target: SupervisorState) {
        let mut rx = sup.subscribe();
        tokio::time::timeout(Duration::from_secs(10), rx.wait_for(|s| *s == target))
            .await
            .expect("state not reached")
            .unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_crash_loop_ends_in_failed() {
        let sup = Supervisor::new(sh_config("exit 1"));
        assert!(sup.start().await.unwrap());
        wait_for(&sup, SupervisorState::Failed).await;
        assert_eq!(sup.crash_count(), 3);

        // Stopping a failed supervisor is harmless
        sup.stop().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_shares_one_sequence() {
        let sup = Supervisor::new(sh_config("sleep 30"));
        assert!(sup.start().await.unwrap());
        assert_eq!(sup.state(), SupervisorState::Ready);
        assert!(!sup.start().await.unwrap());

        let stops: Vec<_> = (0..3)
            .map(|_| {
                let sup = Arc::clone(&sup);
                tokio::spawn(async move { sup.stop().await })
            })
            .collect();
        let mut performed = 0;
        for stop in stops {
            if stop.await.unwrap() {
                performed += 1;
            }
        }
        assert_eq!(performed, 1);
        assert_eq!(sup.state(), SupervisorState::Stopped);
        assert_eq!(sup.crash_count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_output_is_captured_to_log() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("logs").join("backend.log");
        let mut config = sh_config("echo hello; echo oops >&2; sleep 30");
        config.log_path = Some(log_path.clone());

        let sup = Supervisor::new(config);
        sup.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        sup.stop().await;

        let files: Vec<_> = std::fs::read_dir(dir.path().join("logs"))
            .unwrap()
            .flatten()
            .map(|e| e.path())
            .collect();
        assert_eq!(files.len(), 1);
        let name = files[0].file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("backend-") && name.ends_with(".log"));

        let contents = std::fs::read_to_string(&files[0]).unwrap();
        assert!(contents.contains("[stdout] hello"));
        assert!(contents.contains("[stderr] oops"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unhealthy_backend_is_degraded() {
        let mut config = sh_config("sleep 30");
        config.health_check = true;
        config.health_interval = Duration::from_millis(20);
        config.health_timeout = Duration::from_millis(200);

        let sup = Supervisor::new(config);
        sup.start().await.unwrap();
        assert_eq!(sup.state(), SupervisorState::Degraded);
        sup.stop().await;
    }
}
