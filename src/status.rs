/// Watchdog status file and pid file.
///
/// `watchdog.status` is rewritten as JSON on every state transition so that
/// `status` and `serve` can report what a running watchdog is doing. It is
/// informational only; the watchdog never reads it back.
use crate::output_dir::{write_atomic, OutputDir};
use crate::process::{is_alive, terminate_pid, Termination};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Lines of `watchdog.log` included in a status report.
const LOG_TAIL_LINES: usize = 10;
/// How long `stop` waits after SIGTERM before escalating.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Watchdog states written to the status file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchdogState {
    Starting,
    Idle,
    Suspect,
    Recovering,
    Halted,
    ShuttingDown,
}

/// The JSON payload written to `watchdog.status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusData {
    pub pid: u32,
    pub state: WatchdogState,
    pub last_utilization: Option<f64>,
    pub suspect_since: Option<DateTime<Utc>>,
    pub recoveries: u32,
    pub last_update: DateTime<Utc>,
}

/// Manages the status file lifecycle.
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Atomically replace the status file.
    pub fn write(&self, data: &StatusData) -> Result<(), StatusError> {
        let json =
            serde_json::to_vec_pretty(data).map_err(|e| StatusError::Serialize { source: e })?;
        write_atomic(&self.path, &json).map_err(|e| StatusError::Write {
            path: self.path.clone(),
            source: e,
        })
    }

    /// Last written status, if any and readable.
    pub fn read(&self) -> Option<StatusData> {
        let contents = std::fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&contents).ok()
    }
}

/// Mutable state tracker that builds StatusData for each update.
pub struct StatusTracker {
    file: StatusFile,
    pid: u32,
    last_utilization: Option<f64>,
    suspect_since: Option<DateTime<Utc>>,
    recoveries: u32,
}

impl StatusTracker {
    pub fn new(status_path: PathBuf) -> Self {
        Self {
            file: StatusFile::new(status_path),
            pid: std::process::id(),
            last_utilization: None,
            suspect_since: None,
            recoveries: 0,
        }
    }

    /// Write the status file with the given state. Failures are logged only.
    pub fn update(&self, state: WatchdogState) {
        let data = StatusData {
            pid: self.pid,
            state,
            last_utilization: self.last_utilization,
            suspect_since: self.suspect_since,
            recoveries: self.recoveries,
            last_update: Utc::now(),
        };

        if let Err(e) = self.file.write(&data) {
            tracing::warn!(error = %e, "failed to write status file");
        }
    }

    pub fn set_last_utilization(&mut self, utilization: Option<f64>) {
        self.last_utilization = utilization;
    }

    /// Start of the current low-utilization window. Keeps the first value
    /// until cleared.
    pub fn mark_suspect(&mut self) {
        self.suspect_since.get_or_insert_with(Utc::now);
    }

    pub fn clear_suspect(&mut self) {
        self.suspect_since = None;
    }

    pub fn record_recovery(&mut self) {
        self.recoveries += 1;
        self.suspect_since = None;
    }

    pub fn recoveries(&self) -> u32 {
        self.recoveries
    }
}

/// `monitor.pid` for the lifetime of a watchdog run.
///
/// Holds an advisory exclusive lock while the watchdog runs. The file is
/// removed on drop as long as it still names this process.
pub struct PidFile {
    path: PathBuf,
    file: std::fs::File,
    locked: bool,
}

impl PidFile {
    /// Write our pid. Another live holder of the lock is reported, not fatal.
    pub fn acquire(path: &Path) -> Result<Self, StatusError> {
        let io_err = |e| StatusError::PidFile {
            path: path.to_path_buf(),
            source: e,
        };
        let previous = read_pid(path);
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(io_err)?;

        let locked = match FileExt::try_lock_exclusive(&file) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    other_pid = ?previous,
                    error = %e,
                    "another watchdog appears to be running for this output directory"
                );
                false
            }
        };

        let pid = std::process::id();
        file.set_len(0).map_err(io_err)?;
        writeln!(file, "{pid}").map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        tracing::debug!(pid, path = %path.display(), locked, "wrote pid file");

        Ok(Self {
            path: path.to_path_buf(),
            file,
            locked,
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if read_pid(&self.path) == Some(std::process::id()) {
            let _ = std::fs::remove_file(&self.path);
        }
        if self.locked {
            let _ = FileExt::unlock(&self.file);
        }
    }
}

/// Parse the pid stored in a pid file.
pub fn read_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// What `status` reports about the watchdog of one output directory.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub state: Option<StatusData>,
    pub log_path: PathBuf,
    pub log_tail: String,
}

pub fn monitor_status(output: &OutputDir) -> MonitorStatus {
    let pid = read_pid(&output.monitor_pid());
    let running = pid.is_some_and(is_alive);
    MonitorStatus {
        running,
        pid: pid.filter(|_| running),
        state: StatusFile::new(output.status()).read(),
        log_path: output.watchdog_log(),
        log_tail: tail_lines(&output.watchdog_log(), LOG_TAIL_LINES),
    }
}

/// Last `n` lines of a text file; empty if it cannot be read.
pub fn tail_lines(path: &Path, n: usize) -> String {
    let Ok(bytes) = std::fs::read(path) else {
        return String::new();
    };
    let text = String::from_utf8_lossy(&bytes);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

/// Result of `stop_monitor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// No pid file.
    NotRunning,
    /// A pid file named a process that was already gone; the file was removed.
    Stale { pid: u32 },
    Stopped { pid: u32, forced: bool },
}

impl std::fmt::Display for StopOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopOutcome::NotRunning => write!(f, "No monitor running"),
            StopOutcome::Stale { pid } => write!(f, "Monitor was not running (PID: {pid})"),
            StopOutcome::Stopped { pid, forced: false } => {
                write!(f, "Monitor stopped (PID: {pid})")
            }
            StopOutcome::Stopped { pid, forced: true } => {
                write!(f, "Monitor killed after grace period (PID: {pid})")
            }
        }
    }
}

/// Stop the watchdog of `output`: SIGTERM, a short grace period, then SIGKILL.
pub async fn stop_monitor(output: &OutputDir) -> Result<StopOutcome, StatusError> {
    stop_with_grace(&output.monitor_pid(), STOP_GRACE).await
}

async fn stop_with_grace(pid_path: &Path, grace: Duration) -> Result<StopOutcome, StatusError> {
    if !pid_path.exists() {
        return Ok(StopOutcome::NotRunning);
    }
    let Some(pid) = read_pid(pid_path) else {
        tracing::warn!(path = %pid_path.display(), "unreadable pid file, removing");
        remove_pid_file(pid_path)?;
        return Ok(StopOutcome::NotRunning);
    };

    let outcome = match terminate_pid(pid, false) {
        Ok(Termination::AlreadyGone) => StopOutcome::Stale { pid },
        Ok(Termination::Signalled) => {
            tokio::time::sleep(grace).await;
            let forced = is_alive(pid);
            if forced {
                tracing::warn!(pid, "watchdog ignored SIGTERM, killing");
                terminate_pid(pid, true).map_err(|e| StatusError::Stop { pid, source: e })?;
            }
            StopOutcome::Stopped { pid, forced }
        }
        Err(e) => return Err(StatusError::Stop { pid, source: e }),
    };

    remove_pid_file(pid_path)?;
    Ok(outcome)
}

fn remove_pid_file(path: &Path) -> Result<(), StatusError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StatusError::PidFile {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Errors from status and pid file operations.
#[derive(Debug)]
pub enum StatusError {
    Serialize {
        source: serde_json::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    PidFile {
        path: PathBuf,
        source: std::io::Error,
    },
    Stop {
        pid: u32,
        source: crate::process::ProcessError,
    },
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusError::Serialize { source } => write!(f, "failed to serialize status: {source}"),
            StatusError::Write { path, source } => {
                write!(f, "failed to write status file {}: {source}", path.display())
            }
            StatusError::PidFile { path, source } => {
                write!(f, "pid file {}: {source}", path.display())
            }
            StatusError::Stop { pid, source } => {
                write!(f, "failed to stop monitor (PID: {pid}): {source}")
            }
        }
    }
}

impl std::error::Error for StatusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatusError::Serialize { source } => Some(source),
            StatusError::Write { source, .. } => Some(source),
            StatusError::PidFile { source, .. } => Some(source),
            StatusError::Stop { source, .. } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample(state: WatchdogState) -> StatusData {
        StatusData {
            pid: 12345,
            state,
            last_utilization: Some(2.0),
            suspect_since: None,
            recoveries: 1,
            last_update: Utc::now(),
        }
    }

    #[test]
    fn test_status_file_round_trip() {
        let dir = tempdir().unwrap();
        let sf = StatusFile::new(dir.path().join("watchdog.status"));
        let data = sample(WatchdogState::Suspect);

        sf.write(&data).unwrap();
        assert_eq!(sf.read().unwrap(), data);

        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("watchdog.status")).unwrap())
                .unwrap();
        assert_eq!(parsed["state"], "suspect");
        assert_eq!(parsed["recoveries"], 1);
    }

    #[test]
    fn test_status_file_missing_or_corrupt_reads_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("watchdog.status");
        let sf = StatusFile::new(path.clone());
        assert!(sf.read().is_none());
        std::fs::write(&path, "{not json").unwrap();
        assert!(sf.read().is_none());
    }

    #[test]
    fn test_all_watchdog_states_serialize() {
        let states = vec![
            (WatchdogState::Starting, "starting"),
            (WatchdogState::Idle, "idle"),
            (WatchdogState::Suspect, "suspect"),
            (WatchdogState::Recovering, "recovering"),
            (WatchdogState::Halted, "halted"),
            (WatchdogState::ShuttingDown, "shutting_down"),
        ];
        for (state, expected) in states {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{expected}\""));
        }
    }

    #[test]
    fn test_status_tracker_lifecycle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("watchdog.status");
        let sf = StatusFile::new(path.clone());
        let mut tracker = StatusTracker::new(path);

        tracker.update(WatchdogState::Starting);
        assert_eq!(sf.read().unwrap().state, WatchdogState::Starting);

        tracker.set_last_utilization(Some(1.5));
        tracker.mark_suspect();
        let since = tracker.suspect_since;
        tracker.mark_suspect();
        assert_eq!(tracker.suspect_since, since);
        tracker.update(WatchdogState::Suspect);
        let s = sf.read().unwrap();
        assert_eq!(s.last_utilization, Some(1.5));
        assert!(s.suspect_since.is_some());

        tracker.record_recovery();
        tracker.update(WatchdogState::Idle);
        let s = sf.read().unwrap();
        assert_eq!(s.recoveries, 1);
        assert!(s.suspect_since.is_none());
        assert_eq!(s.pid, std::process::id());
    }

    #[test]
    fn test_status_file_write_to_nonexistent_dir_fails() {
        let sf = StatusFile::new(PathBuf::from("/nonexistent/dir/watchdog.status"));
        assert!(sf.write(&sample(WatchdogState::Idle)).is_err());
    }

    #[test]
    fn test_pid_file_written_and_removed_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("monitor.pid");
        {
            let pid_file = PidFile::acquire(&path).unwrap();
            assert!(pid_file.locked);
            assert_eq!(read_pid(&path), Some(std::process::id()));
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_pid_file_overwrites_stale_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("monitor.pid");
        std::fs::write(&path, "999999999999\n").unwrap();
        let _pid_file = PidFile::acquire(&path).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            format!("{}\n", std::process::id())
        );
    }

    #[test]
    fn test_pid_file_left_alone_when_taken_over() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("monitor.pid");
        let pid_file = PidFile::acquire(&path).unwrap();
        std::fs::write(&path, "1\n").unwrap();
        drop(pid_file);
        assert_eq!(read_pid(&path), Some(1));
    }

    #[test]
    fn test_tail_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("watchdog.log");
        let body: String = (1..=15).map(|i| format!("line {i}\n")).collect();
        std::fs::write(&path, body).unwrap();

        let tail = tail_lines(&path, 10);
        assert!(tail.starts_with("line 6\n"));
        assert!(tail.ends_with("line 15"));
        assert_eq!(tail_lines(&dir.path().join("missing.log"), 10), "");
    }

    #[test]
    fn test_monitor_status_without_watchdog() {
        let dir = tempdir().unwrap();
        let out = OutputDir::resolve(dir.path()).unwrap();
        let status = monitor_status(&out);
        assert!(!status.running);
        assert!(status.pid.is_none());
        assert!(status.state.is_none());
        assert_eq!(status.log_path, out.watchdog_log());
    }

    #[test]
    fn test_monitor_status_reports_live_pid_and_state() {
        let dir = tempdir().unwrap();
        let out = OutputDir::resolve(dir.path()).unwrap();
        let _pid_file = PidFile::acquire(&out.monitor_pid()).unwrap();
        StatusFile::new(out.status())
            .write(&sample(WatchdogState::Idle))
            .unwrap();
        std::fs::write(out.watchdog_log(), "started\nidle\n").unwrap();

        let status = monitor_status(&out);
        assert!(status.running);
        assert_eq!(status.pid, Some(std::process::id()));
        assert_eq!(status.state.unwrap().state, WatchdogState::Idle);
        assert_eq!(status.log_tail, "started\nidle");
    }

    #[tokio::test]
    async fn test_stop_without_pid_file() {
        let dir = tempdir().unwrap();
        let out = OutputDir::resolve(dir.path()).unwrap();
        assert_eq!(stop_monitor(&out).await.unwrap(), StopOutcome::NotRunning);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_stale_pid_removes_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("monitor.pid");
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        std::fs::write(&path, format!("{pid}\n")).unwrap();

        let outcome = stop_with_grace(&path, Duration::from_millis(10)).await.unwrap();
        assert_eq!(outcome, StopOutcome::Stale { pid });
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_terminates_running_process() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("monitor.pid");
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        std::fs::write(&path, format!("{pid}\n")).unwrap();

        // Reap concurrently so the exited child does not linger as a zombie
        let waiter = tokio::spawn(async move { child.wait().await });
        let outcome = stop_with_grace(&path, Duration::from_millis(500)).await.unwrap();
        assert_eq!(outcome, StopOutcome::Stopped { pid, forced: false });
        assert!(!path.exists());
        assert!(waiter.await.unwrap().is_ok());
    }

    #[test]
    fn test_stop_outcome_display() {
        assert_eq!(StopOutcome::NotRunning.to_string(), "No monitor running");
        assert_eq!(
            StopOutcome::Stopped {
                pid: 7,
                forced: false
            }
            .to_string(),
            "Monitor stopped (PID: 7)"
        );
    }
}
