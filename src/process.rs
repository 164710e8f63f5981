//! Training process discovery and termination.
//!
//! Processes are found by scanning the process table and matching command
//! lines against fixed fragments. Liveness and signal delivery go through
//! `is_alive` and `terminate_pid`; nothing else in the crate touches signal
//! numbers.

use crate::config::ProcessConfig;
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;
#[cfg(unix)]
use tokio::process::Command;

/// `ps -eo pid=,args=` line: leading pid, then the full command line.
static PS_LINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*(\d+)\s+(.+?)\s*$").unwrap());

#[cfg(unix)]
const SCAN_TIMEOUT: Duration = Duration::from_secs(5);

/// A process that looks like part of the training job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingProcess {
    pub pid: u32,
    pub command_line: String,
}

/// Result of signalling one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Signalled,
    /// The process had already exited.
    AlreadyGone,
}

/// Outcome of a best-effort `terminate_all`.
#[derive(Debug, Clone, Default)]
pub struct TerminateReport {
    pub found: usize,
    /// Matches still present after the settle period.
    pub survivors: Vec<TrainingProcess>,
}

/// Errors from signalling a process.
#[derive(Debug)]
pub enum ProcessError {
    /// Refuse pids that would address a process group or every process.
    InvalidPid { pid: u32 },
    Signal { pid: u32, source: std::io::Error },
    Unsupported,
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessError::InvalidPid { pid } => write!(f, "refusing to signal pid {pid}"),
            ProcessError::Signal { pid, source } => {
                write!(f, "failed to signal process {pid}: {source}")
            }
            ProcessError::Unsupported => {
                write!(f, "process signalling is not supported on this platform")
            }
        }
    }
}

impl std::error::Error for ProcessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProcessError::Signal { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Process control as seen by the orchestrator.
pub trait ProcessControl {
    /// Terminate every training process and report survivors.
    async fn terminate_all(&mut self, force: bool) -> TerminateReport;
}

pub struct ProcessRegistry {
    interpreter: String,
    patterns: Vec<String>,
    settle: Duration,
    own_pid: u32,
}

impl ProcessRegistry {
    pub fn new(config: &ProcessConfig) -> Self {
        Self {
            interpreter: config.interpreter.to_lowercase(),
            patterns: config
                .patterns
                .iter()
                .filter(|p| !p.trim().is_empty())
                .cloned()
                .collect(),
            settle: Duration::from_secs(config.settle_secs),
            own_pid: std::process::id(),
        }
    }

    /// Whether a command line belongs to the training job.
    pub fn matches(&self, command_line: &str) -> bool {
        if !self.interpreter.is_empty() && !command_line.to_lowercase().contains(&self.interpreter)
        {
            return false;
        }
        self.patterns.iter().any(|p| command_line.contains(p.as_str()))
    }

    /// Scan the process table for training processes, excluding ourselves.
    pub async fn find_training_processes(&self) -> Vec<TrainingProcess> {
        list_processes()
            .await
            .into_iter()
            .filter(|p| p.pid != self.own_pid && self.matches(&p.command_line))
            .collect()
    }

    /// Send a graceful termination signal, or an immediate kill when `force`.
    pub fn terminate(&self, pid: u32, force: bool) -> Result<Termination, ProcessError> {
        terminate_pid(pid, force)
    }
}

impl ProcessControl for ProcessRegistry {
    async fn terminate_all(&mut self, force: bool) -> TerminateReport {
        let processes = self.find_training_processes().await;
        tracing::info!(count = processes.len(), force, "terminating training processes");

        for proc in &processes {
            let cmd: String = proc.command_line.chars().take(100).collect();
            match self.terminate(proc.pid, force) {
                Ok(Termination::Signalled) => {
                    tracing::info!(pid = proc.pid, command = %cmd, "signalled training process")
                }
                Ok(Termination::AlreadyGone) => {
                    tracing::warn!(pid = proc.pid, "process already exited")
                }
                Err(e) => tracing::error!(pid = proc.pid, error = %e, "failed to terminate process"),
            }
        }

        tokio::time::sleep(self.settle).await;

        let survivors = self.find_training_processes().await;
        if survivors.is_empty() {
            tracing::info!("all training processes terminated");
        } else {
            tracing::warn!(
                remaining = survivors.len(),
                pids = ?survivors.iter().map(|p| p.pid).collect::<Vec<_>>(),
                "training processes still present after cleanup"
            );
        }

        TerminateReport {
            found: processes.len(),
            survivors,
        }
    }
}

/// Whether `pid` refers to a process we can see (signal-0 probe).
///
/// A process owned by another user still counts as alive.
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;

    let Some(pid) = to_pid(pid) else {
        return false;
    };
    match kill(pid, None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn is_alive(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn to_pid(pid: u32) -> Option<nix::unistd::Pid> {
    // 0 and negative values address process groups; never signal those.
    i32::try_from(pid)
        .ok()
        .filter(|p| *p > 0)
        .map(nix::unistd::Pid::from_raw)
}

/// SIGTERM, or SIGKILL when `force`.
#[cfg(unix)]
pub fn terminate_pid(pid: u32, force: bool) -> Result<Termination, ProcessError> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};

    let target = to_pid(pid).ok_or(ProcessError::InvalidPid { pid })?;
    let signal = if force {
        Signal::SIGKILL
    } else {
        Signal::SIGTERM
    };
    match kill(target, signal) {
        Ok(()) => Ok(Termination::Signalled),
        Err(Errno::ESRCH) => Ok(Termination::AlreadyGone),
        Err(e) => Err(ProcessError::Signal {
            pid,
            source: std::io::Error::from(e),
        }),
    }
}

#[cfg(not(unix))]
pub fn terminate_pid(_pid: u32, _force: bool) -> Result<Termination, ProcessError> {
    Err(ProcessError::Unsupported)
}

/// Full process listing as (pid, command line).
#[cfg(unix)]
async fn list_processes() -> Vec<TrainingProcess> {
    let output = Command::new("ps")
        .args(["-eo", "pid=,args="])
        .kill_on_drop(true)
        .output();
    match tokio::time::timeout(SCAN_TIMEOUT, output).await {
        Ok(Ok(output)) if output.status.success() => {
            parse_process_table(&String::from_utf8_lossy(&output.stdout))
        }
        Ok(Ok(output)) => {
            tracing::error!(exit_code = ?output.status.code(), "process listing failed");
            Vec::new()
        }
        Ok(Err(e)) => {
            tracing::error!(error = %e, "failed to run ps");
            Vec::new()
        }
        Err(_) => {
            tracing::error!("process listing timed out");
            Vec::new()
        }
    }
}

#[cfg(not(unix))]
async fn list_processes() -> Vec<TrainingProcess> {
    tracing::warn!("process discovery is not supported on this platform");
    Vec::new()
}

fn parse_process_table(stdout: &str) -> Vec<TrainingProcess> {
    stdout
        .lines()
        .filter_map(|line| {
            let caps = PS_LINE.captures(line)?;
            Some(TrainingProcess {
                pid: caps[1].parse().ok()?,
                command_line: caps[2].to_string(),
            })
        })
        .collect()
}
