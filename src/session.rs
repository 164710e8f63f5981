/// Training session record: `session.json` in the output directory.
///
/// The record is always rewritten as a whole document (temp file + rename),
/// so a reader never sees a half-written session.
use crate::output_dir::{write_atomic, OutputDir};
use crate::process::is_alive;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Starting => "starting",
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSession {
    pub name: String,
    /// Launch parameters, free-form.
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
    pub status: SessionStatus,
    /// When the session was last (re)started.
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Relaunches performed by the watchdog.
    #[serde(default)]
    pub restarts: u32,
}

impl TrainingSession {
    pub fn new(name: &str, status: SessionStatus) -> Self {
        Self {
            name: name.to_string(),
            params: serde_json::Map::new(),
            status,
            timestamp: Utc::now(),
            error: None,
            completed_at: None,
            restarts: 0,
        }
    }
}

/// Errors reading or writing a session record.
#[derive(Debug)]
pub enum SessionError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Read { path, source } => {
                write!(f, "failed to read session {}: {}", path.display(), source)
            }
            SessionError::Parse { path, source } => {
                write!(f, "invalid session file {}: {}", path.display(), source)
            }
            SessionError::Write { path, source } => {
                write!(f, "failed to write session {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Read { source, .. } => Some(source),
            SessionError::Parse { source, .. } => Some(source),
            SessionError::Write { source, .. } => Some(source),
        }
    }
}

/// Reads and replaces the session record of one output directory.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
    name: String,
}

impl SessionStore {
    pub fn new(output: &OutputDir) -> Self {
        Self {
            path: output.session(),
            name: output.name(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Ok(None) when no session has been recorded yet.
    pub fn load(&self) -> Result<Option<TrainingSession>, SessionError> {
        read_session(&self.path)
    }

    pub fn save(&self, session: &TrainingSession) -> Result<(), SessionError> {
        let json = serde_json::to_vec_pretty(session).map_err(|e| SessionError::Parse {
            path: self.path.clone(),
            source: e,
        })?;
        write_atomic(&self.path, &json).map_err(|e| SessionError::Write {
            path: self.path.clone(),
            source: e,
        })
    }

    /// Load (or start) the record, apply `f`, and write it back whole.
    pub fn update<F>(&self, f: F) -> Result<TrainingSession, SessionError>
    where
        F: FnOnce(&mut TrainingSession),
    {
        let mut session = self
            .load()?
            .unwrap_or_else(|| TrainingSession::new(&self.name, SessionStatus::Starting));
        f(&mut session);
        self.save(&session)?;
        Ok(session)
    }

    /// Make sure a record exists for a job the watchdog is attaching to.
    /// An existing record is left alone unless it is still `starting`.
    pub fn ensure_running(&self) -> Result<TrainingSession, SessionError> {
        if let Some(existing) = self.load()? {
            if existing.status != SessionStatus::Starting {
                return Ok(existing);
            }
        }
        self.update(|s| s.status = SessionStatus::Running)
    }

    /// The watchdog relaunched the trainer.
    pub fn record_restart(&self) -> Result<TrainingSession, SessionError> {
        self.update(|s| {
            s.status = SessionStatus::Running;
            s.timestamp = Utc::now();
            s.restarts += 1;
            s.error = None;
            s.completed_at = None;
        })
    }

    pub fn mark_completed(&self) -> Result<TrainingSession, SessionError> {
        self.update(|s| {
            s.status = SessionStatus::Completed;
            s.completed_at = Some(Utc::now());
            s.error = None;
        })
    }

    pub fn mark_failed(&self, reason: &str) -> Result<TrainingSession, SessionError> {
        self.update(|s| {
            s.status = SessionStatus::Failed;
            s.error = Some(reason.to_string());
        })
    }
}

fn read_session(path: &Path) -> Result<Option<TrainingSession>, SessionError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(SessionError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    serde_json::from_str(&contents)
        .map(Some)
        .map_err(|e| SessionError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
}

/// A session found under the outputs root, with trainer liveness.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub output_dir: PathBuf,
    pub is_running: bool,
    #[serde(flatten)]
    pub session: TrainingSession,
}

/// Is the pid recorded in `training.pid` alive?
pub fn trainer_running(output: &OutputDir) -> bool {
    std::fs::read_to_string(output.training_pid())
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .is_some_and(is_alive)
}

/// Every session record directly under `outputs_root`, most recent first.
/// Unreadable records are logged and skipped.
pub fn list_sessions(outputs_root: &Path) -> Vec<SessionSummary> {
    let entries = match std::fs::read_dir(outputs_root) {
        Ok(e) => e,
        Err(e) => {
            tracing::debug!(dir = %outputs_root.display(), error = %e, "no outputs directory");
            return Vec::new();
        }
    };

    let mut sessions: Vec<SessionSummary> = entries
        .flatten()
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| {
            let output = OutputDir::resolve(&entry.path()).ok()?;
            match read_session(&output.session()) {
                Ok(Some(session)) => Some(SessionSummary {
                    is_running: trainer_running(&output),
                    output_dir: output.root().to_path_buf(),
                    session,
                }),
                Ok(None) => None,
                Err(e) => {
                    tracing::error!(error = %e, "skipping unreadable session");
                    None
                }
            }
        })
        .collect();

    sessions.sort_by(|a, b| b.session.timestamp.cmp(&a.session.timestamp));
    sessions
}

/// Decide whether a finished run actually produced its model file, and record
/// the verdict in the session.
pub fn finalize(output: &OutputDir, model_extension: &str) -> Result<TrainingSession, SessionError> {
    let store = SessionStore::new(output);
    let expected = output.expected_model(model_extension.trim_start_matches('.'));

    if expected.is_file() {
        tracing::info!(model = %expected.display(), "training produced its model file");
        return store.mark_completed();
    }

    let reason = format!(
        "Training did not produce model file {}. Check logs for errors.",
        expected.display()
    );
    tracing::error!(model = %expected.display(), "training failed: model file not generated");
    append_failure_banner(&output.training_log());
    store.mark_failed(&reason)
}

/// Mark the failure at the end of the trainer's own log, when it exists.
fn append_failure_banner(log: &Path) {
    if !log.exists() {
        return;
    }
    let rule = "=".repeat(80);
    let result = std::fs::OpenOptions::new()
        .append(true)
        .open(log)
        .and_then(|mut f| {
            writeln!(
                f,
                "\n{rule}\nERROR: TRAINING FAILED - Model file not generated\n{rule}"
            )
        });
    if let Err(e) = result {
        tracing::warn!(log = %log.display(), error = %e, "could not append failure banner");
    }
}
