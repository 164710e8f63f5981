/// Stuck-training detection and recovery.
///
/// The orchestrator turns a stream of GPU utilization samples into a state
/// machine. Sustained low utilization moves it from `Idle` through `Suspect`
/// into `Recovering`, where it kills the training job and relaunches it (from
/// the newest valid checkpoint, or from scratch) or halts for the operator.
/// Time is always passed in by the caller, so the transitions are
/// deterministic under test.
use crate::checkpoint::{CheckpointSource, ValidCheckpoint};
use crate::config::{HaltPolicy, TrainwatchConfig};
use crate::gpu::{GpuProbe, GpuReading};
use crate::launcher::{manual_resume_command, Relauncher, SpawnedProcess};
use crate::process::ProcessControl;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Idle,
    /// Utilization has been below the threshold since `since`.
    Suspect { since: Instant },
    Recovering,
    /// Auto-resume is off and a stuck job was confirmed. Polling stops.
    Halted,
}

/// Outcome of feeding one reading into the state machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Observation {
    /// Reading unavailable, or the watchdog is halted.
    NoEvidence,
    Healthy,
    /// Utilization came back while suspect; the timer was discarded.
    Recovered,
    Suspect { elapsed: Duration },
    Stuck { elapsed: Duration },
}

/// Thresholds and recovery switches, copied out of the config.
#[derive(Debug, Clone)]
pub struct RecoverySettings {
    pub gpu_threshold: f64,
    pub stuck_threshold: Duration,
    pub auto_resume: bool,
    pub halt_policy: HaltPolicy,
    pub cleanup_delay: Duration,
    pub resume_flag: String,
}

impl RecoverySettings {
    pub fn from_config(config: &TrainwatchConfig) -> Self {
        Self {
            gpu_threshold: config.watch.gpu_threshold,
            stuck_threshold: config.watch.stuck_threshold(),
            auto_resume: config.recovery.auto_resume,
            halt_policy: config.recovery.halt_policy,
            cleanup_delay: Duration::from_secs(config.recovery.cleanup_delay_secs),
            resume_flag: config.launch.resume_flag.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Resume,
    Fresh,
    Halted,
    /// A relaunch was attempted and failed.
    Failed,
}

impl RecoveryAction {
    pub fn as_str(self) -> &'static str {
        match self {
            RecoveryAction::Resume => "resume",
            RecoveryAction::Fresh => "fresh",
            RecoveryAction::Halted => "halted",
            RecoveryAction::Failed => "failed",
        }
    }
}

/// Everything one recovery decided and did.
#[derive(Debug, Clone)]
pub struct RecoveryReport {
    pub at: DateTime<Utc>,
    pub utilization: GpuReading,
    pub memory_mb: GpuReading,
    pub checkpoint: Option<ValidCheckpoint>,
    pub model: Option<PathBuf>,
    pub action: RecoveryAction,
    /// Training processes found when killing (0 when nothing was killed).
    pub processes_found: usize,
    pub survivors: usize,
    pub spawned: Option<SpawnedProcess>,
    pub error: Option<String>,
}

pub struct Orchestrator<G, P, C, L> {
    probe: G,
    processes: P,
    checkpoints: C,
    launcher: L,
    settings: RecoverySettings,
    state: WatchState,
    last_utilization: Option<f64>,
}

impl<G, P, C, L> Orchestrator<G, P, C, L>
where
    G: GpuProbe,
    P: ProcessControl,
    C: CheckpointSource,
    L: Relauncher,
{
    pub fn new(probe: G, processes: P, checkpoints: C, launcher: L, settings: RecoverySettings) -> Self {
        Self {
            probe,
            processes,
            checkpoints,
            launcher,
            settings,
            state: WatchState::Idle,
            last_utilization: None,
        }
    }

    pub fn state(&self) -> WatchState {
        self.state
    }

    pub fn last_utilization(&self) -> Option<f64> {
        self.last_utilization
    }

    /// Advance the state machine with one reading taken at `now`.
    pub fn observe(&mut self, reading: GpuReading, now: Instant) -> Observation {
        if matches!(self.state, WatchState::Halted | WatchState::Recovering) {
            return Observation::NoEvidence;
        }
        let GpuReading::Available(pct) = reading else {
            tracing::warn!("could not read GPU utilization");
            return Observation::NoEvidence;
        };
        self.last_utilization = Some(pct);
        tracing::debug!(utilization = pct, "GPU utilization");

        if pct >= self.settings.gpu_threshold {
            return match std::mem::replace(&mut self.state, WatchState::Idle) {
                WatchState::Suspect { .. } => {
                    tracing::info!(utilization = pct, "GPU usage recovered");
                    Observation::Recovered
                }
                _ => Observation::Healthy,
            };
        }

        match self.state {
            WatchState::Suspect { since } => {
                let elapsed = now.saturating_duration_since(since);
                tracing::warn!(
                    utilization = pct,
                    elapsed_secs = elapsed.as_secs(),
                    threshold_secs = self.settings.stuck_threshold.as_secs(),
                    "low GPU usage continues"
                );
                if elapsed >= self.settings.stuck_threshold {
                    tracing::error!(
                        stuck_secs = elapsed.as_secs(),
                        "GPU idle past the stuck threshold"
                    );
                    self.state = WatchState::Recovering;
                    Observation::Stuck { elapsed }
                } else {
                    Observation::Suspect { elapsed }
                }
            }
            _ => {
                tracing::warn!(utilization = pct, "low GPU usage detected, monitoring");
                self.state = WatchState::Suspect { since: now };
                Observation::Suspect {
                    elapsed: Duration::ZERO,
                }
            }
        }
    }

    /// Take one reading at `now` and feed it to the state machine. A halted
    /// orchestrator does not probe at all.
    pub async fn sample(&mut self, now: Instant) -> Observation {
        if self.state == WatchState::Halted {
            return Observation::NoEvidence;
        }
        let reading = self.probe.utilization().await;
        self.observe(reading, now)
    }

    /// Kill and relaunch (or halt) after `sample` reported `Stuck`.
    ///
    /// Ends in `Idle` after any relaunch attempt, or `Halted` when auto-resume
    /// is off.
    pub async fn recover(&mut self) -> RecoveryReport {
        let utilization = self
            .last_utilization
            .map_or(GpuReading::Unavailable, GpuReading::Available);
        let memory_mb = self.probe.memory_used_mb().await;
        let model = self.checkpoints.latest_model_checkpoint();
        tracing::error!(
            utilization = %utilization,
            memory_mb = %memory_mb,
            model = ?model,
            "training stuck detected"
        );
        let checkpoint = self.checkpoints.latest_valid_state_checkpoint();

        let mut report = RecoveryReport {
            at: Utc::now(),
            utilization,
            memory_mb,
            checkpoint,
            model,
            action: RecoveryAction::Halted,
            processes_found: 0,
            survivors: 0,
            spawned: None,
            error: None,
        };

        let halt_first =
            !self.settings.auto_resume && self.settings.halt_policy == HaltPolicy::HaltBeforeKill;
        if halt_first {
            self.halt(&report);
            return report;
        }

        tracing::info!("killing all training processes");
        let killed = self.processes.terminate_all(true).await;
        report.processes_found = killed.found;
        report.survivors = killed.survivors.len();
        if !killed.survivors.is_empty() {
            tracing::warn!(
                survivors = killed.survivors.len(),
                pids = ?killed.survivors.iter().map(|p| p.pid).collect::<Vec<_>>(),
                "some training processes survived termination"
            );
        }
        tokio::time::sleep(self.settings.cleanup_delay).await;

        if !self.settings.auto_resume {
            self.halt(&report);
            return report;
        }

        let result = match &report.checkpoint {
            Some(cp) => {
                tracing::info!(
                    checkpoint = %cp.path.display(),
                    step = cp.format.step(),
                    "resuming training from checkpoint"
                );
                self.launcher.resume(&cp.path).map(|p| (RecoveryAction::Resume, p))
            }
            None => {
                tracing::warn!("no valid checkpoint, restarting training from scratch");
                self.launcher
                    .restart_fresh()
                    .map(|p| (RecoveryAction::Fresh, p))
            }
        };

        match result {
            Ok((action, spawned)) => {
                tracing::info!(pid = spawned.pid, action = action.as_str(), "training relaunched");
                report.action = action;
                report.spawned = Some(spawned);
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    checkpoint = ?report.checkpoint.as_ref().map(|c| c.path.display().to_string()),
                    "relaunch failed, manual intervention required"
                );
                report.action = RecoveryAction::Failed;
                report.error = Some(e.to_string());
            }
        }

        self.state = WatchState::Idle;
        tracing::info!("continuing to monitor after recovery");
        report
    }

    fn halt(&mut self, report: &RecoveryReport) {
        self.state = WatchState::Halted;
        tracing::warn!("auto-resume is disabled, stopping; restart training manually");
        match &report.checkpoint {
            Some(cp) => tracing::warn!(
                command = %manual_resume_command(&self.settings.resume_flag, &cp.path),
                "to resume from the latest checkpoint, add this to the training command"
            ),
            None => tracing::warn!("no valid checkpoint to resume from"),
        }
    }
}
