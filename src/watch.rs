/// The watchdog run loop.
///
/// Owns every piece of per-run state (config, output layout, status tracker,
/// history connection, orchestrator) and drives one poll cycle at a time.
/// Interrupts are only observed while sleeping between cycles.
use crate::checkpoint::CheckpointStore;
use crate::config::TrainwatchConfig;
use crate::gpu::NvidiaSmi;
use crate::history;
use crate::launcher::LaunchScriptAdapter;
use crate::orchestrator::{
    Observation, Orchestrator, RecoveryAction, RecoveryReport, RecoverySettings, WatchState,
};
use crate::output_dir::OutputDir;
use crate::process::ProcessRegistry;
use crate::session::SessionStore;
use crate::signals::ShutdownSignal;
use crate::status::{PidFile, StatusError, StatusTracker, WatchdogState};
use std::future::Future;
use std::path::PathBuf;
use std::time::Instant;
use tokio::task::JoinError;

type Watchdog = Orchestrator<NvidiaSmi, ProcessRegistry, CheckpointStore, LaunchScriptAdapter>;

/// Why a watchdog run could not start.
#[derive(Debug)]
pub enum WatchError {
    OutputDir {
        path: PathBuf,
        source: std::io::Error,
    },
    PidFile(StatusError),
    Signals(std::io::Error),
}

impl std::fmt::Display for WatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchError::OutputDir { path, source } => {
                write!(f, "cannot use output directory {}: {source}", path.display())
            }
            WatchError::PidFile(e) => write!(f, "{e}"),
            WatchError::Signals(e) => write!(f, "failed to install signal handlers: {e}"),
        }
    }
}

impl std::error::Error for WatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WatchError::OutputDir { source, .. } => Some(source),
            WatchError::PidFile(e) => Some(e),
            WatchError::Signals(e) => Some(e),
        }
    }
}

/// How the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchExit {
    /// An operator interrupt arrived between cycles.
    Interrupted,
    /// A stuck job was confirmed with auto-resume off.
    Halted,
}

/// Bookkeeping that follows each cycle: status file, history, session.
struct RunLedger {
    tracker: StatusTracker,
    history: Option<rusqlite::Connection>,
    session: SessionStore,
}

impl RunLedger {
    fn open(output: &OutputDir) -> Self {
        let history = match history::open_or_create(&output.history_db()) {
            Ok(conn) => Some(conn),
            Err(e) => {
                tracing::warn!(
                    path = %output.history_db().display(),
                    error = %e,
                    "recovery history unavailable"
                );
                None
            }
        };
        let session = SessionStore::new(output);
        if let Err(e) = session.ensure_running() {
            tracing::warn!(error = %e, "could not record training session");
        }
        Self {
            tracker: StatusTracker::new(output.status()),
            history,
            session,
        }
    }

    /// Mirror the orchestrator state into the status file.
    fn publish(&mut self, state: WatchState, utilization: Option<f64>) {
        self.tracker.set_last_utilization(utilization);
        let published = match state {
            WatchState::Idle => {
                self.tracker.clear_suspect();
                WatchdogState::Idle
            }
            WatchState::Suspect { .. } => {
                self.tracker.mark_suspect();
                WatchdogState::Suspect
            }
            WatchState::Recovering => WatchdogState::Recovering,
            WatchState::Halted => WatchdogState::Halted,
        };
        self.tracker.update(published);
    }

    fn record(&mut self, report: &RecoveryReport) {
        self.tracker.record_recovery();

        if let Some(conn) = &self.history {
            if let Err(e) = history::insert_recovery(conn, report) {
                tracing::warn!(error = %e, "failed to record recovery history");
            }
        }

        if report.spawned.is_some() {
            match self.session.record_restart() {
                Ok(s) => tracing::info!(restarts = s.restarts, "session marked running"),
                Err(e) => tracing::warn!(error = %e, "failed to update session"),
            }
        }
        if report.action == RecoveryAction::Failed {
            tracing::error!(
                error = report.error.as_deref().unwrap_or("unknown"),
                "recovery failed, manual intervention required"
            );
        }
    }
}

/// Run the watchdog for `output` until interrupted or halted.
///
/// `config` must already be validated and have absolute paths.
pub async fn run(output: OutputDir, config: TrainwatchConfig) -> Result<WatchExit, WatchError> {
    output.ensure_exists().map_err(|e| WatchError::OutputDir {
        path: output.root().to_path_buf(),
        source: e,
    })?;
    let _pid_file = PidFile::acquire(&output.monitor_pid()).map_err(WatchError::PidFile)?;

    let mut ledger = RunLedger::open(&output);
    ledger.tracker.update(WatchdogState::Starting);

    let checkpoints = CheckpointStore::new(output.root(), &config.checkpoint.model_extension)
        .map_err(|e| WatchError::OutputDir {
            path: output.root().to_path_buf(),
            source: e,
        })?;
    let build = || -> Watchdog {
        Orchestrator::new(
            NvidiaSmi::new(&config.gpu),
            ProcessRegistry::new(&config.process),
            checkpoints.clone(),
            LaunchScriptAdapter::new(&config.launch, &output),
            RecoverySettings::from_config(&config),
        )
    };
    let mut orchestrator = build();

    tracing::info!(
        output_dir = %output.root().display(),
        check_interval_secs = config.watch.check_interval_secs,
        stuck_threshold_secs = config.watch.stuck_threshold_secs,
        gpu_threshold = config.watch.gpu_threshold,
        auto_resume = config.recovery.auto_resume,
        halt_policy = ?config.recovery.halt_policy,
        train_script = ?config.launch.script,
        "training watchdog started"
    );

    let mut shutdown = ShutdownSignal::install().map_err(WatchError::Signals)?;
    let interval = config.watch.check_interval();

    let exit = loop {
        orchestrator = match run_cycle(orchestrator, &mut ledger).await {
            Ok(o) => o,
            Err(e) => {
                tracing::error!(error = %e, "poll cycle failed, detection restarts from idle");
                let fresh = build();
                ledger.publish(fresh.state(), None);
                fresh
            }
        };

        if orchestrator.state() == WatchState::Halted {
            tracing::info!("monitoring stopped, restart manually when ready");
            break WatchExit::Halted;
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            sig = shutdown.recv() => {
                tracing::info!(signal = %sig, "monitoring stopped by operator");
                break WatchExit::Interrupted;
            }
        }
    };

    if exit == WatchExit::Interrupted {
        ledger.tracker.update(WatchdogState::ShuttingDown);
    }
    tracing::info!(recoveries = ledger.tracker.recoveries(), "training watchdog stopped");
    Ok(exit)
}

/// One GPU sample and, when stuck, one recovery. Each step runs on its own task so
/// a panic inside it surfaces as a `JoinError` instead of ending the loop.
async fn run_cycle(orchestrator: Watchdog, ledger: &mut RunLedger) -> Result<Watchdog, JoinError> {
    let (mut orchestrator, observation) = isolate(orchestrator, |mut o| async move {
        let observation = o.sample(Instant::now()).await;
        (o, observation)
    })
    .await?;

    if let Observation::Stuck { .. } = observation {
        ledger.publish(orchestrator.state(), orchestrator.last_utilization());
        let (o, report) = isolate(orchestrator, |mut o| async move {
            let report = o.recover().await;
            (o, report)
        })
        .await?;
        orchestrator = o;
        ledger.record(&report);
    }
    ledger.publish(orchestrator.state(), orchestrator.last_utilization());
    Ok(orchestrator)
}

/// Move `state` into a spawned task running `step` and hand it back.
async fn isolate<S, T, F, Fut>(state: S, step: F) -> Result<(S, T), JoinError>
where
    F: FnOnce(S) -> Fut,
    Fut: Future<Output = (S, T)> + Send + 'static,
    S: Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(step(state)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    #[cfg(unix)]
    use crate::status::StatusFile;
    #[cfg(unix)]
    use std::os::unix::fs::PermissionsExt;
    #[cfg(unix)]
    use std::path::Path;

    #[tokio::test]
    async fn test_isolate_returns_state_and_output() {
        let (state, out) = isolate(vec![1, 2], |mut v| async move {
            v.push(3);
            let len = v.len();
            (v, len)
        })
        .await
        .unwrap();
        assert_eq!(state, vec![1, 2, 3]);
        assert_eq!(out, 3);
    }

    #[tokio::test]
    async fn test_isolate_turns_panic_into_error() {
        let result = isolate(7u32, |n| async move {
            if n == 7 {
                panic!("utilization parser blew up");
            }
            (n, ())
        })
        .await;
        let err = result.unwrap_err();
        assert!(err.is_panic());

        // the caller keeps running after a failed step
        let (n, ()) = isolate(8u32, |n| async move { (n, ()) }).await.unwrap();
        assert_eq!(n, 8);
    }

    #[cfg(unix)]
    fn fake_smi(dir: &Path, utilization: u32) -> String {
        let path = dir.join("fake-smi");
        std::fs::write(
            &path,
            format!(
                "#!/bin/sh\ncase \"$1\" in --query-gpu=memory.used) echo 1024 ;; *) echo {utilization} ;; esac\n"
            ),
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[cfg(unix)]
    fn config(tool: String) -> TrainwatchConfig {
        let mut cfg = TrainwatchConfig::default();
        cfg.gpu.command = tool;
        cfg.watch.check_interval_secs = 1;
        cfg.watch.stuck_threshold_secs = 1;
        cfg.recovery.cleanup_delay_secs = 0;
        cfg.process.settle_secs = 0;
        // Never matches a real process
        cfg.process.patterns = vec!["trainwatch-test-no-such-trainer".to_string()];
        cfg
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_halts_after_stuck_without_auto_resume() {
        let tools = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        let output = OutputDir::resolve(out_dir.path()).unwrap();
        let model = output.root().join("run-000004.safetensors");
        std::fs::write(&model, b"weights").unwrap();

        let exit = tokio::time::timeout(
            std::time::Duration::from_secs(20),
            run(output.clone(), config(fake_smi(tools.path(), 0))),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(exit, WatchExit::Halted);
        let status = StatusFile::new(output.status()).read().unwrap();
        assert_eq!(status.state, WatchdogState::Halted);
        assert_eq!(status.recoveries, 1);
        assert!(!output.monitor_pid().exists());

        let conn = history::open_existing(&output.history_db()).unwrap().unwrap();
        let rows = history::list_recoveries(&conn, None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].action, "halted");
        assert_eq!(
            rows[0].model.as_deref(),
            Some(model.to_string_lossy().as_ref())
        );

        let session = SessionStore::new(&output).load().unwrap().unwrap();
        assert_eq!(session.restarts, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_auto_resume_restarts_fresh_and_records_restart() {
        let tools = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        let output = OutputDir::resolve(out_dir.path()).unwrap();
        let script = out_dir.path().join("train.sh");
        std::fs::write(&script, "echo fresh-start\n").unwrap();

        let mut cfg = config(fake_smi(tools.path(), 0));
        cfg.recovery.auto_resume = true;
        cfg.launch.script = Some(script);
        cfg.launch.shell = "sh".to_string();

        // Runs until interrupted; stop it once a restart has been recorded.
        let watch = run(output.clone(), cfg);
        let session_store = SessionStore::new(&output);
        let wait_for_restart = async {
            loop {
                if let Ok(Some(s)) = session_store.load() {
                    if s.restarts >= 1 {
                        return s;
                    }
                }
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        };

        tokio::select! {
            result = watch => panic!("watch loop ended early: {result:?}"),
            session = tokio::time::timeout(std::time::Duration::from_secs(20), wait_for_restart) => {
                let session = session.unwrap();
                assert_eq!(session.restarts, 1);
            }
        }

        let pid: u32 = std::fs::read_to_string(output.training_pid())
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(pid > 0);
        let conn = history::open_existing(&output.history_db()).unwrap().unwrap();
        let rows = history::list_recoveries(&conn, None).unwrap();
        assert_eq!(rows[0].action, "fresh");
        assert_eq!(rows[0].spawned_pid, Some(pid));
    }
}
