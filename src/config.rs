use crate::output_dir::absolutize;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from `trainwatch.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct TrainwatchConfig {
    pub watch: WatchConfig,
    pub gpu: GpuConfig,
    pub process: ProcessConfig,
    pub checkpoint: CheckpointConfig,
    pub recovery: RecoveryConfig,
    pub launch: LaunchConfig,
    pub serve: ServeConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Seconds between GPU polls.
    pub check_interval_secs: u64,
    /// Seconds of continuous low utilization before training counts as stuck.
    pub stuck_threshold_secs: u64,
    /// Utilization percentage below which the GPU counts as idle.
    pub gpu_threshold: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GpuConfig {
    pub command: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Substring every training command line must contain (case-insensitive).
    /// Empty disables the check.
    pub interpreter: String,
    /// A command line matches when it contains any of these fragments.
    pub patterns: Vec<String>,
    /// Seconds to wait after signalling before re-scanning for survivors.
    pub settle_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Extension of standalone weight files (without the dot).
    pub model_extension: String,
}

/// What to do with a stuck job when auto-resume is disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum HaltPolicy {
    /// Halt without touching the stuck processes; the operator decides.
    #[default]
    HaltBeforeKill,
    /// Kill the stuck processes first, then halt.
    KillThenHalt,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub auto_resume: bool,
    pub halt_policy: HaltPolicy,
    /// Seconds to wait after killing so the driver can reclaim GPU memory.
    pub cleanup_delay_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Original launch script. Required when auto-resume is enabled.
    pub script: Option<PathBuf>,
    /// Directory the relaunched script runs in. Defaults to the directory the
    /// watchdog was started from, which is where launch scripts expect to run.
    pub working_dir: Option<PathBuf>,
    /// Interpreter used to run the script.
    pub shell: String,
    /// Trainer flag that takes the checkpoint directory.
    pub resume_flag: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServeConfig {
    pub bind: String,
    pub port: u16,
}

// --- Default implementations ---

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 30,
            stuck_threshold_secs: 300,
            gpu_threshold: 5.0,
        }
    }
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            command: "nvidia-smi".to_string(),
            timeout_secs: 5,
        }
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            interpreter: "python".to_string(),
            patterns: vec![
                "flux_train_network.py".to_string(),
                "accelerate launch".to_string(),
                "train_network.py".to_string(),
            ],
            settle_secs: 3,
        }
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            model_extension: "safetensors".to_string(),
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            auto_resume: false,
            halt_policy: HaltPolicy::HaltBeforeKill,
            cleanup_delay_secs: 5,
        }
    }
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            script: None,
            working_dir: None,
            shell: default_shell().to_string(),
            resume_flag: "--resume".to_string(),
        }
    }
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 7870,
        }
    }
}

#[cfg(unix)]
fn default_shell() -> &'static str {
    "bash"
}

#[cfg(not(unix))]
fn default_shell() -> &'static str {
    "cmd"
}

impl WatchConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn stuck_threshold(&self) -> Duration {
        Duration::from_secs(self.stuck_threshold_secs)
    }
}

/// Command-line values that take precedence over the config file.
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub check_interval_secs: Option<u64>,
    pub stuck_threshold_secs: Option<u64>,
    pub gpu_threshold: Option<f64>,
    pub auto_resume: bool,
    pub train_script: Option<PathBuf>,
    pub halt_policy: Option<HaltPolicy>,
}

impl TrainwatchConfig {
    /// Apply CLI overrides. `auto_resume` can only switch the feature on.
    pub fn apply(&mut self, overrides: &ConfigOverrides) {
        if let Some(secs) = overrides.check_interval_secs {
            self.watch.check_interval_secs = secs;
        }
        if let Some(secs) = overrides.stuck_threshold_secs {
            self.watch.stuck_threshold_secs = secs;
        }
        if let Some(pct) = overrides.gpu_threshold {
            self.watch.gpu_threshold = pct;
        }
        if overrides.auto_resume {
            self.recovery.auto_resume = true;
        }
        if let Some(script) = &overrides.train_script {
            self.launch.script = Some(script.clone());
        }
        if let Some(policy) = overrides.halt_policy {
            self.recovery.halt_policy = policy;
        }
    }

    /// Turn every configured path into an absolute one, anchored at the
    /// current working directory. An unset working directory becomes that
    /// directory.
    pub fn resolve_paths(&mut self) -> std::io::Result<()> {
        if let Some(script) = &self.launch.script {
            self.launch.script = Some(absolutize(script)?);
        }
        self.launch.working_dir = Some(match &self.launch.working_dir {
            Some(dir) => absolutize(dir)?,
            None => std::env::current_dir()?,
        });
        Ok(())
    }

    /// Check the settings a watchdog run depends on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.watch.check_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "watch.check_interval_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        let pct = self.watch.gpu_threshold;
        if !pct.is_finite() || !(0.0..=100.0).contains(&pct) {
            return Err(ConfigError::Invalid {
                field: "watch.gpu_threshold",
                reason: format!("{pct} is not a percentage between 0 and 100"),
            });
        }
        if self.gpu.timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "gpu.timeout_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.process.patterns.iter().all(|p| p.trim().is_empty()) {
            return Err(ConfigError::Invalid {
                field: "process.patterns",
                reason: "at least one non-empty pattern is required".to_string(),
            });
        }
        match &self.launch.script {
            None if self.recovery.auto_resume => Err(ConfigError::MissingLaunchScript),
            Some(script) if self.recovery.auto_resume && !script.is_file() => {
                Err(ConfigError::LaunchScriptNotFound {
                    path: script.clone(),
                })
            }
            _ => Ok(()),
        }
    }
}

/// Load config from `path`. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<TrainwatchConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(TrainwatchConfig::default());
        }
        Err(e) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Errors from loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid {
        field: &'static str,
        reason: String,
    },
    /// Auto-resume was requested without a launch script to relaunch.
    MissingLaunchScript,
    LaunchScriptNotFound {
        path: PathBuf,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {source}", path.display())
            }
            ConfigError::Invalid { field, reason } => write!(f, "invalid {field}: {reason}"),
            ConfigError::MissingLaunchScript => write!(
                f,
                "auto-resume is enabled but no launch script was given (use --train-script or [launch].script)"
            ),
            ConfigError::LaunchScriptNotFound { path } => {
                write!(f, "launch script not found: {}", path.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = TrainwatchConfig::default();
        assert_eq!(cfg.watch.check_interval_secs, 30);
        assert_eq!(cfg.watch.stuck_threshold_secs, 300);
        assert_eq!(cfg.watch.gpu_threshold, 5.0);
        assert_eq!(cfg.gpu.command, "nvidia-smi");
        assert_eq!(cfg.gpu.timeout_secs, 5);
        assert_eq!(cfg.recovery.cleanup_delay_secs, 5);
        assert_eq!(cfg.recovery.halt_policy, HaltPolicy::HaltBeforeKill);
        assert!(!cfg.recovery.auto_resume);
        assert_eq!(cfg.launch.resume_flag, "--resume");
        assert_eq!(cfg.checkpoint.model_extension, "safetensors");
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let cfg: TrainwatchConfig = toml::from_str(
            r#"
            [watch]
            stuck_threshold_secs = 600

            [recovery]
            auto_resume = true
            halt_policy = "kill_then_halt"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.watch.stuck_threshold_secs, 600);
        assert_eq!(cfg.watch.check_interval_secs, 30);
        assert!(cfg.recovery.auto_resume);
        assert_eq!(cfg.recovery.halt_policy, HaltPolicy::KillThenHalt);
        assert_eq!(cfg.process.patterns.len(), 3);
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config(&dir.path().join("trainwatch.toml")).unwrap();
        assert_eq!(cfg.watch.check_interval_secs, 30);
    }

    #[test]
    fn test_load_invalid_toml_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trainwatch.toml");
        std::fs::write(&path, "[watch\ncheck_interval_secs = ").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("failed to parse config"));
    }

    #[test]
    fn test_overrides_take_precedence() {
        let mut cfg = TrainwatchConfig::default();
        cfg.apply(&ConfigOverrides {
            check_interval_secs: Some(10),
            stuck_threshold_secs: Some(120),
            gpu_threshold: Some(2.5),
            auto_resume: true,
            train_script: Some(PathBuf::from("outputs/run/train.sh")),
            halt_policy: Some(HaltPolicy::KillThenHalt),
        });
        assert_eq!(cfg.watch.check_interval_secs, 10);
        assert_eq!(cfg.watch.stuck_threshold_secs, 120);
        assert_eq!(cfg.watch.gpu_threshold, 2.5);
        assert!(cfg.recovery.auto_resume);
        assert_eq!(
            cfg.launch.script,
            Some(PathBuf::from("outputs/run/train.sh"))
        );
        assert_eq!(cfg.recovery.halt_policy, HaltPolicy::KillThenHalt);
    }

    #[test]
    fn test_auto_resume_flag_absent_keeps_file_value() {
        let mut cfg = TrainwatchConfig::default();
        cfg.recovery.auto_resume = true;
        cfg.apply(&ConfigOverrides::default());
        assert!(cfg.recovery.auto_resume);
    }

    #[test]
    fn test_auto_resume_without_script_is_config_error() {
        let mut cfg = TrainwatchConfig::default();
        cfg.recovery.auto_resume = true;
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, ConfigError::MissingLaunchScript));
        assert!(err.to_string().contains("no launch script"));
    }

    #[test]
    fn test_auto_resume_with_missing_script_file_is_config_error() {
        let mut cfg = TrainwatchConfig::default();
        cfg.recovery.auto_resume = true;
        cfg.launch.script = Some(PathBuf::from("/nonexistent/train.sh"));
        assert!(matches!(
            cfg.validate().unwrap_err(),
            ConfigError::LaunchScriptNotFound { .. }
        ));
    }

    #[test]
    fn test_auto_resume_with_existing_script_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("train.sh");
        std::fs::write(&script, "echo hi\n").unwrap();
        let mut cfg = TrainwatchConfig::default();
        cfg.recovery.auto_resume = true;
        cfg.launch.script = Some(script);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_monitor_only_needs_no_script() {
        assert!(TrainwatchConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut cfg = TrainwatchConfig::default();
        cfg.watch.check_interval_secs = 0;
        assert!(matches!(
            cfg.validate().unwrap_err(),
            ConfigError::Invalid {
                field: "watch.check_interval_secs",
                ..
            }
        ));
    }

    #[test]
    fn test_out_of_range_threshold_rejected() {
        let mut cfg = TrainwatchConfig::default();
        cfg.watch.gpu_threshold = 150.0;
        assert!(cfg.validate().is_err());
        cfg.watch.gpu_threshold = f64::NAN;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_resolve_paths_makes_script_absolute() {
        let mut cfg = TrainwatchConfig::default();
        cfg.launch.script = Some(PathBuf::from("outputs/run/train.sh"));
        cfg.launch.working_dir = Some(PathBuf::from("."));
        cfg.resolve_paths().unwrap();
        assert!(cfg.launch.script.as_ref().unwrap().is_absolute());
        assert!(cfg.launch.working_dir.as_ref().unwrap().is_absolute());
    }

    #[test]
    fn test_resolve_paths_defaults_working_dir_to_startup_dir() {
        let mut cfg = TrainwatchConfig::default();
        cfg.launch.script = Some(PathBuf::from("outputs/run/train.sh"));
        assert!(cfg.launch.working_dir.is_none());
        cfg.resolve_paths().unwrap();
        assert_eq!(
            cfg.launch.working_dir,
            Some(std::env::current_dir().unwrap())
        );
    }

    #[test]
    fn test_error_display() {
        let err = ConfigError::Invalid {
            field: "watch.gpu_threshold",
            reason: "bad".to_string(),
        };
        assert_eq!(err.to_string(), "invalid watch.gpu_threshold: bad");
    }
}
