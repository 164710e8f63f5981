mod checkpoint;
mod config;
mod gpu;
mod history;
mod launcher;
mod logging;
mod orchestrator;
mod output_dir;
mod process;
#[cfg(feature = "serve")]
mod serve;
mod session;
mod signals;
mod status;
mod watch;

use checkpoint::{CheckpointSource, CheckpointStore};
use clap::{Args, Parser, Subcommand};
use config::{load_config, ConfigOverrides, HaltPolicy, TrainwatchConfig};
use output_dir::OutputDir;
use std::path::{Path, PathBuf};

type CmdResult = Result<i32, Box<dyn std::error::Error>>;

/// Watchdog for long-running GPU training jobs: detects stuck training,
/// kills it, and relaunches from the newest valid checkpoint.
#[derive(Parser, Debug)]
#[command(name = "trainwatch", version, about)]
struct Cli {
    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Monitor GPU utilization and recover stuck training
    Watch(WatchArgs),
    /// List state checkpoints with their validation verdicts
    Checkpoints {
        #[command(flatten)]
        target: OutputArgs,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Validate one checkpoint directory (exit 0 when valid, 1 when not)
    Check {
        /// Checkpoint directory
        dir: PathBuf,
    },
    /// Show whether a watchdog is running for an output directory
    Status {
        #[command(flatten)]
        target: OutputArgs,
        #[arg(long)]
        json: bool,
    },
    /// Stop the watchdog of an output directory
    Stop {
        #[command(flatten)]
        target: OutputArgs,
    },
    /// List training sessions under an outputs root, most recent first
    Sessions {
        /// Directory holding one output directory per run
        #[arg(long, default_value = "outputs")]
        outputs: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Mark the session completed or failed depending on the model file
    Finalize {
        #[command(flatten)]
        target: OutputArgs,
    },
    /// Show recorded recoveries, newest first
    History {
        #[command(flatten)]
        target: OutputArgs,
        /// Show at most this many entries
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Serve a read-only JSON API for an output directory
    #[cfg(feature = "serve")]
    Serve {
        #[command(flatten)]
        target: OutputArgs,
        /// Bind address (overrides config)
        #[arg(long)]
        bind: Option<String>,
        /// Port (overrides config)
        #[arg(long)]
        port: Option<u16>,
    },
}

#[derive(Args, Debug)]
struct OutputArgs {
    /// Training output directory (e.g. outputs/my-lora)
    #[arg(short, long)]
    output_dir: PathBuf,

    /// Config file (default: <output-dir>/trainwatch.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl OutputArgs {
    fn resolve(&self) -> Result<(OutputDir, TrainwatchConfig), Box<dyn std::error::Error>> {
        let output = OutputDir::resolve(&self.output_dir)?;
        let config_path = self.config.clone().unwrap_or_else(|| output.config());
        let config = load_config(&config_path)?;
        Ok((output, config))
    }
}

#[derive(Args, Debug)]
struct WatchArgs {
    #[command(flatten)]
    target: OutputArgs,

    /// Seconds between GPU checks
    #[arg(long)]
    check_interval: Option<u64>,

    /// Seconds of idle GPU before training counts as stuck
    #[arg(long)]
    stuck_threshold: Option<u64>,

    /// GPU utilization percentage below which the GPU counts as idle
    #[arg(long)]
    gpu_threshold: Option<f64>,

    /// Relaunch training automatically after a stuck job is killed
    #[arg(long)]
    auto_resume: bool,

    /// Launch script used for relaunching (required with --auto-resume)
    #[arg(long)]
    train_script: Option<PathBuf>,

    /// What to do with a stuck job when auto-resume is off
    #[arg(long, value_enum)]
    halt_policy: Option<HaltPolicy>,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,
}

impl WatchArgs {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            check_interval_secs: self.check_interval,
            stuck_threshold_secs: self.stuck_threshold,
            gpu_threshold: self.gpu_threshold,
            auto_resume: self.auto_resume,
            train_script: self.train_script.clone(),
            halt_policy: self.halt_policy,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            1
        }
    };
    std::process::exit(code);
}

async fn dispatch(cli: Cli) -> CmdResult {
    // watch installs its own subscriber once the output directory exists
    if !matches!(cli.command, Command::Watch(_)) {
        logging::init(cli.verbose, None);
    }
    match cli.command {
        Command::Watch(args) => cmd_watch(args, cli.verbose).await,
        Command::Checkpoints { target, json } => cmd_checkpoints(&target, json),
        Command::Check { dir } => cmd_check(&dir),
        Command::Status { target, json } => cmd_status(&target, json),
        Command::Stop { target } => cmd_stop(&target).await,
        Command::Sessions { outputs, json } => cmd_sessions(&outputs, json),
        Command::Finalize { target } => cmd_finalize(&target),
        Command::History {
            target,
            limit,
            json,
        } => cmd_history(&target, limit, json),
        #[cfg(feature = "serve")]
        Command::Serve { target, bind, port } => {
            let (output, mut config) = target.resolve()?;
            if let Some(bind) = bind {
                config.serve.bind = bind;
            }
            if let Some(port) = port {
                config.serve.port = port;
            }
            serve::run(output, &config.serve, &config.checkpoint.model_extension).await?;
            Ok(0)
        }
    }
}

async fn cmd_watch(args: WatchArgs, verbose: bool) -> CmdResult {
    let output = OutputDir::resolve(&args.target.output_dir)?;
    if !args.dry_run {
        output.ensure_exists()?;
    }
    let log_file = (!args.dry_run).then(|| output.watchdog_log());
    logging::init(verbose, log_file.as_deref());

    let (_, mut config) = args.target.resolve()?;
    config.apply(&args.overrides());
    config.resolve_paths()?;
    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "configuration error, nothing will be relaunched");
        return Ok(2);
    }

    if args.dry_run {
        print_settings(&output, &config);
        println!("Dry run: config validated, not running.");
        return Ok(0);
    }

    watch::run(output, config).await?;
    Ok(0)
}

fn print_settings(output: &OutputDir, config: &TrainwatchConfig) {
    println!("Output directory: {}", output.root().display());
    println!("Check interval:   {}s", config.watch.check_interval_secs);
    println!("Stuck threshold:  {}s", config.watch.stuck_threshold_secs);
    println!("GPU threshold:    {}%", config.watch.gpu_threshold);
    println!("Auto-resume:      {}", config.recovery.auto_resume);
    println!("Halt policy:      {:?}", config.recovery.halt_policy);
    match &config.launch.script {
        Some(script) => println!("Train script:     {}", script.display()),
        None => println!("Train script:     (none)"),
    }
}

fn cmd_checkpoints(target: &OutputArgs, json: bool) -> CmdResult {
    let (output, config) = target.resolve()?;
    let store = CheckpointStore::new(output.root(), &config.checkpoint.model_extension)?;
    let candidates = store.scan();
    let latest = store.latest_valid_state_checkpoint();
    let model = store.latest_model_checkpoint();

    if json {
        let view = serde_json::json!({
            "output_dir": store.root(),
            "candidates": candidates,
            "latest_valid": latest.as_ref().map(|c| &c.path),
            "latest_model": model,
        });
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(0);
    }

    println!("Output directory: {}", store.root().display());
    if candidates.is_empty() {
        println!("  no state checkpoints");
    }
    for c in &candidates {
        let name = c
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let modified = c.modified.format("%Y-%m-%d %H:%M:%S");
        match (&c.format, &c.reason) {
            (Some(format), _) => println!(
                "  [valid]   {name}  {modified}  {} step={} epoch={}",
                format.label(),
                format.step(),
                format
                    .epoch()
                    .map_or_else(|| "?".to_string(), |e| e.to_string())
            ),
            (None, reason) => println!(
                "  [invalid] {name}  {modified}  {}",
                reason.as_deref().unwrap_or("unknown")
            ),
        }
    }
    match &latest {
        Some(cp) => {
            println!("Latest valid checkpoint: {}", cp.path.display());
            println!(
                "Resume with: {}",
                launcher::manual_resume_command(&config.launch.resume_flag, &cp.path)
            );
        }
        None => println!("Latest valid checkpoint: none"),
    }
    match &model {
        Some(path) => println!("Latest model checkpoint: {}", path.display()),
        None => println!("Latest model checkpoint: none"),
    }
    Ok(0)
}

fn cmd_check(dir: &Path) -> CmdResult {
    let dir = output_dir::absolutize(dir)?;
    match checkpoint::validate(&dir) {
        Ok(format) => {
            tracing::info!(
                checkpoint = %dir.display(),
                format = format.label(),
                step = format.step(),
                epoch = ?format.epoch(),
                "checkpoint is valid"
            );
            println!("valid: {} ({} metadata, step {})", dir.display(), format.label(), format.step());
            Ok(0)
        }
        Err(reason) => {
            println!("invalid: {}: {reason}", dir.display());
            Ok(1)
        }
    }
}

fn cmd_status(target: &OutputArgs, json: bool) -> CmdResult {
    let output = OutputDir::resolve(&target.output_dir)?;
    let status = status::monitor_status(&output);
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(0);
    }

    match status.pid {
        Some(pid) if status.running => println!("Monitor: running (PID: {pid})"),
        _ => println!("Monitor: not running"),
    }
    if let Some(state) = &status.state {
        println!(
            "Last state: {:?} at {} (recoveries: {}, utilization: {})",
            state.state,
            state.last_update.to_rfc3339(),
            state.recoveries,
            state
                .last_utilization
                .map_or_else(|| "unknown".to_string(), |u| format!("{u}%"))
        );
    }
    println!("Log: {}", status.log_path.display());
    if !status.log_tail.is_empty() {
        println!("{}", status.log_tail);
    }
    Ok(0)
}

async fn cmd_stop(target: &OutputArgs) -> CmdResult {
    let output = OutputDir::resolve(&target.output_dir)?;
    let outcome = status::stop_monitor(&output).await?;
    println!("{outcome}");
    Ok(0)
}

fn cmd_sessions(outputs: &Path, json: bool) -> CmdResult {
    let root = output_dir::absolutize(outputs)?;
    let sessions = session::list_sessions(&root);
    if json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(0);
    }
    if sessions.is_empty() {
        println!("No training sessions found under {}", root.display());
        return Ok(0);
    }
    for s in &sessions {
        let label = match s.session.status {
            session::SessionStatus::Failed | session::SessionStatus::Completed => {
                s.session.status.to_string()
            }
            _ if s.is_running => "running".to_string(),
            _ => "stopped".to_string(),
        };
        println!(
            "{}  {}  started {}  restarts {}",
            s.session.name,
            label,
            s.session.timestamp.format("%Y-%m-%d %H:%M:%S"),
            s.session.restarts
        );
        if let Some(error) = &s.session.error {
            println!("    error: {error}");
        }
    }
    Ok(0)
}

fn cmd_finalize(target: &OutputArgs) -> CmdResult {
    let (output, config) = target.resolve()?;
    let session = session::finalize(&output, &config.checkpoint.model_extension)?;
    println!(
        "{}: {}",
        session::SessionStore::new(&output).path().display(),
        session.status
    );
    match &session.error {
        Some(error) => {
            println!("  {error}");
            Ok(1)
        }
        None => Ok(0),
    }
}

fn cmd_history(target: &OutputArgs, limit: Option<usize>, json: bool) -> CmdResult {
    let output = OutputDir::resolve(&target.output_dir)?;
    let records = match history::open_existing(&output.history_db())? {
        Some(conn) => history::list_recoveries(&conn, limit)?,
        None => Vec::new(),
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(0);
    }
    if records.is_empty() {
        println!("No recoveries recorded for {}", output.root().display());
        return Ok(0);
    }
    for r in &records {
        println!(
            "{}  {:<7} util={} mem={} killed={} survivors={} pid={} checkpoint={}",
            r.at,
            r.action,
            r.utilization
                .map_or_else(|| "?".to_string(), |u| format!("{u}%")),
            r.memory_mb
                .map_or_else(|| "?".to_string(), |m| format!("{m}MB")),
            r.processes_found,
            r.survivors,
            r.spawned_pid
                .map_or_else(|| "-".to_string(), |p| p.to_string()),
            r.checkpoint.as_deref().unwrap_or("-"),
        );
        if let Some(model) = &r.model {
            println!("    latest model: {model}");
        }
        if let Some(error) = &r.error {
            println!("    error: {error}");
        }
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_watch_overrides() {
        let cli = Cli::try_parse_from([
            "trainwatch",
            "watch",
            "--output-dir",
            "outputs/my-lora",
            "--stuck-threshold",
            "600",
            "--auto-resume",
            "--train-script",
            "outputs/my-lora/train.sh",
            "--halt-policy",
            "kill-then-halt",
        ])
        .unwrap();
        let Command::Watch(args) = cli.command else {
            panic!("expected watch");
        };
        let o = args.overrides();
        assert_eq!(o.stuck_threshold_secs, Some(600));
        assert_eq!(o.check_interval_secs, None);
        assert!(o.auto_resume);
        assert_eq!(o.halt_policy, Some(HaltPolicy::KillThenHalt));
    }

    #[test]
    fn test_watch_requires_output_dir() {
        assert!(Cli::try_parse_from(["trainwatch", "watch"]).is_err());
    }

    #[test]
    fn test_sessions_default_root() {
        let cli = Cli::try_parse_from(["trainwatch", "-v", "sessions"]).unwrap();
        assert!(cli.verbose);
        let Command::Sessions { outputs, json } = cli.command else {
            panic!("expected sessions");
        };
        assert_eq!(outputs, PathBuf::from("outputs"));
        assert!(!json);
    }

    #[test]
    fn test_check_exit_codes() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("run-state");
        std::fs::create_dir(&dir).unwrap();
        assert_eq!(cmd_check(&dir).unwrap(), 1);

        for name in [
            checkpoint::OPTIMIZER_STATE,
            checkpoint::RNG_STATE,
            checkpoint::SCHEDULER_STATE,
        ] {
            std::fs::write(dir.join(name), b"x").unwrap();
        }
        std::fs::write(dir.join(checkpoint::LEGACY_METADATA), r#"{"current_step": 3}"#).unwrap();
        assert_eq!(cmd_check(&dir).unwrap(), 0);
    }

    #[test]
    fn test_output_args_reads_config_from_output_dir() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("trainwatch.toml"),
            "[checkpoint]\nmodel_extension = \"ckpt\"\n",
        )
        .unwrap();
        let args = OutputArgs {
            output_dir: tmp.path().to_path_buf(),
            config: None,
        };
        let (output, config) = args.resolve().unwrap();
        assert!(output.root().is_absolute());
        assert_eq!(config.checkpoint.model_extension, "ckpt");
    }
}
