/// Relaunching the trainer: resume-script materialization and detached spawning.
///
/// The original launch script is never touched. A resume relaunch writes a copy
/// with the resume flag injected into the continued trainer command; a fresh
/// relaunch runs the original as-is. Either way the child gets its own session
/// so it outlives the watchdog.
use crate::config::LaunchConfig;
use crate::output_dir::OutputDir;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

#[cfg(windows)]
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
#[cfg(windows)]
const DETACHED_PROCESS: u32 = 0x0000_0008;

/// Line-continuation convention of a launch script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptDialect {
    Posix,
    Batch,
}

impl ScriptDialect {
    /// `.bat` and `.cmd` scripts continue lines with `^`, everything else with `\`.
    pub fn for_script(path: &Path) -> Self {
        match path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .as_deref()
        {
            Some("bat") | Some("cmd") => ScriptDialect::Batch,
            _ => ScriptDialect::Posix,
        }
    }

    pub fn continuation(self) -> char {
        match self {
            ScriptDialect::Posix => '\\',
            ScriptDialect::Batch => '^',
        }
    }
}

/// Errors from preparing or starting a relaunch.
#[derive(Debug)]
pub enum LaunchError {
    /// No launch script is configured.
    NoScript,
    ReadScript {
        path: PathBuf,
        source: std::io::Error,
    },
    WriteScript {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The script has no continued command to attach the resume flag to.
    AnchorNotFound { path: PathBuf },
    LogFile {
        path: PathBuf,
        source: std::io::Error,
    },
    Spawn {
        script: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for LaunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchError::NoScript => write!(f, "no launch script configured"),
            LaunchError::ReadScript { path, source } => {
                write!(f, "failed to read launch script {}: {source}", path.display())
            }
            LaunchError::WriteScript { path, source } => {
                write!(f, "failed to write resume script {}: {source}", path.display())
            }
            LaunchError::AnchorNotFound { path } => write!(
                f,
                "no continued command found in {} to attach the resume flag to",
                path.display()
            ),
            LaunchError::LogFile { path, source } => {
                write!(f, "failed to open training log {}: {source}", path.display())
            }
            LaunchError::Spawn { script, source } => {
                write!(f, "failed to spawn {}: {source}", script.display())
            }
        }
    }
}

impl std::error::Error for LaunchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LaunchError::ReadScript { source, .. }
            | LaunchError::WriteScript { source, .. }
            | LaunchError::LogFile { source, .. }
            | LaunchError::Spawn { source, .. } => Some(source),
            LaunchError::NoScript | LaunchError::AnchorNotFound { .. } => None,
        }
    }
}

/// A trainer started by the watchdog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnedProcess {
    pub pid: u32,
    /// Script that was actually run (the resume copy for resumes).
    pub script: PathBuf,
    pub log: PathBuf,
}

/// Relaunch operations as seen by the orchestrator.
pub trait Relauncher {
    fn resume(&mut self, checkpoint: &Path) -> Result<SpawnedProcess, LaunchError>;
    fn restart_fresh(&mut self) -> Result<SpawnedProcess, LaunchError>;
}

/// Relaunches the trainer from the operator's launch script.
#[derive(Debug, Clone)]
pub struct LaunchScriptAdapter {
    script: Option<PathBuf>,
    working_dir: Option<PathBuf>,
    shell: String,
    resume_flag: String,
    log_path: PathBuf,
    pid_path: PathBuf,
}

impl LaunchScriptAdapter {
    /// Paths in `config` are expected to be absolute already.
    pub fn new(config: &LaunchConfig, output: &OutputDir) -> Self {
        Self {
            script: config.script.clone(),
            working_dir: config.working_dir.clone(),
            shell: config.shell.clone(),
            resume_flag: config.resume_flag.clone(),
            log_path: output.training_log(),
            pid_path: output.training_pid(),
        }
    }

    fn script(&self) -> Result<&Path, LaunchError> {
        self.script.as_deref().ok_or(LaunchError::NoScript)
    }

    /// Configured working directory, else the watchdog's own.
    fn working_dir(&self) -> PathBuf {
        self.working_dir
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Write the resume copy of the launch script and return its path.
    pub fn write_resume_script(&self, checkpoint: &Path) -> Result<PathBuf, LaunchError> {
        let original = self.script()?;
        let contents =
            std::fs::read_to_string(original).map_err(|source| LaunchError::ReadScript {
                path: original.to_path_buf(),
                source,
            })?;

        let dialect = ScriptDialect::for_script(original);
        let patched = inject_resume(&contents, dialect, &self.resume_flag, checkpoint).ok_or_else(
            || LaunchError::AnchorNotFound {
                path: original.to_path_buf(),
            },
        )?;

        let target = resume_script_path(original);
        std::fs::write(&target, patched).map_err(|source| LaunchError::WriteScript {
            path: target.clone(),
            source,
        })?;
        make_executable(&target).map_err(|source| LaunchError::WriteScript {
            path: target.clone(),
            source,
        })?;

        tracing::info!(
            script = %target.display(),
            checkpoint = %checkpoint.display(),
            "wrote resume script"
        );
        Ok(target)
    }

    fn launch(&self, script: &Path, cwd: &Path) -> Result<SpawnedProcess, LaunchError> {
        let pid = spawn_detached(&self.shell, script, cwd, &self.log_path)?;
        if let Err(e) = std::fs::write(&self.pid_path, format!("{pid}\n")) {
            tracing::warn!(
                path = %self.pid_path.display(),
                error = %e,
                "failed to record training pid"
            );
        }
        Ok(SpawnedProcess {
            pid,
            script: script.to_path_buf(),
            log: self.log_path.clone(),
        })
    }
}

impl Relauncher for LaunchScriptAdapter {
    fn resume(&mut self, checkpoint: &Path) -> Result<SpawnedProcess, LaunchError> {
        let resume_script = self.write_resume_script(checkpoint)?;
        self.launch(&resume_script, &self.working_dir())
    }

    fn restart_fresh(&mut self) -> Result<SpawnedProcess, LaunchError> {
        let original = self.script()?.to_path_buf();
        self.launch(&original, &self.working_dir())
    }
}

/// `train.sh` -> `train_resume.sh`, in the same directory.
pub fn resume_script_path(original: &Path) -> PathBuf {
    let stem = original
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "train".to_string());
    let name = match original.extension() {
        Some(ext) => format!("{stem}_resume.{}", ext.to_string_lossy()),
        None => format!("{stem}_resume"),
    };
    original.with_file_name(name)
}

/// Command-line fragment an operator adds to resume by hand (POSIX shell).
pub fn manual_resume_command(flag: &str, checkpoint: &Path) -> String {
    format!("{flag} {}", quote_path(checkpoint, ScriptDialect::Posix))
}

/// Quote `path` so the script's interpreter passes it through literally.
///
/// POSIX paths with anything beyond plain path characters are single-quoted,
/// with embedded `'` written as `'\''`. Batch paths are double-quoted when
/// they hold whitespace or cmd metacharacters, and `%` is doubled.
fn quote_path(path: &Path, dialect: ScriptDialect) -> String {
    let s = path.to_string_lossy();
    match dialect {
        ScriptDialect::Posix => {
            let plain = s
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "/._-+,:=@%".contains(c));
            if plain && !s.is_empty() {
                s.into_owned()
            } else {
                format!("'{}'", s.replace('\'', r"'\''"))
            }
        }
        ScriptDialect::Batch => {
            let escaped = s.replace('%', "%%");
            if s.chars().any(|c| c.is_whitespace() || "&|<>^()".contains(c)) {
                format!("\"{escaped}\"")
            } else {
                escaped
            }
        }
    }
}

/// Insert `<indent><flag> <checkpoint> <marker>` in front of the final line of
/// the last continued command.
///
/// The anchor is the last non-blank line that does not end with the
/// continuation marker while the line right before it does. Returns `None`
/// when the script has no such line. Line endings (LF or CRLF) and a trailing
/// newline are preserved.
pub fn inject_resume(
    script: &str,
    dialect: ScriptDialect,
    flag: &str,
    checkpoint: &Path,
) -> Option<String> {
    let eol = if script.contains("\r\n") { "\r\n" } else { "\n" };
    let marker = dialect.continuation();
    let lines: Vec<&str> = script
        .split('\n')
        .map(|l| l.strip_suffix('\r').unwrap_or(l))
        .collect();
    let continues = |line: &str| line.trim_end().ends_with(marker);

    let anchor = (1..lines.len()).rev().find(|&i| {
        !lines[i].trim().is_empty() && !continues(lines[i]) && continues(lines[i - 1])
    })?;

    let indent: String = lines[anchor]
        .chars()
        .take_while(|c| c.is_whitespace())
        .collect();
    let inserted = format!("{indent}{flag} {} {marker}", quote_path(checkpoint, dialect));

    let mut out = String::with_capacity(script.len() + inserted.len() + eol.len());
    for (i, line) in lines.iter().enumerate() {
        if i > 0 {
            out.push_str(eol);
        }
        if i == anchor {
            out.push_str(&inserted);
            out.push_str(eol);
        }
        out.push_str(line);
    }
    Some(out)
}

#[cfg(unix)]
fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Start `shell script` in `cwd`, detached from the watchdog.
///
/// stdout and stderr both go to `log_path` (truncated), stdin is null. The
/// child runs in a new session on POSIX and a new detached process group on
/// Windows, and is never waited on.
pub fn spawn_detached(
    shell: &str,
    script: &Path,
    cwd: &Path,
    log_path: &Path,
) -> Result<u32, LaunchError> {
    let log = std::fs::File::create(log_path).map_err(|source| LaunchError::LogFile {
        path: log_path.to_path_buf(),
        source,
    })?;
    let log_stderr = log.try_clone().map_err(|source| LaunchError::LogFile {
        path: log_path.to_path_buf(),
        source,
    })?;

    let mut cmd = Command::new(shell);
    #[cfg(windows)]
    cmd.arg("/C");
    cmd.arg(script)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_stderr));

    #[cfg(unix)]
    // SAFETY: setsid is async-signal-safe and touches no parent state.
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setsid()
                .map(|_| ())
                .map_err(std::io::Error::from)
        });
    }
    #[cfg(windows)]
    cmd.creation_flags(CREATE_NEW_PROCESS_GROUP | DETACHED_PROCESS);

    let child = cmd.spawn().map_err(|source| LaunchError::Spawn {
        script: script.to_path_buf(),
        source,
    })?;
    let pid = child.id().unwrap_or(0);
    tracing::info!(
        pid,
        shell,
        script = %script.display(),
        cwd = %cwd.display(),
        log = %log_path.display(),
        "spawned detached trainer"
    );
    // Dropping the handle leaves the child running; the runtime reaps it on exit.
    drop(child);
    Ok(pid)
}
