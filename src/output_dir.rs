use std::io::Write;
use std::path::{Component, Path, PathBuf};

/// Well-known files inside a training output directory.
///
/// The trainer owns checkpoints and weight files here; the watchdog only adds
/// its own bookkeeping files next to them. The root is always absolute: it is
/// resolved once, when the `OutputDir` is built, so every path handed to a
/// relaunched script stays valid no matter which directory that script runs in.
#[derive(Debug, Clone)]
pub struct OutputDir {
    root: PathBuf,
}

impl OutputDir {
    /// Resolve `path` against the current working directory and wrap it.
    pub fn resolve(path: &Path) -> std::io::Result<Self> {
        Ok(Self {
            root: absolutize(path)?,
        })
    }

    /// The absolute root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Output name, i.e. the final path component (e.g. `my-lora`).
    pub fn name(&self) -> String {
        self.root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".to_string())
    }

    /// Training session record.
    pub fn session(&self) -> PathBuf {
        self.root.join("session.json")
    }

    /// Watchdog status file, replaced on every state transition.
    pub fn status(&self) -> PathBuf {
        self.root.join("watchdog.status")
    }

    /// Pid file of the running watchdog.
    pub fn monitor_pid(&self) -> PathBuf {
        self.root.join("monitor.pid")
    }

    /// Pid of the most recently spawned trainer.
    pub fn training_pid(&self) -> PathBuf {
        self.root.join("training.pid")
    }

    /// Append-only diagnostic log of the watchdog itself.
    pub fn watchdog_log(&self) -> PathBuf {
        self.root.join("watchdog.log")
    }

    /// Output log of the relaunched trainer (truncated on every relaunch).
    pub fn training_log(&self) -> PathBuf {
        self.root.join("training.log")
    }

    /// SQLite recovery history.
    pub fn history_db(&self) -> PathBuf {
        self.root.join("history.db")
    }

    /// Optional per-run config file.
    pub fn config(&self) -> PathBuf {
        self.root.join("trainwatch.toml")
    }

    /// Final weights file the trainer writes when a run completes,
    /// e.g. `my-lora/my-lora.safetensors`.
    pub fn expected_model(&self, extension: &str) -> PathBuf {
        self.root.join(format!("{}.{extension}", self.name()))
    }

    /// Create the root directory if missing.
    /// Returns Ok(true) if it was created, Ok(false) if it already existed.
    pub fn ensure_exists(&self) -> std::io::Result<bool> {
        let created = !self.root.exists();
        std::fs::create_dir_all(&self.root)?;
        Ok(created)
    }
}

/// Make `path` absolute relative to the current working directory.
///
/// Unlike `canonicalize`, the path does not need to exist yet.
pub fn absolutize(path: &Path) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        return Ok(normalize(path));
    }
    let cwd = std::env::current_dir()?;
    Ok(absolutize_from(path, &cwd))
}

pub(crate) fn absolutize_from(path: &Path, cwd: &Path) -> PathBuf {
    if path.is_absolute() {
        normalize(path)
    } else {
        normalize(&cwd.join(path))
    }
}

/// Lexically drop `.` components and fold `..` into their parent.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Replace `path` with `contents` as a whole document.
///
/// Writes a temp file in the same directory, then renames it over the target,
/// so concurrent readers see either the old or the new document, never a mix.
pub fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
