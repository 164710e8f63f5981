//! Checkpoint discovery and validation.
//!
//! A state checkpoint is a directory under the output root whose name contains
//! "state". The trainer can crash halfway through writing one, so recency alone
//! never qualifies a directory: it must carry non-empty optimizer, RNG and
//! scheduler state plus a readable step counter in one of two metadata schemas.

use crate::output_dir::absolutize;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_pickle::{DeOptions, HashableValue, Value as PickleValue};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

pub const OPTIMIZER_STATE: &str = "optimizer.bin";
pub const RNG_STATE: &str = "random_states_0.pkl";
pub const SCHEDULER_STATE: &str = "scheduler.bin";
/// Pickled mapping with `step` (and usually `epoch`).
pub const MODERN_METADATA: &str = "custom_checkpoint_0.pkl";
/// JSON document with `current_step` (and usually `current_epoch`).
pub const LEGACY_METADATA: &str = "train_state.json";

const REQUIRED_ARTIFACTS: [&str; 3] = [OPTIMIZER_STATE, RNG_STATE, SCHEDULER_STATE];

/// Which metadata schema validated the checkpoint, with the values it carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum CheckpointFormat {
    Modern { step: u64, epoch: Option<u64> },
    Legacy { step: u64, epoch: Option<u64> },
}

impl CheckpointFormat {
    pub fn step(&self) -> u64 {
        match self {
            CheckpointFormat::Modern { step, .. } | CheckpointFormat::Legacy { step, .. } => *step,
        }
    }

    pub fn epoch(&self) -> Option<u64> {
        match self {
            CheckpointFormat::Modern { epoch, .. } | CheckpointFormat::Legacy { epoch, .. } => {
                *epoch
            }
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            CheckpointFormat::Modern { .. } => "modern",
            CheckpointFormat::Legacy { .. } => "legacy",
        }
    }
}

/// Why a candidate was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidReason {
    MissingArtifact(&'static str),
    EmptyArtifact(&'static str),
    UnreadableArtifact {
        artifact: &'static str,
        detail: String,
    },
    NoMetadata,
    ModernMetadata(String),
    LegacyMetadata(String),
}

impl std::fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidReason::MissingArtifact(name) => write!(f, "missing {name}"),
            InvalidReason::EmptyArtifact(name) => write!(f, "empty {name} (0 bytes)"),
            InvalidReason::UnreadableArtifact { artifact, detail } => {
                write!(f, "cannot stat {artifact}: {detail}")
            }
            InvalidReason::NoMetadata => {
                write!(f, "neither {MODERN_METADATA} nor {LEGACY_METADATA} present")
            }
            InvalidReason::ModernMetadata(detail) => write!(f, "{MODERN_METADATA}: {detail}"),
            InvalidReason::LegacyMetadata(detail) => write!(f, "{LEGACY_METADATA}: {detail}"),
        }
    }
}

/// Validate one checkpoint directory.
///
/// 1. Every required artifact exists and is non-empty.
/// 2. At least one metadata document exists.
/// 3. Modern metadata, when present, must deserialize to a mapping with a
///    numeric `step`; on failure fall back to the legacy document if there is one.
/// 4. Legacy metadata must be a JSON object with a numeric `current_step`.
pub fn validate(dir: &Path) -> Result<CheckpointFormat, InvalidReason> {
    for artifact in REQUIRED_ARTIFACTS {
        match std::fs::metadata(dir.join(artifact)) {
            Ok(meta) if !meta.is_file() => return Err(InvalidReason::MissingArtifact(artifact)),
            Ok(meta) if meta.len() == 0 => return Err(InvalidReason::EmptyArtifact(artifact)),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(InvalidReason::MissingArtifact(artifact))
            }
            Err(e) => {
                return Err(InvalidReason::UnreadableArtifact {
                    artifact,
                    detail: e.to_string(),
                })
            }
        }
    }

    let modern = dir.join(MODERN_METADATA);
    let legacy = dir.join(LEGACY_METADATA);
    let has_legacy = legacy.is_file();

    if modern.is_file() {
        match read_modern(&modern) {
            Ok(format) => return Ok(format),
            Err(detail) if has_legacy => {
                tracing::debug!(
                    checkpoint = %dir.display(),
                    reason = %detail,
                    "modern metadata unusable, trying legacy document"
                );
            }
            Err(detail) => return Err(InvalidReason::ModernMetadata(detail)),
        }
    } else if !has_legacy {
        return Err(InvalidReason::NoMetadata);
    }

    read_legacy(&legacy).map_err(InvalidReason::LegacyMetadata)
}

fn read_modern(path: &Path) -> Result<CheckpointFormat, String> {
    let file = std::fs::File::open(path).map_err(|e| format!("cannot open: {e}"))?;
    let value = serde_pickle::value_from_reader(
        BufReader::new(file),
        DeOptions::new().replace_unresolved_globals(),
    )
    .map_err(|e| format!("cannot deserialize: {e}"))?;

    let PickleValue::Dict(map) = value else {
        return Err("metadata is not a mapping".to_string());
    };
    let lookup = |key: &str| {
        map.get(&HashableValue::String(key.to_string()))
            .or_else(|| map.get(&HashableValue::Bytes(key.as_bytes().to_vec())))
    };

    let step = lookup("step").ok_or_else(|| "missing 'step' key".to_string())?;
    let step = pickle_count(step).ok_or_else(|| "'step' is not a non-negative integer".to_string())?;
    let epoch = lookup("epoch").and_then(pickle_count);
    Ok(CheckpointFormat::Modern { step, epoch })
}

fn pickle_count(value: &PickleValue) -> Option<u64> {
    match value {
        PickleValue::I64(n) => u64::try_from(*n).ok(),
        PickleValue::F64(f) if *f >= 0.0 && f.fract() == 0.0 => Some(*f as u64),
        _ => None,
    }
}

fn read_legacy(path: &Path) -> Result<CheckpointFormat, String> {
    let contents = std::fs::read_to_string(path).map_err(|e| format!("cannot read: {e}"))?;
    let doc: serde_json::Value =
        serde_json::from_str(&contents).map_err(|e| format!("invalid JSON: {e}"))?;
    let obj = doc
        .as_object()
        .ok_or_else(|| "document is not an object".to_string())?;

    let step = obj
        .get("current_step")
        .ok_or_else(|| "missing 'current_step' key".to_string())?;
    let step =
        json_count(step).ok_or_else(|| "'current_step' is not a non-negative integer".to_string())?;
    let epoch = obj.get("current_epoch").and_then(json_count);
    Ok(CheckpointFormat::Legacy { step, epoch })
}

fn json_count(value: &serde_json::Value) -> Option<u64> {
    value.as_u64().or_else(|| {
        value
            .as_f64()
            .filter(|f| *f >= 0.0 && f.fract() == 0.0)
            .map(|f| f as u64)
    })
}

/// A candidate that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidCheckpoint {
    pub path: PathBuf,
    pub format: CheckpointFormat,
    pub modified: SystemTime,
}

/// Verdict for one candidate directory, for listings.
#[derive(Debug, Clone, Serialize)]
pub struct CandidateReport {
    pub path: PathBuf,
    pub modified: DateTime<Utc>,
    pub valid: bool,
    #[serde(flatten)]
    pub format: Option<CheckpointFormat>,
    pub reason: Option<String>,
}

/// Checkpoint queries as seen by the orchestrator.
pub trait CheckpointSource {
    fn latest_valid_state_checkpoint(&self) -> Option<ValidCheckpoint>;
    fn latest_model_checkpoint(&self) -> Option<PathBuf>;
}

/// Read-only view of the checkpoints under one output directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
    model_extension: String,
}

impl CheckpointStore {
    /// The root is made absolute here, so every path the store hands out is
    /// absolute too.
    pub fn new(output_dir: &Path, model_extension: &str) -> std::io::Result<Self> {
        Ok(Self {
            root: absolutize(output_dir)?,
            model_extension: model_extension.trim_start_matches('.').to_string(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Candidate directories with their mtimes, newest first.
    fn candidates(&self) -> Vec<(PathBuf, SystemTime)> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(
                    dir = %self.root.display(),
                    error = %e,
                    "cannot read output directory"
                );
                return Vec::new();
            }
        };

        let mut found: Vec<(PathBuf, SystemTime)> = entries
            .flatten()
            .filter(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .to_lowercase()
                    .contains("state")
            })
            .filter_map(|entry| {
                let path = entry.path();
                let meta = std::fs::metadata(&path).ok()?;
                if !meta.is_dir() {
                    return None;
                }
                let modified = meta.modified().ok()?;
                Some((path, modified))
            })
            .collect();

        sort_newest_first(&mut found);
        found
    }

    /// Every candidate with its verdict, newest first.
    pub fn scan(&self) -> Vec<CandidateReport> {
        self.candidates()
            .into_iter()
            .map(|(path, modified)| {
                let verdict = validate(&path);
                CandidateReport {
                    modified: DateTime::<Utc>::from(modified),
                    valid: verdict.is_ok(),
                    format: verdict.as_ref().ok().copied(),
                    reason: verdict.err().map(|r| r.to_string()),
                    path,
                }
            })
            .collect()
    }
}

impl CheckpointSource for CheckpointStore {
    fn latest_valid_state_checkpoint(&self) -> Option<ValidCheckpoint> {
        let candidates = self.candidates();
        if candidates.is_empty() {
            tracing::warn!(dir = %self.root.display(), "no state checkpoints found");
            return None;
        }

        let mut valid: Vec<ValidCheckpoint> = candidates
            .into_iter()
            .filter_map(|(path, modified)| match validate(&path) {
                Ok(format) => Some(ValidCheckpoint {
                    path,
                    format,
                    modified,
                }),
                Err(reason) => {
                    tracing::warn!(
                        checkpoint = %path.display(),
                        reason = %reason,
                        "skipping invalid checkpoint"
                    );
                    None
                }
            })
            .collect();
        valid.sort_by(|a, b| {
            b.modified
                .cmp(&a.modified)
                .then_with(|| b.path.cmp(&a.path))
        });

        let latest = valid.into_iter().next();
        match &latest {
            Some(cp) => tracing::info!(
                checkpoint = %cp.path.display(),
                format = cp.format.label(),
                step = cp.format.step(),
                epoch = ?cp.format.epoch(),
                "latest valid checkpoint"
            ),
            None => tracing::warn!(dir = %self.root.display(), "no valid state checkpoint"),
        }
        latest
    }

    fn latest_model_checkpoint(&self) -> Option<PathBuf> {
        let pattern = format!(
            "{}/*.{}",
            glob::Pattern::escape(&self.root.to_string_lossy()),
            self.model_extension
        );
        let paths = match glob::glob(&pattern) {
            Ok(paths) => paths,
            Err(e) => {
                tracing::warn!(pattern, error = %e, "invalid model checkpoint pattern");
                return None;
            }
        };

        let mut models: Vec<(PathBuf, SystemTime)> = paths
            .flatten()
            .filter_map(|path| {
                let meta = std::fs::metadata(&path).ok()?;
                if !meta.is_file() {
                    return None;
                }
                Some((path, meta.modified().ok()?))
            })
            .collect();
        sort_newest_first(&mut models);

        let latest = models.into_iter().next().map(|(path, _)| path);
        if latest.is_none() {
            tracing::debug!(
                dir = %self.root.display(),
                extension = %self.model_extension,
                "no model checkpoints found"
            );
        }
        latest
    }
}

fn sort_newest_first(items: &mut [(PathBuf, SystemTime)]) {
    items.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
}
