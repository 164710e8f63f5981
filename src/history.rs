use crate::orchestrator::RecoveryReport;
use rusqlite::{Connection, Result};
use serde::Serialize;
use std::path::Path;

/// Opens (or creates) the recovery history database at the given path.
///
/// Creates the recoveries table and index if they don't already exist.
pub fn open_or_create(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;

    // WAL so `history` and `serve` can read while the watchdog writes
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS recoveries (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            at               TEXT NOT NULL,
            utilization      REAL,
            memory_mb        REAL,
            action           TEXT NOT NULL,
            checkpoint       TEXT,
            step             INTEGER,
            processes_found  INTEGER NOT NULL DEFAULT 0,
            survivors        INTEGER NOT NULL DEFAULT 0,
            spawned_pid      INTEGER,
            error            TEXT,
            model            TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_recoveries_at ON recoveries(at);",
    )?;

    Ok(conn)
}

/// Record one recovery. Returns the new row id.
pub fn insert_recovery(conn: &Connection, report: &RecoveryReport) -> Result<i64> {
    let checkpoint = report
        .checkpoint
        .as_ref()
        .map(|c| c.path.to_string_lossy().into_owned());
    let step = report
        .checkpoint
        .as_ref()
        .and_then(|c| i64::try_from(c.format.step()).ok());
    let model = report
        .model
        .as_ref()
        .map(|p| p.to_string_lossy().into_owned());
    conn.execute(
        "INSERT INTO recoveries
            (at, utilization, memory_mb, action, checkpoint, step, processes_found, survivors, spawned_pid, error, model)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        rusqlite::params![
            report.at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            report.utilization.value(),
            report.memory_mb.value(),
            report.action.as_str(),
            checkpoint,
            step,
            report.processes_found as i64,
            report.survivors as i64,
            report.spawned.as_ref().map(|s| s.pid),
            report.error,
            model,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// A row from the recoveries table.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryRecord {
    pub id: i64,
    pub at: String,
    pub utilization: Option<f64>,
    pub memory_mb: Option<f64>,
    pub action: String,
    pub checkpoint: Option<String>,
    pub step: Option<i64>,
    pub processes_found: i64,
    pub survivors: i64,
    pub spawned_pid: Option<u32>,
    pub error: Option<String>,
    /// Latest model weights file at detection time.
    pub model: Option<String>,
}

/// Most recent recoveries first. `limit` of None returns everything.
pub fn list_recoveries(conn: &Connection, limit: Option<usize>) -> Result<Vec<RecoveryRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, at, utilization, memory_mb, action, checkpoint, step,
                processes_found, survivors, spawned_pid, error, model
         FROM recoveries ORDER BY id DESC LIMIT ?1",
    )?;
    // SQLite treats a negative LIMIT as unbounded
    let limit = limit.and_then(|n| i64::try_from(n).ok()).unwrap_or(-1);
    let rows = stmt.query_map([limit], map_recovery)?;
    rows.collect()
}

/// Open the database only if it already exists. Read-only callers use this
/// so that asking for history never creates an empty database.
pub fn open_existing(path: &Path) -> Result<Option<Connection>> {
    if !path.exists() {
        return Ok(None);
    }
    open_or_create(path).map(Some)
}

fn map_recovery(row: &rusqlite::Row) -> Result<RecoveryRecord> {
    Ok(RecoveryRecord {
        id: row.get(0)?,
        at: row.get(1)?,
        utilization: row.get(2)?,
        memory_mb: row.get(3)?,
        action: row.get(4)?,
        checkpoint: row.get(5)?,
        step: row.get(6)?,
        processes_found: row.get(7)?,
        survivors: row.get(8)?,
        spawned_pid: row.get(9)?,
        error: row.get(10)?,
        model: row.get(11)?,
    })
}
