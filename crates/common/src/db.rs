//! SQLite persistence for run metadata
//!
//! The orchestrator only needs a narrow view of storage: create/read/update a
//! run by id, count runs by status, and a bulk set-status-where-status for
//! reconciliation. [`RunStore`] is that view; [`Database`] implements it.

use crate::types::{ReportSummary, Run, RunMode, RunStatus, RunUpdate, Target};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Persistence collaborator used by the orchestrator and the run service
pub trait RunStore: Send + Sync {
    fn create_run(&self, run: &Run) -> Result<()>;

    fn get_run(&self, id: &str) -> Result<Option<Run>>;

    /// Apply a terminal update; returns false when the row no longer exists
    fn update_run(&self, id: &str, update: &RunUpdate) -> Result<bool>;

    fn count_by_status(&self, status: RunStatus) -> Result<u64>;

    fn list_run_ids_with_status(&self, status: RunStatus) -> Result<Vec<String>>;

    /// Update every listed run that is still in `from`; returns rows changed
    fn update_runs_where_status(&self, ids: &[String], from: RunStatus, update: &RunUpdate) -> Result<usize>;

    /// Newest first
    fn list_runs(&self, limit: usize) -> Result<Vec<Run>>;

    fn create_target(&self, target: &Target) -> Result<()>;

    fn get_target(&self, id: &str) -> Result<Option<Target>>;

    fn list_targets(&self) -> Result<Vec<Target>>;

    /// Rename or repoint a target; None when it does not exist
    fn update_target(&self, id: &str, name: &str, base_url: &str) -> Result<Option<Target>>;

    /// Returns false when the target does not exist
    fn delete_target(&self, id: &str) -> Result<bool>;
}

/// Database wrapper for state persistence
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

const RUN_COLUMNS: &str = "id, target_id, suite_name, suite_hash, mode, slow_mo_ms, status, \
     started_at, finished_at, exit_code, total, passed, failed, flaky, duration_ms, \
     stdout_path, stderr_path, report_json_path, html_report_path, artifacts_dir";

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path.as_ref())?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS targets (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                base_url TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                target_id TEXT NOT NULL,
                suite_name TEXT NOT NULL,
                suite_hash TEXT,
                mode TEXT NOT NULL,
                slow_mo_ms INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                started_at INTEGER,
                finished_at INTEGER,
                exit_code INTEGER,
                total INTEGER,
                passed INTEGER,
                failed INTEGER,
                flaky INTEGER,
                duration_ms INTEGER,
                stdout_path TEXT,
                stderr_path TEXT,
                report_json_path TEXT,
                html_report_path TEXT,
                artifacts_dir TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
            CREATE INDEX IF NOT EXISTS idx_runs_started_at ON runs(started_at);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }
}

impl RunStore for Database {
    fn create_run(&self, run: &Run) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            &format!(
                "INSERT INTO runs ({}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
                RUN_COLUMNS
            ),
            params![
                run.id,
                run.target_id,
                run.suite_name,
                run.suite_hash,
                run.mode.as_str(),
                run.slow_mo_ms as i64,
                run.status.as_str(),
                run.started_at.map(|t| t.timestamp_millis()),
                run.finished_at.map(|t| t.timestamp_millis()),
                run.exit_code,
                run.total,
                run.passed,
                run.failed,
                run.flaky,
                run.duration_ms.map(|d| i64::try_from(d).unwrap_or(i64::MAX)),
                run.stdout_path,
                run.stderr_path,
                run.report_json_path,
                run.html_report_path,
                run.artifacts_dir,
            ],
        )?;

        debug!("Inserted run {}", run.id);
        Ok(())
    }

    fn get_run(&self, id: &str) -> Result<Option<Run>> {
        let conn = self.conn.lock();

        let raw = conn
            .query_row(
                &format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS),
                params![id],
                RawRunRow::from_row,
            )
            .optional()?;

        raw.map(RawRunRow::parse).transpose()
    }

    fn update_run(&self, id: &str, update: &RunUpdate) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = apply_update(&conn, id, None, update)?;

        if changed > 0 {
            debug!("Updated run {} -> {}", id, update.status);
        }

        Ok(changed > 0)
    }

    fn count_by_status(&self, status: RunStatus) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM runs WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    fn list_run_ids_with_status(&self, status: RunStatus) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id FROM runs WHERE status = ?1")?;
        let ids = stmt
            .query_map(params![status.as_str()], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    fn update_runs_where_status(&self, ids: &[String], from: RunStatus, update: &RunUpdate) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut changed = 0;
        for id in ids {
            changed += apply_update(&tx, id, Some(from), update)?;
        }
        tx.commit()?;

        debug!("Bulk updated {} run(s) {} -> {}", changed, from, update.status);
        Ok(changed)
    }

    fn list_runs(&self, limit: usize) -> Result<Vec<Run>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM runs ORDER BY started_at DESC LIMIT ?1",
            RUN_COLUMNS
        ))?;

        let rows = stmt.query_map(params![limit as i64], RawRunRow::from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?.parse()?);
        }

        Ok(results)
    }

    fn create_target(&self, target: &Target) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO targets (id, name, base_url, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                target.id,
                target.name,
                target.base_url,
                target.created_at.timestamp_millis()
            ],
        )?;
        debug!("Inserted target {} ({})", target.name, target.id);
        Ok(())
    }

    fn get_target(&self, id: &str) -> Result<Option<Target>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, name, base_url, created_at FROM targets WHERE id = ?1",
                params![id],
                target_from_row,
            )
            .optional()?;
        Ok(row)
    }

    fn list_targets(&self) -> Result<Vec<Target>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT id, name, base_url, created_at FROM targets ORDER BY created_at ASC")?;
        let targets = stmt
            .query_map([], target_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(targets)
    }

    fn update_target(&self, id: &str, name: &str, base_url: &str) -> Result<Option<Target>> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE targets SET name = ?1, base_url = ?2 WHERE id = ?3",
            params![name, base_url, id],
        )?;
        if changed == 0 {
            return Ok(None);
        }

        debug!("Updated target {} ({})", name, id);
        let row = conn
            .query_row(
                "SELECT id, name, base_url, created_at FROM targets WHERE id = ?1",
                params![id],
                target_from_row,
            )
            .optional()?;
        Ok(row)
    }

    fn delete_target(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute("DELETE FROM targets WHERE id = ?1", params![id])?;
        if changed > 0 {
            info!("Deleted target {}", id);
        }
        Ok(changed > 0)
    }
}

fn apply_update(conn: &Connection, id: &str, from: Option<RunStatus>, update: &RunUpdate) -> Result<usize> {
    let summary = update.summary;
    let changed = conn.execute(
        "UPDATE runs SET status = ?1, exit_code = ?2, finished_at = ?3, \
             total = COALESCE(?4, total), passed = COALESCE(?5, passed), \
             failed = COALESCE(?6, failed), flaky = COALESCE(?7, flaky), \
             duration_ms = COALESCE(?8, duration_ms) \
         WHERE id = ?9 AND (?10 IS NULL OR status = ?10)",
        params![
            update.status.as_str(),
            update.exit_code,
            update.finished_at.timestamp_millis(),
            summary.map(|s: ReportSummary| s.total),
            summary.map(|s| s.passed),
            summary.map(|s| s.failed),
            summary.map(|s| s.flaky),
            summary.map(|s| i64::try_from(s.duration_ms).unwrap_or(i64::MAX)),
            id,
            from.map(|s| s.as_str()),
        ],
    )?;
    Ok(changed)
}

fn millis_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
}

fn target_from_row(row: &Row<'_>) -> rusqlite::Result<Target> {
    let created_at: i64 = row.get(3)?;
    Ok(Target {
        id: row.get(0)?,
        name: row.get(1)?,
        base_url: row.get(2)?,
        created_at: millis_to_datetime(created_at).unwrap_or_default(),
    })
}

/// Raw database row before parsing
struct RawRunRow {
    id: String,
    target_id: String,
    suite_name: String,
    suite_hash: Option<String>,
    mode: String,
    slow_mo_ms: i64,
    status: String,
    started_at: Option<i64>,
    finished_at: Option<i64>,
    exit_code: Option<i32>,
    total: Option<u32>,
    passed: Option<u32>,
    failed: Option<u32>,
    flaky: Option<u32>,
    duration_ms: Option<i64>,
    stdout_path: Option<String>,
    stderr_path: Option<String>,
    report_json_path: Option<String>,
    html_report_path: Option<String>,
    artifacts_dir: Option<String>,
}

impl RawRunRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            target_id: row.get(1)?,
            suite_name: row.get(2)?,
            suite_hash: row.get(3)?,
            mode: row.get(4)?,
            slow_mo_ms: row.get(5)?,
            status: row.get(6)?,
            started_at: row.get(7)?,
            finished_at: row.get(8)?,
            exit_code: row.get(9)?,
            total: row.get(10)?,
            passed: row.get(11)?,
            failed: row.get(12)?,
            flaky: row.get(13)?,
            duration_ms: row.get(14)?,
            stdout_path: row.get(15)?,
            stderr_path: row.get(16)?,
            report_json_path: row.get(17)?,
            html_report_path: row.get(18)?,
            artifacts_dir: row.get(19)?,
        })
    }

    fn parse(self) -> Result<Run> {
        let status = self
            .status
            .parse::<RunStatus>()
            .map_err(|_| Error::Internal(format!("run {} has invalid status {}", self.id, self.status)))?;

        Ok(Run {
            id: self.id,
            target_id: self.target_id,
            suite_name: self.suite_name,
            suite_hash: self.suite_hash,
            mode: RunMode::parse_lenient(Some(&self.mode)),
            slow_mo_ms: self.slow_mo_ms.max(0) as u64,
            status,
            started_at: self.started_at.and_then(millis_to_datetime),
            finished_at: self.finished_at.and_then(millis_to_datetime),
            exit_code: self.exit_code,
            total: self.total,
            passed: self.passed,
            failed: self.failed,
            flaky: self.flaky,
            duration_ms: self.duration_ms.map(|d| d.max(0) as u64),
            stdout_path: self.stdout_path,
            stderr_path: self.stderr_path,
            report_json_path: self.report_json_path,
            html_report_path: self.html_report_path,
            artifacts_dir: self.artifacts_dir,
        })
    }
}
