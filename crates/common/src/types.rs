//! Core types for Testdeck

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Exit code recorded when the runner process could not be spawned
pub const EXIT_CODE_SPAWN_FAILED: i32 = -1;

/// Exit code recorded for runs left RUNNING by an unclean restart
pub const EXIT_CODE_STALE: i32 = -2;

/// Exit code recorded when a run exceeds its wall-clock timeout
pub const EXIT_CODE_TIMEOUT: i32 = 124;

/// Exit code recorded when a run is cancelled
pub const EXIT_CODE_CANCELLED: i32 = 130;

/// Run lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Queued,
    Running,
    Passed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "QUEUED",
            RunStatus::Running => "RUNNING",
            RunStatus::Passed => "PASSED",
            RunStatus::Failed => "FAILED",
        }
    }

    /// Terminal status for a process exit code: PASSED iff exactly 0
    pub fn from_exit_code(exit_code: i32) -> Self {
        if exit_code == 0 {
            RunStatus::Passed
        } else {
            RunStatus::Failed
        }
    }
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::Queued
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "QUEUED" => Ok(RunStatus::Queued),
            "RUNNING" => Ok(RunStatus::Running),
            "PASSED" => Ok(RunStatus::Passed),
            "FAILED" => Ok(RunStatus::Failed),
            other => Err(crate::Error::Validation(format!("unknown run status: {}", other))),
        }
    }
}

/// Browser execution mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Headless,
    Headed,
}

impl Default for RunMode {
    fn default() -> Self {
        Self::Headless
    }
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Headless => "headless",
            RunMode::Headed => "headed",
        }
    }

    /// Anything other than "headed" runs headless
    pub fn parse_lenient(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("headed") => RunMode::Headed,
            _ => RunMode::Headless,
        }
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate counts for a parsed report
///
/// `total` is always `passed + failed + flaky`, saturating at `u32::MAX`;
/// skipped tests are not counted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSummary {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub flaky: u32,
    pub duration_ms: u64,
}

impl ReportSummary {
    pub fn new(passed: u32, failed: u32, flaky: u32, duration_ms: u64) -> Self {
        Self {
            total: passed.saturating_add(failed).saturating_add(flaky),
            passed,
            failed,
            flaky,
            duration_ms,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

/// A target application the suites run against
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub created_at: DateTime<Utc>,
}

impl Target {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            base_url: base_url.into(),
            created_at: Utc::now(),
        }
    }
}

/// Persisted record of one suite execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    pub target_id: String,
    pub suite_name: String,
    pub suite_hash: Option<String>,
    pub mode: RunMode,
    pub slow_mo_ms: u64,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub total: Option<u32>,
    pub passed: Option<u32>,
    pub failed: Option<u32>,
    pub flaky: Option<u32>,
    pub duration_ms: Option<u64>,
    /// Stored paths are workspace-relative and `/`-separated
    pub stdout_path: Option<String>,
    pub stderr_path: Option<String>,
    pub report_json_path: Option<String>,
    pub html_report_path: Option<String>,
    pub artifacts_dir: Option<String>,
}

impl Run {
    /// New run record in RUNNING, started now
    pub fn running(
        id: impl Into<String>,
        target_id: impl Into<String>,
        suite_name: impl Into<String>,
        mode: RunMode,
        slow_mo_ms: u64,
    ) -> Self {
        Self {
            id: id.into(),
            target_id: target_id.into(),
            suite_name: suite_name.into(),
            suite_hash: None,
            mode,
            slow_mo_ms,
            status: RunStatus::Running,
            started_at: Some(Utc::now()),
            finished_at: None,
            exit_code: None,
            total: None,
            passed: None,
            failed: None,
            flaky: None,
            duration_ms: None,
            stdout_path: None,
            stderr_path: None,
            report_json_path: None,
            html_report_path: None,
            artifacts_dir: None,
        }
    }

    /// Summary from the persisted counts, missing counts read as zero
    pub fn persisted_summary(&self) -> ReportSummary {
        ReportSummary {
            total: self.total.unwrap_or(0),
            passed: self.passed.unwrap_or(0),
            failed: self.failed.unwrap_or(0),
            flaky: self.flaky.unwrap_or(0),
            duration_ms: self.duration_ms.unwrap_or(0),
        }
    }
}

/// Terminal update applied to a run record
#[derive(Debug, Clone, PartialEq)]
pub struct RunUpdate {
    pub status: RunStatus,
    pub exit_code: i32,
    pub finished_at: DateTime<Utc>,
    pub summary: Option<ReportSummary>,
}

impl RunUpdate {
    pub fn finished(exit_code: i32, summary: Option<ReportSummary>) -> Self {
        Self {
            status: RunStatus::from_exit_code(exit_code),
            exit_code,
            finished_at: Utc::now(),
            summary,
        }
    }

    /// Forced FAILED with a distinguished exit code
    pub fn failed(exit_code: i32) -> Self {
        Self {
            status: RunStatus::Failed,
            exit_code,
            finished_at: Utc::now(),
            summary: None,
        }
    }
}

/// Runtime settings reported alongside run listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    pub run_timeout_ms: u64,
    pub retries: u32,
}
