//! Correlation heuristics
//!
//! Screenshots, agent records and spec documents carry no run id. They are
//! attached to a run by timestamp proximity, and every heuristic here degrades
//! to "show something" when timing data is missing.

use crate::agents::{AgentPhase, AgentRecord, SpecFile};
use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::PathBuf;
use testdeck_common::{ReportSummary, RunStatus};

static SCENARIO_SECTION: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(
        r"(?i)##\s*(?:Scenario Input|Input del Escenario|Entrada del Escenario)\s*([\s\S]*?)(?:\n##\s|\n#\s|$)",
    )
    .ok()
});

const TRUNCATION_SUFFIX: &str = "\n\n...";

/// Run status from the runner's completion marker and the parsed report
///
/// First match wins: marker failed/passed/running, any failure, an empty
/// summary with top-level report errors, else passed.
pub fn resolve_status(marker: Option<&str>, summary: &ReportSummary, report_error_count: usize) -> RunStatus {
    match marker {
        Some("failed") => return RunStatus::Failed,
        Some("passed") => return RunStatus::Passed,
        Some("running") => return RunStatus::Running,
        _ => {}
    }

    if summary.failed > 0 {
        return RunStatus::Failed;
    }
    if summary.is_empty() && report_error_count > 0 {
        return RunStatus::Failed;
    }
    RunStatus::Passed
}

/// Lenient RFC 3339 parse
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Start plus duration, only when both are known and the sum is representable
pub fn finished_at(started_at: Option<DateTime<Utc>>, duration_ms: u64) -> Option<DateTime<Utc>> {
    let started_at = started_at?;
    if duration_ms == 0 {
        return None;
    }
    let duration = Duration::try_milliseconds(i64::try_from(duration_ms).ok()?)?;
    started_at.checked_add_signed(duration)
}

/// An image file that may belong to a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenshotCandidate {
    pub path: PathBuf,
    pub modified: DateTime<Utc>,
}

/// Candidates modified within `[start - padding, (finish or now) + padding]`
///
/// Without a start time, or when nothing falls inside the window, every
/// candidate is kept. The result is sorted by path.
pub fn screenshots_in_window(
    mut candidates: Vec<ScreenshotCandidate>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    padding: Duration,
) -> Vec<ScreenshotCandidate> {
    candidates.sort_by(|a, b| a.path.cmp(&b.path));

    let Some(started_at) = started_at else {
        return candidates;
    };

    let lower = started_at - padding;
    let upper = finished_at.unwrap_or(now) + padding;
    let in_window: Vec<ScreenshotCandidate> = candidates
        .iter()
        .filter(|c| c.modified >= lower && c.modified <= upper)
        .cloned()
        .collect();

    if in_window.is_empty() {
        candidates
    } else {
        in_window
    }
}

/// Record of `phase` closest to `anchor` when within `window`, else the most
/// recent record of that phase
///
/// `records` must be sorted newest first.
pub fn best_agent_record<'a>(
    records: &'a [AgentRecord],
    phase: AgentPhase,
    anchor: Option<DateTime<Utc>>,
    window: Duration,
) -> Option<&'a AgentRecord> {
    let scoped = records.iter().filter(|r| r.phase == phase);
    let newest = scoped.clone().next()?;

    let Some(anchor) = anchor else {
        return Some(newest);
    };

    let mut best: Option<(&AgentRecord, Duration)> = None;
    for record in scoped {
        let diff = if record.created_at > anchor {
            record.created_at - anchor
        } else {
            anchor - record.created_at
        };
        if best.map_or(true, |(_, best_diff)| diff < best_diff) {
            best = Some((record, diff));
        }
    }

    match best {
        Some((record, diff)) if diff <= window => Some(record),
        _ => Some(newest),
    }
}

/// Newest file modified no later than `anchor + window`, else the newest overall
pub fn latest_spec_file(files: &[SpecFile], anchor: Option<DateTime<Utc>>, window: Duration) -> Option<&SpecFile> {
    let mut sorted: Vec<&SpecFile> = files.iter().collect();
    sorted.sort_by(|a, b| b.modified.cmp(&a.modified));

    let newest = sorted.first().copied()?;
    let Some(anchor) = anchor else {
        return Some(newest);
    };

    let limit = anchor + window;
    Some(sorted.into_iter().find(|f| f.modified <= limit).unwrap_or(newest))
}

/// Body of the first scenario-input section, else the whole document,
/// truncated to `max_chars`
pub fn parse_scenario_input(content: &str, max_chars: usize) -> Option<String> {
    let section = SCENARIO_SECTION
        .as_ref()
        .and_then(|re| re.captures(content))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(content)
        .trim();

    if section.is_empty() {
        return None;
    }

    if section.chars().count() > max_chars {
        let truncated: String = section.chars().take(max_chars).collect();
        return Some(format!("{}{}", truncated, TRUNCATION_SUFFIX));
    }
    Some(section.to_string())
}
