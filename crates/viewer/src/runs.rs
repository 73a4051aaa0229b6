//! Run reconstruction from the artifact store
//!
//! Runs are rebuilt purely from what the runner left on disk, independent of
//! the run database, so manually executed runs show up too.

use crate::agents::{build_agent_context, AgentContext};
use crate::config::CorrelatorConfig;
use crate::correlate::{finished_at, parse_timestamp, resolve_status};
use crate::screenshots::collect_run_screenshots;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use testdeck_common::report::{first_suite_title, ReportDocument};
use testdeck_common::{
    tail_file, ParsedAttachment, ParsedFailingTest, ParsedReport, ParsedTestCase, PathResolver,
    ReportParser, ReportSummary, Result, RunPaths, RunStatus,
};
use tracing::debug;

pub const DEFAULT_TAIL_LINES: usize = 600;
pub const MIN_TAIL_LINES: usize = 20;
pub const MAX_TAIL_LINES: usize = 5000;

/// A run reconstructed from its artifact directory
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerRun {
    pub id: String,
    pub suite_name: String,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub flaky: u32,
    pub html_report_url: Option<String>,
    pub report_json_url: Option<String>,
    pub stdout_url: Option<String>,
    pub stderr_url: Option<String>,
    pub source: &'static str,
}

/// Full triage view of one run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerRunDetails {
    pub run: ViewerRun,
    pub summary: ReportSummary,
    pub tests: Vec<ParsedTestCase>,
    pub failing_tests: Vec<ParsedFailingTest>,
    pub flaky_tests: Vec<String>,
    pub screenshots: Vec<ParsedAttachment>,
    pub agent_context: Option<AgentContext>,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Default, Deserialize)]
struct LastRunMarker {
    #[serde(default)]
    status: Option<String>,
}

struct LoadedRun {
    run: ViewerRun,
    report: ParsedReport,
    paths: RunPaths,
    sort_key: DateTime<Utc>,
}

/// Clamp a requested tail length, defaulting when absent
pub fn clamp_tail_lines(requested: Option<usize>) -> usize {
    requested
        .unwrap_or(DEFAULT_TAIL_LINES)
        .clamp(MIN_TAIL_LINES, MAX_TAIL_LINES)
}

/// Rebuilds runs and their evidence from the artifacts root
#[derive(Debug, Clone)]
pub struct ArtifactCorrelator {
    resolver: PathResolver,
    parser: ReportParser,
    config: CorrelatorConfig,
}

impl ArtifactCorrelator {
    pub fn new(resolver: PathResolver, config: CorrelatorConfig) -> Self {
        Self {
            parser: ReportParser::new(resolver.clone()),
            resolver,
            config,
        }
    }

    pub fn config(&self) -> &CorrelatorConfig {
        &self.config
    }

    /// Runs with a readable report, newest first
    pub async fn list_runs(&self) -> Vec<ViewerRun> {
        let mut entries = match tokio::fs::read_dir(self.resolver.artifacts_root()).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!("No artifacts root at {:?}: {}", self.resolver.artifacts_root(), e);
                return Vec::new();
            }
        };

        let mut loaded = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            let Some(run_id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            match self.load_run(&run_id).await {
                Ok(Some(run)) => loaded.push(run),
                Ok(None) => {}
                Err(e) => debug!("Skipping artifact directory {:?}: {}", run_id, e),
            }
        }

        loaded.sort_by(|a, b| b.sort_key.cmp(&a.sort_key));
        loaded.into_iter().map(|l| l.run).collect()
    }

    /// Run detail with log tails, tests and correlated evidence
    ///
    /// `Ok(None)` when the run has no readable report; an id that escapes the
    /// artifacts root is an error.
    pub async fn get_run_details(&self, run_id: &str, lines: Option<usize>) -> Result<Option<ViewerRunDetails>> {
        let Some(loaded) = self.load_run(run_id).await? else {
            return Ok(None);
        };
        let lines = clamp_tail_lines(lines);

        let stdout = tail_file(&loaded.paths.stdout, lines).await;
        let stderr = tail_file(&loaded.paths.stderr, lines).await;

        let screenshots = collect_run_screenshots(
            &self.resolver,
            &self.config,
            run_id,
            &loaded.paths.run_dir,
            loaded.run.started_at,
            loaded.run.finished_at,
            Utc::now(),
        )
        .await;
        let agent_context = build_agent_context(&self.resolver, &self.config, loaded.run.started_at).await;

        let ParsedReport {
            summary,
            tests,
            failing_tests,
            flaky_tests,
        } = loaded.report;

        Ok(Some(ViewerRunDetails {
            run: loaded.run,
            summary,
            tests,
            failing_tests,
            flaky_tests,
            screenshots,
            agent_context,
            stdout,
            stderr,
        }))
    }

    async fn load_run(&self, run_id: &str) -> Result<Option<LoadedRun>> {
        let paths = self.resolver.paths_for(run_id)?;

        let report_modified = match tokio::fs::metadata(&paths.report).await {
            Ok(metadata) if metadata.is_file() => metadata.modified().ok().map(DateTime::<Utc>::from),
            _ => return Ok(None),
        };
        let Some(document) = ReportParser::load_document(&paths.report).await else {
            return Ok(None);
        };

        let report = self.parser.parse_document(&document);
        let marker = read_last_run_status(&paths.last_run_marker()).await;
        let status = resolve_status(marker.as_deref(), &report.summary, document.errors.len());

        let started_at = report_start_time(&document);
        let duration_ms = report.summary.duration_ms;

        let run = ViewerRun {
            id: run_id.to_string(),
            suite_name: first_suite_title(&document).unwrap_or_else(|| run_id.to_string()),
            status,
            started_at,
            finished_at: finished_at(started_at, duration_ms),
            duration_ms: (duration_ms > 0).then_some(duration_ms),
            total: report.summary.total,
            passed: report.summary.passed,
            failed: report.summary.failed,
            flaky: report.summary.flaky,
            html_report_url: self.url_if_exists(&paths.html_report_index()).await,
            report_json_url: self.resolver.artifact_url(&paths.report),
            stdout_url: self.url_if_exists(&paths.stdout).await,
            stderr_url: self.url_if_exists(&paths.stderr).await,
            source: "artifacts",
        };

        let sort_key = started_at
            .or(report_modified)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        Ok(Some(LoadedRun {
            run,
            report,
            paths,
            sort_key,
        }))
    }

    async fn url_if_exists(&self, path: &Path) -> Option<String> {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            self.resolver.artifact_url(path)
        } else {
            None
        }
    }
}

fn report_start_time(document: &ReportDocument) -> Option<DateTime<Utc>> {
    document
        .stats
        .as_ref()
        .and_then(|s| s.start_time.as_deref())
        .and_then(parse_timestamp)
}

/// Lowercased status from the runner's completion marker
async fn read_last_run_status(path: &Path) -> Option<String> {
    let raw = tokio::fs::read_to_string(path).await.ok()?;
    let marker: LastRunMarker = serde_json::from_str(&raw).ok()?;
    marker.status.map(|s| s.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn write_report(resolver: &PathResolver, run_id: &str, report: Value) -> RunPaths {
        let paths = resolver.paths_for(run_id).unwrap();
        std::fs::create_dir_all(&paths.run_dir).unwrap();
        std::fs::write(&paths.report, serde_json::to_string(&report).unwrap()).unwrap();
        paths
    }

    fn passing_report(start: &str) -> Value {
        json!({
            "stats": {"startTime": start, "duration": 1500.4, "expected": 2, "unexpected": 0, "flaky": 0, "skipped": 1},
            "suites": [{
                "title": "",
                "specs": [{"title": "login works", "tests": [{"status": "expected", "results": [{"status": "passed"}]}]}]
            }]
        })
    }

    fn correlator(dir: &Path) -> ArtifactCorrelator {
        ArtifactCorrelator::new(PathResolver::new(dir), CorrelatorConfig::default())
    }

    #[test]
    fn test_clamp_tail_lines() {
        assert_eq!(clamp_tail_lines(None), 600);
        assert_eq!(clamp_tail_lines(Some(1)), 20);
        assert_eq!(clamp_tail_lines(Some(100_000)), 5000);
        assert_eq!(clamp_tail_lines(Some(250)), 250);
    }

    #[tokio::test]
    async fn test_list_runs_order_and_filtering() {
        let dir = tempfile::tempdir().unwrap();
        let correlator = correlator(dir.path());
        let resolver = PathResolver::new(dir.path());

        write_report(&resolver, "older", passing_report("2024-01-01T10:00:00Z"));
        write_report(&resolver, "newer", passing_report("2024-03-01T10:00:00Z"));
        // no start time: sorted by report mtime, which is now
        write_report(&resolver, "undated", json!({"suites": []}));
        let broken = resolver.paths_for("broken").unwrap();
        std::fs::create_dir_all(&broken.run_dir).unwrap();
        std::fs::write(&broken.report, "{ nope").unwrap();
        std::fs::create_dir_all(resolver.run_dir("empty").unwrap()).unwrap();
        std::fs::write(resolver.artifacts_root().join("stray.txt"), "x").unwrap();

        let runs = correlator.list_runs().await;
        let ids: Vec<_> = runs.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["undated", "newer", "older"]);
        assert!(runs.iter().all(|r| r.source == "artifacts"));
    }

    #[tokio::test]
    async fn test_run_fields() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = PathResolver::new(dir.path());
        let paths = write_report(&resolver, "run-1", passing_report("2024-03-01T10:00:00.000Z"));
        std::fs::write(&paths.stdout, "ok\n").unwrap();

        let runs = correlator(dir.path()).list_runs().await;
        let run = &runs[0];
        assert_eq!(run.suite_name, "login works");
        assert_eq!(run.status, RunStatus::Passed);
        assert_eq!(run.total, 2);
        assert_eq!(run.passed, 2);
        assert_eq!(run.duration_ms, Some(1500));
        assert_eq!(run.started_at, parse_timestamp("2024-03-01T10:00:00Z"));
        assert_eq!(run.finished_at, parse_timestamp("2024-03-01T10:00:01.500Z"));
        assert_eq!(run.report_json_url.as_deref(), Some("/artifacts/run-1/report.json"));
        assert_eq!(run.stdout_url.as_deref(), Some("/artifacts/run-1/stdout.log"));
        assert_eq!(run.stderr_url, None);
        assert_eq!(run.html_report_url, None);
    }

    #[tokio::test]
    async fn test_huge_duration_has_no_finish_time() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = PathResolver::new(dir.path());
        write_report(
            &resolver,
            "long",
            json!({"stats": {"startTime": "2024-01-01T00:00:00Z", "duration": 1e17, "expected": 1}}),
        );

        let runs = correlator(dir.path()).list_runs().await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].started_at, parse_timestamp("2024-01-01T00:00:00Z"));
        assert_eq!(runs[0].finished_at, None);
    }

    #[tokio::test]
    async fn test_status_marker_and_errors() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = PathResolver::new(dir.path());

        let marked = write_report(&resolver, "marked", passing_report("2024-03-01T10:00:00Z"));
        std::fs::create_dir_all(&marked.test_output_dir).unwrap();
        std::fs::write(marked.last_run_marker(), r#"{"status":"FAILED","failedTests":[]}"#).unwrap();

        write_report(&resolver, "errored", json!({"suites": [], "errors": [{"message": "config broken"}]}));
        write_report(&resolver, "empty", json!({"suites": []}));

        let correlator = correlator(dir.path());
        let status_of = |runs: &[ViewerRun], id: &str| runs.iter().find(|r| r.id == id).map(|r| r.status);
        let runs = correlator.list_runs().await;
        assert_eq!(status_of(&runs, "marked"), Some(RunStatus::Failed));
        assert_eq!(status_of(&runs, "errored"), Some(RunStatus::Failed));
        assert_eq!(status_of(&runs, "empty"), Some(RunStatus::Passed));

        let errored = runs.iter().find(|r| r.id == "errored").unwrap();
        assert_eq!(errored.suite_name, "errored");
        assert_eq!(errored.duration_ms, None);
        assert_eq!(errored.started_at, None);
    }

    #[tokio::test]
    async fn test_run_details() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = PathResolver::new(dir.path());
        let report = json!({
            "stats": {"startTime": Utc::now().to_rfc3339(), "duration": 1000},
            "suites": [{
                "title": "checkout",
                "specs": [{
                    "title": "pays",
                    "tests": [{"status": "unexpected", "results": [{
                        "status": "failed",
                        "error": {"message": "boom"},
                        "attachments": [{"name": "screenshot", "path": "test-results/pays/shot.png", "contentType": "image/png"}]
                    }]}]
                }]
            }]
        });
        let paths = write_report(&resolver, "run-2", report);
        let lines: Vec<String> = (0..50).map(|i| format!("line {}", i)).collect();
        std::fs::write(&paths.stdout, lines.join("\n")).unwrap();
        std::fs::create_dir_all(paths.test_output_dir.join("pays")).unwrap();
        std::fs::write(paths.test_output_dir.join("pays").join("shot.png"), b"png").unwrap();

        let details = correlator(dir.path())
            .get_run_details("run-2", Some(5))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(details.run.status, RunStatus::Failed);
        assert_eq!(details.run.suite_name, "checkout");
        assert_eq!(details.summary.failed, 1);
        assert_eq!(details.failing_tests.len(), 1);
        assert_eq!(details.failing_tests[0].title, "checkout > pays");
        // clamped up to the minimum
        assert_eq!(details.stdout.lines().count(), 20);
        assert!(details.stdout.ends_with("line 49"));
        assert_eq!(details.stderr, "");
        assert_eq!(details.screenshots.len(), 1);
        assert_eq!(
            details.screenshots[0].url.as_deref(),
            Some("/artifacts/run-2/test-results/pays/shot.png")
        );
        assert!(details.agent_context.is_none());
    }

    #[tokio::test]
    async fn test_details_missing_and_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let correlator = correlator(dir.path());

        assert!(correlator.get_run_details("absent", None).await.unwrap().is_none());
        assert!(correlator.get_run_details("../etc", None).await.is_err());
        assert!(correlator.get_run_details("", None).await.is_err());
    }
}
