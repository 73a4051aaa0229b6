//! Caller-facing run operations
//!
//! Validates requests, enforces the single-flight rule at the edge and hands
//! accepted runs to the [`Orchestrator`]. Read operations merge parsed report
//! data with the counts persisted on the run record.

use crate::config::DaemonConfig;
use crate::orchestrator::{Orchestrator, RunRequest};
use crate::suites::{normalize_suite_name, SuiteCatalog};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use testdeck_common::report::TITLE_SEPARATOR;
use testdeck_common::{
    logs, Error, ParsedFailingTest, ParsedReport, ParsedTestCase, PathResolver, ReportParser, ReportSummary,
    Result, Run, RunMode, RunStatus, RunStore, RunUpdate, RuntimeConfig, Target, EXIT_CODE_SPAWN_FAILED,
};
use tracing::{info, warn};
use uuid::Uuid;

pub const DEFAULT_LOG_LINES: usize = 200;
pub const MIN_LOG_LINES: usize = 20;
pub const MAX_LOG_LINES: usize = 2000;

/// Runs returned by [`RunService::list_runs`]
pub const RUN_LIST_LIMIT: usize = 200;

/// Request to start a run
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRunRequest {
    pub target_id: Option<String>,
    pub suite_name: Option<String>,
    pub mode: Option<String>,
    pub slow_mo_ms: Option<i64>,
    /// Rerun only the tests that failed in this run
    pub rerun_failed_only_from_run_id: Option<String>,
}

/// Run record with servable artifact URLs
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunView {
    #[serde(flatten)]
    pub run: Run,
    pub target: Option<Target>,
    pub html_report_url: Option<String>,
    pub stdout_url: Option<String>,
    pub stderr_url: Option<String>,
    pub report_json_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunDetails {
    pub run: RunView,
    pub summary: ReportSummary,
    pub tests: Vec<ParsedTestCase>,
    pub failing_tests: Vec<ParsedFailingTest>,
    pub flaky_tests: Vec<String>,
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunLogs {
    pub run_id: String,
    pub status: RunStatus,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunList {
    pub runs: Vec<RunView>,
    pub runtime: RuntimeConfig,
}

/// Clamp a requested line count, defaulting when absent
pub fn clamp_lines(requested: Option<usize>, default: usize, min: usize, max: usize) -> usize {
    requested.unwrap_or(default).clamp(min, max)
}

/// Escape the characters that are special in the runner's (JavaScript) regex syntax
fn escape_pattern(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(
            c,
            '.' | '*' | '+' | '?' | '^' | '$' | '{' | '}' | '(' | ')' | '|' | '[' | ']' | '\\'
        ) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Alternation over unique, non-empty titles; None when there is nothing to rerun
pub fn build_failed_only_pattern<S: AsRef<str>>(titles: &[S]) -> Option<String> {
    let mut seen = BTreeSet::new();
    let unique: Vec<String> = titles
        .iter()
        .map(|t| t.as_ref().trim())
        .filter(|t| !t.is_empty())
        .filter(|t| seen.insert(t.to_string()))
        .map(escape_pattern)
        .collect();

    if unique.is_empty() {
        None
    } else {
        Some(format!("({})", unique.join("|")))
    }
}

/// Last segment of a composed test title
pub fn leaf_title(title: &str) -> &str {
    title.rsplit(TITLE_SEPARATOR).next().unwrap_or(title).trim()
}

/// Run service backed by a store and the orchestrator
#[derive(Clone)]
pub struct RunService {
    store: Arc<dyn RunStore>,
    orchestrator: Orchestrator,
    suites: SuiteCatalog,
    resolver: PathResolver,
    parser: ReportParser,
    runtime: RuntimeConfig,
}

impl RunService {
    pub fn new(config: &DaemonConfig, store: Arc<dyn RunStore>) -> Self {
        let resolver = config.resolver();
        let orchestrator = Orchestrator::new(store.clone(), resolver.clone(), config.runner.clone());
        Self {
            store,
            orchestrator,
            suites: SuiteCatalog::new(config.tests_dir()),
            parser: ReportParser::new(resolver.clone()),
            resolver,
            runtime: config.runtime(),
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn runtime(&self) -> RuntimeConfig {
        self.runtime
    }

    /// Validate and start a run
    pub async fn start(&self, request: StartRunRequest) -> Result<Run> {
        let mut suite_name = normalize_suite_name(request.suite_name.as_deref().unwrap_or_default());
        let mut target_id = request.target_id.as_deref().unwrap_or_default().trim().to_string();
        let mode = RunMode::parse_lenient(request.mode.as_deref());
        let slow_mo_ms = request.slow_mo_ms.unwrap_or(0).max(0) as u64;

        let mut grep = None;
        if let Some(source_id) = request
            .rerun_failed_only_from_run_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
        {
            let (source, pattern) = self.failed_only_source(source_id).await?;
            if target_id.is_empty() {
                target_id = source.target_id;
            }
            if suite_name.is_empty() {
                suite_name = normalize_suite_name(&source.suite_name);
            }
            grep = Some(pattern);
        }

        if target_id.is_empty() || suite_name.is_empty() {
            return Err(Error::Validation("targetId and suiteName are required".to_string()));
        }
        let Some(suite_hash) = self.suites.find_suite(&suite_name).await? else {
            return Err(Error::Validation(format!("suite '{}' was not found", suite_name)));
        };
        let target = self
            .store
            .get_target(&target_id)?
            .ok_or_else(|| Error::not_found("target", &target_id))?;

        self.orchestrator.reconcile_stale_running_runs()?;
        self.ensure_idle()?;

        let run_id = Uuid::new_v4().to_string();
        let paths = self.resolver.paths_for(&run_id)?;

        let mut run = Run::running(&run_id, &target.id, &suite_name, mode, slow_mo_ms);
        run.suite_hash = suite_hash;
        run.stdout_path = Some(self.resolver.to_stored_path(&paths.stdout));
        run.stderr_path = Some(self.resolver.to_stored_path(&paths.stderr));
        run.report_json_path = Some(self.resolver.to_stored_path(&paths.report));
        run.html_report_path = Some(self.resolver.to_stored_path(&paths.html_report_index()));
        run.artifacts_dir = Some(self.resolver.to_stored_path(&paths.run_dir));
        self.store.create_run(&run)?;

        info!("Created run {} for suite {} on target {}", run_id, suite_name, target.name);

        let request = RunRequest {
            run_id: run_id.clone(),
            suite_name,
            base_url: target.base_url,
            mode,
            slow_mo_ms,
            timeout: Duration::from_millis(self.runtime.run_timeout_ms),
            grep,
        };

        if let Err(e) = self.orchestrator.start_run(request).await {
            warn!("Run {} could not be started: {}", run_id, e);
            if let Err(update_err) = self.store.update_run(&run_id, &RunUpdate::failed(EXIT_CODE_SPAWN_FAILED)) {
                warn!("Failed to mark run {} as failed: {}", run_id, update_err);
            }
            return Err(e);
        }

        Ok(self.store.get_run(&run_id)?.unwrap_or(run))
    }

    fn ensure_idle(&self) -> Result<()> {
        if let Some(active_run_id) = self.orchestrator.active_run_id() {
            return Err(Error::Concurrency { active_run_id });
        }
        if self.store.count_by_status(RunStatus::Running)? > 0 {
            let active_run_id = self
                .store
                .list_run_ids_with_status(RunStatus::Running)?
                .into_iter()
                .next()
                .unwrap_or_default();
            return Err(Error::Concurrency { active_run_id });
        }
        Ok(())
    }

    async fn failed_only_source(&self, source_id: &str) -> Result<(Run, String)> {
        let source = self
            .store
            .get_run(source_id)?
            .ok_or_else(|| Error::Validation(format!("source run '{}' was not found", source_id)))?;

        let report = self
            .load_report(&source)
            .await
            .ok_or_else(|| Error::Validation(format!("source run '{}' has no report", source_id)))?;

        let titles: Vec<&str> = report.failing_tests.iter().map(|t| leaf_title(&t.title)).collect();
        let pattern = build_failed_only_pattern(titles.as_slice())
            .ok_or_else(|| Error::Validation(format!("source run '{}' has no failing tests", source_id)))?;

        Ok((source, pattern))
    }

    /// Request cancellation; false when the run is not active
    pub fn cancel(&self, run_id: &str) -> bool {
        self.orchestrator.cancel_run(run_id)
    }

    pub async fn get_run(&self, run_id: &str) -> Result<RunDetails> {
        let run = self
            .store
            .get_run(run_id)?
            .ok_or_else(|| Error::not_found("run", run_id))?;
        let report = self.load_report(&run).await;

        let summary = report
            .as_ref()
            .map(|r| r.summary)
            .unwrap_or_else(|| run.persisted_summary());
        let (tests, failing_tests, flaky_tests) = match report {
            Some(ParsedReport {
                tests,
                failing_tests,
                flaky_tests,
                ..
            }) => (tests, failing_tests, flaky_tests),
            None => Default::default(),
        };

        Ok(RunDetails {
            run: self.view(run)?,
            summary,
            tests,
            failing_tests,
            flaky_tests,
            runtime: self.runtime,
        })
    }

    pub async fn tail_logs(&self, run_id: &str, lines: Option<usize>) -> Result<RunLogs> {
        let run = self
            .store
            .get_run(run_id)?
            .ok_or_else(|| Error::not_found("run", run_id))?;
        let lines = clamp_lines(lines, DEFAULT_LOG_LINES, MIN_LOG_LINES, MAX_LOG_LINES);

        let stdout = match self.resolver.from_stored_path(run.stdout_path.as_deref()) {
            Some(path) => logs::tail_file(&path, lines).await,
            None => String::new(),
        };
        let stderr = match self.resolver.from_stored_path(run.stderr_path.as_deref()) {
            Some(path) => logs::tail_file(&path, lines).await,
            None => String::new(),
        };

        Ok(RunLogs {
            run_id: run.id,
            status: run.status,
            stdout,
            stderr,
        })
    }

    pub fn list_runs(&self) -> Result<RunList> {
        let runs = self
            .store
            .list_runs(RUN_LIST_LIMIT)?
            .into_iter()
            .map(|run| self.view(run))
            .collect::<Result<Vec<_>>>()?;
        Ok(RunList {
            runs,
            runtime: self.runtime,
        })
    }

    pub async fn list_suites(&self) -> Result<Vec<String>> {
        self.suites.list_suites_blocking().await
    }

    pub fn list_targets(&self) -> Result<Vec<Target>> {
        self.store.list_targets()
    }

    pub fn create_target(&self, name: &str, base_url: &str) -> Result<Target> {
        let (name, base_url) = validate_target_fields(name, base_url)?;
        let target = Target::new(name, base_url);
        self.store.create_target(&target)?;
        info!("Created target {} ({})", target.name, target.id);
        Ok(target)
    }

    pub fn update_target(&self, id: &str, name: &str, base_url: &str) -> Result<Target> {
        let (name, base_url) = validate_target_fields(name, base_url)?;
        self.store
            .update_target(id, name, base_url)?
            .ok_or_else(|| Error::not_found("target", id))
    }

    pub fn delete_target(&self, id: &str) -> Result<()> {
        if !self.store.delete_target(id)? {
            return Err(Error::not_found("target", id));
        }
        Ok(())
    }

    async fn load_report(&self, run: &Run) -> Option<ParsedReport> {
        let path = self.resolver.from_stored_path(run.report_json_path.as_deref())?;
        self.parser.parse_file(&path).await
    }

    fn view(&self, run: Run) -> Result<RunView> {
        let target = self.store.get_target(&run.target_id)?;
        Ok(RunView {
            html_report_url: self.resolver.stored_artifacts_url(run.html_report_path.as_deref()),
            stdout_url: self.resolver.stored_artifacts_url(run.stdout_path.as_deref()),
            stderr_url: self.resolver.stored_artifacts_url(run.stderr_path.as_deref()),
            report_json_url: self.resolver.stored_artifacts_url(run.report_json_path.as_deref()),
            target,
            run,
        })
    }
}

/// Trimmed name and base URL; both required and the URL must parse
fn validate_target_fields<'a>(name: &'a str, base_url: &'a str) -> Result<(&'a str, &'a str)> {
    let name = name.trim();
    let base_url = base_url.trim();
    if name.is_empty() || base_url.is_empty() {
        return Err(Error::Validation("name and baseUrl are required".to_string()));
    }
    if let Err(e) = url::Url::parse(base_url) {
        return Err(Error::Validation(format!("baseUrl must be a valid URL: {}", e)));
    }
    Ok((name, base_url))
}
