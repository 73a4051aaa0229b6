//! Agent automation records
//!
//! The planner/generator/healer agents each leave an immutable JSON record
//! under `<specs>/agent-runs/`, and write request and plan markdown documents
//! into the specs directory itself. Neither carries a run id, so they are
//! matched to runs by time (see [`crate::correlate`]).

use crate::config::CorrelatorConfig;
use crate::correlate::{best_agent_record, latest_spec_file, parse_scenario_input, parse_timestamp};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use testdeck_common::PathResolver;
use tracing::debug;

pub const REQUEST_PREFIX: &str = "request_";
pub const PLAN_PREFIX: &str = "test-plan_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentPhase {
    Planner,
    Generator,
    Healer,
}

/// One recorded agent invocation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub phase: AgentPhase,
    pub created_at: DateTime<Utc>,
    pub ok: bool,
    pub exit_code: i64,
    pub command: String,
    pub request_file: Option<String>,
    pub plan_file: Option<String>,
    pub output_plan_file: Option<String>,
    /// Workspace-relative path of the record itself
    pub record_file: String,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentRecordFile {
    created_at: Option<String>,
    phase: Option<AgentPhase>,
    request_file: Option<String>,
    plan_file: Option<String>,
    output_plan_file: Option<String>,
    command: Option<String>,
    exit_code: Option<Value>,
    ok: Option<bool>,
    stdout: Option<String>,
    stderr: Option<String>,
}

impl AgentRecordFile {
    fn into_record(self, record_file: String) -> Option<AgentRecord> {
        let phase = self.phase?;
        let created_at = parse_timestamp(self.created_at.as_deref()?)?;
        let command = self.command.filter(|c| !c.is_empty())?;

        Some(AgentRecord {
            phase,
            created_at,
            ok: self.ok.unwrap_or(false),
            exit_code: self.exit_code.as_ref().and_then(Value::as_i64).unwrap_or(1),
            command,
            request_file: self.request_file,
            plan_file: self.plan_file,
            output_plan_file: self.output_plan_file,
            record_file,
            stdout: self.stdout.unwrap_or_default(),
            stderr: self.stderr.unwrap_or_default(),
        })
    }
}

/// A request or plan markdown document in the specs directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecFile {
    pub relative_path: String,
    pub modified: DateTime<Utc>,
}

/// Agent evidence associated with one run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentContext {
    pub request_file: Option<String>,
    pub plan_file: Option<String>,
    /// Scenario input extracted from the request document
    pub input_task: Option<String>,
    pub planner: Option<AgentRecord>,
    pub generator: Option<AgentRecord>,
    pub healer: Option<AgentRecord>,
}

/// All well-formed agent records, newest first
pub async fn read_agent_records(resolver: &PathResolver, agent_runs_dir: &Path) -> Vec<AgentRecord> {
    let mut entries = match tokio::fs::read_dir(agent_runs_dir).await {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };

    let mut records = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
        if !is_file || path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }

        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) => {
                debug!("Unreadable agent record {:?}: {}", path, e);
                continue;
            }
        };
        let file: AgentRecordFile = match serde_json::from_str(&raw) {
            Ok(file) => file,
            Err(e) => {
                debug!("Malformed agent record {:?}: {}", path, e);
                continue;
            }
        };

        if let Some(record) = file.into_record(resolver.to_stored_path(&path)) {
            records.push(record);
        }
    }

    records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    records
}

/// Markdown files in `specs_dir` named `<prefix>*.md`
pub async fn list_spec_files(resolver: &PathResolver, specs_dir: &Path, prefix: &str) -> Vec<SpecFile> {
    let mut entries = match tokio::fs::read_dir(specs_dir).await {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };

    let mut files = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(prefix) || !name.ends_with(".md") {
            continue;
        }
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        files.push(SpecFile {
            relative_path: resolver.to_stored_path(&entry.path()),
            modified: DateTime::<Utc>::from(modified),
        });
    }
    files
}

/// Correlate agent records and spec documents with a run started at `anchor`
///
/// Returns None when no record, document or scenario input was found.
pub async fn build_agent_context(
    resolver: &PathResolver,
    config: &CorrelatorConfig,
    anchor: Option<DateTime<Utc>>,
) -> Option<AgentContext> {
    let specs_dir = resolver.workspace_root().join(&config.specs_dir);
    let agent_runs_dir = resolver.workspace_root().join(config.agent_runs_dir());
    let window = config.agent_window();

    let records = read_agent_records(resolver, &agent_runs_dir).await;
    let planner = best_agent_record(&records, AgentPhase::Planner, anchor, window).cloned();
    let generator = best_agent_record(&records, AgentPhase::Generator, anchor, window).cloned();
    let healer = best_agent_record(&records, AgentPhase::Healer, anchor, window).cloned();

    let request_file = match planner
        .as_ref()
        .and_then(|r| r.request_file.clone())
        .or_else(|| generator.as_ref().and_then(|r| r.request_file.clone()))
    {
        Some(file) => Some(file),
        None => {
            let files = list_spec_files(resolver, &specs_dir, REQUEST_PREFIX).await;
            latest_spec_file(&files, anchor, window).map(|f| f.relative_path.clone())
        }
    };

    let plan_file = match planner
        .as_ref()
        .and_then(|r| r.output_plan_file.clone())
        .or_else(|| generator.as_ref().and_then(|r| r.plan_file.clone()))
    {
        Some(file) => Some(file),
        None => {
            let files = list_spec_files(resolver, &specs_dir, PLAN_PREFIX).await;
            latest_spec_file(&files, anchor, window).map(|f| f.relative_path.clone())
        }
    };

    let mut input_task = None;
    if let Some(path) = request_file
        .as_deref()
        .and_then(|f| resolver.resolve_under(&config.specs_dir, f))
    {
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => input_task = parse_scenario_input(&content, config.max_scenario_chars),
            Err(e) => debug!("Unreadable request document {:?}: {}", path, e),
        }
    }

    if planner.is_none()
        && generator.is_none()
        && healer.is_none()
        && request_file.is_none()
        && plan_file.is_none()
        && input_task.is_none()
    {
        return None;
    }

    Some(AgentContext {
        request_file,
        plan_file,
        input_task,
        planner,
        generator,
        healer,
    })
}
