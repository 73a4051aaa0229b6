//! Correlator configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Artifact viewer settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelatorConfig {
    /// Markdown request/plan documents, relative to the workspace
    pub specs_dir: PathBuf,

    /// Pseudo run id that also picks up manually captured screenshots
    pub manual_run_id: String,

    /// Shared manual screenshot directory, relative to the workspace
    pub manual_screenshots_dir: PathBuf,

    /// Padding around the run window when matching screenshots
    pub screenshot_padding_secs: u64,

    /// Maximum distance between a run and the agent record matched to it
    pub agent_window_secs: u64,

    /// Scenario input is cut after this many characters
    pub max_scenario_chars: usize,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            specs_dir: PathBuf::from("specs"),
            manual_run_id: "manual_run".to_string(),
            manual_screenshots_dir: PathBuf::from("playwright/tests/screenshots"),
            screenshot_padding_secs: 10 * 60,
            agent_window_secs: 24 * 60 * 60,
            max_scenario_chars: 9000,
        }
    }
}

impl CorrelatorConfig {
    pub fn screenshot_padding(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.screenshot_padding_secs as i64)
    }

    pub fn agent_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.agent_window_secs as i64)
    }

    /// Directory of agent run records, relative to the workspace
    pub fn agent_runs_dir(&self) -> PathBuf {
        self.specs_dir.join("agent-runs")
    }
}
