//! Daemon configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use testdeck_common::{PathResolver, RuntimeConfig};
use testdeck_viewer::CorrelatorConfig;
use tracing::warn;

/// Default wall-clock limit for one run (15 minutes)
pub const DEFAULT_RUN_TIMEOUT_MS: u64 = 15 * 60 * 1000;

/// Delay between the termination signal and the forced kill
pub const DEFAULT_GRACE_PERIOD_MS: u64 = 5000;

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Workspace holding the tests, specs and artifacts directories
    pub workspace_root: PathBuf,

    /// SQLite database path; defaults under `<workspace>/.testdeck`
    pub database_path: Option<PathBuf>,

    /// Test runner configuration
    pub runner: RunnerConfig,

    /// Artifact viewer configuration
    pub viewer: CorrelatorConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            database_path: None,
            runner: RunnerConfig::default(),
            viewer: CorrelatorConfig::default(),
        }
    }
}

/// External test runner invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Runner executable
    pub program: String,

    /// Leading arguments, before the suite path
    pub args: Vec<String>,

    /// Suites directory, relative to the workspace
    pub tests_dir: PathBuf,

    /// Runner config file, relative to the workspace
    pub config_path: PathBuf,

    pub timeout_ms: u64,

    pub grace_period_ms: u64,

    /// Retry count handed to the runner
    pub retries: u32,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            program: "npx".to_string(),
            args: vec!["playwright".to_string(), "test".to_string()],
            tests_dir: PathBuf::from("playwright/tests"),
            config_path: PathBuf::from("playwright/playwright.config.ts"),
            timeout_ms: DEFAULT_RUN_TIMEOUT_MS,
            grace_period_ms: DEFAULT_GRACE_PERIOD_MS,
            retries: 0,
        }
    }
}

impl DaemonConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply `RUN_TIMEOUT_MS` and `RETRIES` from the process environment
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup; invalid values are ignored
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(raw) = lookup("RUN_TIMEOUT_MS") {
            match raw.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => self.runner.timeout_ms = ms,
                _ => warn!("Ignoring invalid RUN_TIMEOUT_MS: {:?}", raw),
            }
        }

        if let Some(raw) = lookup("RETRIES") {
            match raw.trim().parse::<u32>() {
                Ok(retries) => self.runner.retries = retries,
                Err(_) => warn!("Ignoring invalid RETRIES: {:?}", raw),
            }
        }
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.workspace_root.join(".testdeck").join("state.db"))
    }

    /// Get the artifact path resolver
    pub fn resolver(&self) -> PathResolver {
        PathResolver::new(&self.workspace_root)
    }

    /// Get the suites directory
    pub fn tests_dir(&self) -> PathBuf {
        self.workspace_root.join(&self.runner.tests_dir)
    }

    pub fn runtime(&self) -> RuntimeConfig {
        RuntimeConfig {
            run_timeout_ms: self.runner.timeout_ms,
            retries: self.runner.retries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.runner.timeout_ms, 900_000);
        assert_eq!(config.runner.grace_period_ms, 5000);
        assert_eq!(config.runner.retries, 0);
        assert_eq!(config.db_path(), PathBuf::from("./.testdeck/state.db"));
        assert_eq!(config.tests_dir(), PathBuf::from("./playwright/tests"));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [("RUN_TIMEOUT_MS", "60000"), ("RETRIES", "2")].into();
        let mut config = DaemonConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.runtime(), RuntimeConfig { run_timeout_ms: 60_000, retries: 2 });

        for (timeout, retries) in [("0", "-1"), ("abc", "1.5"), ("-5", "x")] {
            let env: HashMap<&str, &str> = [("RUN_TIMEOUT_MS", timeout), ("RETRIES", retries)].into();
            let mut config = DaemonConfig::default();
            config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));
            assert_eq!(config.runner.timeout_ms, DEFAULT_RUN_TIMEOUT_MS);
            assert_eq!(config.runner.retries, 0);
        }
    }

    #[test]
    fn test_load_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("testdeck.toml");

        let missing = DaemonConfig::load(&path).unwrap();
        assert_eq!(missing.runner, RunnerConfig::default());

        let mut config = DaemonConfig::default();
        config.workspace_root = dir.path().to_path_buf();
        config.runner.program = "sh".to_string();
        config.runner.grace_period_ms = 100;
        config.viewer.manual_run_id = "manual".to_string();
        config.save(&path).unwrap();

        let loaded = DaemonConfig::load(&path).unwrap();
        assert_eq!(loaded.workspace_root, dir.path());
        assert_eq!(loaded.runner.program, "sh");
        assert_eq!(loaded.runner.grace_period_ms, 100);
        assert_eq!(loaded.viewer.manual_run_id, "manual");
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: DaemonConfig = toml::from_str("[runner]\ntimeout_ms = 1000\n").unwrap();
        assert_eq!(config.runner.timeout_ms, 1000);
        assert_eq!(config.runner.program, "npx");
        assert_eq!(config.viewer, CorrelatorConfig::default());
    }
}
