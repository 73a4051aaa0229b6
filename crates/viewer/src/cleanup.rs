//! Removal of agent-generated workspace files
//!
//! Request and plan documents pile up in the specs directory, and the
//! generator agent leaves spec files in the tests directory. Both are found by
//! name or by the marker comments the generator writes.

use crate::agents::{PLAN_PREFIX, REQUEST_PREFIX};
use crate::config::CorrelatorConfig;
use serde::Serialize;
use std::path::{Path, PathBuf};
use testdeck_common::{Error, PathResolver, Result};
use tracing::{debug, info};

/// Seed suite the generator starts from; never removed
pub const SEED_SUITE: &str = "seed.spec.ts";

const SPEC_MARKER: &str = "// spec: specs/";
const SEED_MARKER: &str = "// seed: playwright/tests/seed.spec.ts";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CleanupReason {
    GeneratedSpecMarkdown,
    GeneratedAgentTest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupItem {
    pub relative_path: String,
    pub reason: CleanupReason,
    #[serde(skip)]
    path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupOptions {
    pub dry_run: bool,
    pub include_generated_tests: bool,
}

impl Default for CleanupOptions {
    fn default() -> Self {
        Self {
            dry_run: true,
            include_generated_tests: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub dry_run: bool,
    pub include_generated_tests: bool,
    pub total: usize,
    pub files: Vec<CleanupItem>,
}

fn files_with_suffix(dir: &Path, suffix: &str) -> Vec<PathBuf> {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.file_name().to_string_lossy().ends_with(suffix))
        .map(|e| e.into_path())
        .collect()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn spec_markdowns(resolver: &PathResolver, specs_dir: &Path) -> Vec<CleanupItem> {
    files_with_suffix(specs_dir, ".md")
        .into_iter()
        .filter(|path| {
            let name = file_name(path);
            name.starts_with(REQUEST_PREFIX) || name.starts_with(PLAN_PREFIX)
        })
        .map(|path| CleanupItem {
            relative_path: resolver.to_stored_path(&path),
            reason: CleanupReason::GeneratedSpecMarkdown,
            path,
        })
        .collect()
}

/// True when the content carries both generator markers
pub fn is_generated_test(content: &str) -> bool {
    content.contains(SPEC_MARKER) && content.contains(SEED_MARKER)
}

fn generated_tests(resolver: &PathResolver, tests_dir: &Path) -> Vec<CleanupItem> {
    files_with_suffix(tests_dir, ".spec.ts")
        .into_iter()
        .filter(|path| file_name(path) != SEED_SUITE)
        .filter(|path| match std::fs::read_to_string(path) {
            Ok(content) => is_generated_test(&content),
            Err(e) => {
                debug!("Skipping unreadable suite {:?}: {}", path, e);
                false
            }
        })
        .map(|path| CleanupItem {
            relative_path: resolver.to_stored_path(&path),
            reason: CleanupReason::GeneratedAgentTest,
            path,
        })
        .collect()
}

/// List, and unless `dry_run` is set delete, the generated files
///
/// `tests_dir` is absolute; the specs directory comes from `config`.
pub async fn cleanup_generated_files(
    resolver: &PathResolver,
    config: &CorrelatorConfig,
    tests_dir: &Path,
    options: CleanupOptions,
) -> Result<CleanupReport> {
    let scan_resolver = resolver.clone();
    let specs_dir = resolver.workspace_root().join(&config.specs_dir);
    let tests_dir = tests_dir.to_path_buf();

    let mut files = tokio::task::spawn_blocking(move || {
        let mut files = spec_markdowns(&scan_resolver, &specs_dir);
        if options.include_generated_tests {
            files.extend(generated_tests(&scan_resolver, &tests_dir));
        }
        files
    })
    .await
    .map_err(|e| Error::Internal(format!("cleanup scan failed: {}", e)))?;
    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

    if !options.dry_run {
        for item in &files {
            tokio::fs::remove_file(&item.path).await?;
        }
        info!("Removed {} generated file(s)", files.len());
    }

    Ok(CleanupReport {
        dry_run: options.dry_run,
        include_generated_tests: options.include_generated_tests,
        total: files.len(),
        files,
    })
}
