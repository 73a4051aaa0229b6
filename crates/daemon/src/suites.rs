//! Suite catalog
//!
//! Suites are spec files under the runner's tests directory, named by their
//! `/`-separated path relative to it.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use testdeck_common::paths::{normalize_lexically, to_posix};
use testdeck_common::{Error, Result};

const SUITE_EXTENSIONS: &[&str] = &[".spec.ts", ".spec.tsx", ".spec.js", ".spec.jsx"];

/// Suite files available to the runner
#[derive(Debug, Clone)]
pub struct SuiteCatalog {
    tests_dir: PathBuf,
}

impl SuiteCatalog {
    pub fn new(tests_dir: impl Into<PathBuf>) -> Self {
        Self {
            tests_dir: tests_dir.into(),
        }
    }

    /// Sorted suite names
    pub fn list_suites(&self) -> Vec<String> {
        let mut suites: Vec<String> = walkdir::WalkDir::new(&self.tests_dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| is_suite_file(e.path()))
            .filter_map(|e| {
                e.path()
                    .strip_prefix(&self.tests_dir)
                    .ok()
                    .map(to_posix)
            })
            .collect();
        suites.sort();
        suites
    }

    pub fn suite_exists(&self, name: &str) -> bool {
        let name = normalize_suite_name(name);
        !name.is_empty() && self.list_suites().iter().any(|s| *s == name)
    }

    /// Absolute path of a suite; None when it would escape the tests directory
    pub fn resolve_suite_path(&self, name: &str) -> Option<PathBuf> {
        let name = normalize_suite_name(name);
        if name.is_empty() {
            return None;
        }
        let root = normalize_lexically(&self.tests_dir);
        let resolved = normalize_lexically(&root.join(&name));
        match resolved.strip_prefix(&root) {
            Ok(relative) if !relative.as_os_str().is_empty() => Some(resolved),
            _ => None,
        }
    }

    /// SHA-256 of the suite file, hex encoded; None when unreadable
    pub fn suite_hash(&self, name: &str) -> Option<String> {
        let path = self.resolve_suite_path(name)?;
        let content = std::fs::read(path).ok()?;

        let mut hasher = Sha256::new();
        hasher.update(&content);
        Some(hex::encode(hasher.finalize()))
    }

    /// [`list_suites`](Self::list_suites) on the blocking pool
    pub async fn list_suites_blocking(&self) -> Result<Vec<String>> {
        let catalog = self.clone();
        tokio::task::spawn_blocking(move || catalog.list_suites())
            .await
            .map_err(|e| Error::Internal(format!("suite scan failed: {}", e)))
    }

    /// Content hash of a catalogued suite, computed on the blocking pool.
    /// Outer None when the suite is not in the catalog.
    pub async fn find_suite(&self, name: &str) -> Result<Option<Option<String>>> {
        let catalog = self.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || {
            catalog
                .suite_exists(&name)
                .then(|| catalog.suite_hash(&name))
        })
        .await
        .map_err(|e| Error::Internal(format!("suite scan failed: {}", e)))
    }
}

/// Trim and strip leading `/` from a caller-supplied suite name
pub fn normalize_suite_name(name: &str) -> String {
    name.trim().trim_start_matches('/').trim().to_string()
}

fn is_suite_file(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    SUITE_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
}
