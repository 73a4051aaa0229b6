//! Artifact path resolution
//!
//! Every run owns one directory under the artifacts root. Run ids may come
//! from callers, so [`PathResolver::paths_for`] refuses anything that is not a
//! single plain path component.

use crate::{Error, Result};
use serde::Serialize;
use std::path::{Component, Path, PathBuf};

/// Name of the artifacts root under the workspace
pub const ARTIFACTS_DIR_NAME: &str = "artifacts";

/// Deterministic set of files produced by one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunPaths {
    pub run_dir: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    pub report: PathBuf,
    pub html_report_dir: PathBuf,
    pub test_output_dir: PathBuf,
}

impl RunPaths {
    /// Entry page of the HTML report
    pub fn html_report_index(&self) -> PathBuf {
        self.html_report_dir.join("index.html")
    }

    /// Marker the runner writes when it completes
    pub fn last_run_marker(&self) -> PathBuf {
        self.test_output_dir.join(".last-run.json")
    }
}

/// Maps run ids to artifact paths and artifact paths to servable URLs
#[derive(Debug, Clone)]
pub struct PathResolver {
    workspace_root: PathBuf,
    artifacts_root: PathBuf,
}

impl PathResolver {
    /// Resolver with the artifacts root at `<workspace>/artifacts`
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        let workspace_root = normalize_lexically(&workspace_root.into());
        let artifacts_root = workspace_root.join(ARTIFACTS_DIR_NAME);
        Self {
            workspace_root,
            artifacts_root,
        }
    }

    pub fn with_artifacts_root(workspace_root: impl Into<PathBuf>, artifacts_root: impl Into<PathBuf>) -> Self {
        let workspace_root = normalize_lexically(&workspace_root.into());
        let artifacts_root = normalize_lexically(&workspace_root.join(artifacts_root.into()));
        Self {
            workspace_root,
            artifacts_root,
        }
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn artifacts_root(&self) -> &Path {
        &self.artifacts_root
    }

    /// Resolve the artifact paths of a run, rejecting ids that would escape the root
    pub fn paths_for(&self, run_id: &str) -> Result<RunPaths> {
        let run_dir = self.run_dir(run_id)?;

        Ok(RunPaths {
            stdout: run_dir.join("stdout.log"),
            stderr: run_dir.join("stderr.log"),
            report: run_dir.join("report.json"),
            html_report_dir: run_dir.join("html-report"),
            test_output_dir: run_dir.join("test-results"),
            run_dir,
        })
    }

    /// Directory of a run under the artifacts root
    pub fn run_dir(&self, run_id: &str) -> Result<PathBuf> {
        if !is_single_component(run_id) {
            return Err(Error::InvalidRunId(run_id.to_string()));
        }
        Ok(self.artifacts_root.join(run_id))
    }

    /// Workspace-relative, `/`-separated form used in persisted records
    pub fn to_stored_path(&self, path: &Path) -> String {
        let normalized = normalize_lexically(&self.absolutize(path));
        match normalized.strip_prefix(&self.workspace_root) {
            Ok(relative) => to_posix(relative),
            Err(_) => to_posix(&normalized),
        }
    }

    pub fn from_stored_path(&self, stored: Option<&str>) -> Option<PathBuf> {
        let stored = stored?.trim();
        if stored.is_empty() {
            return None;
        }
        Some(self.absolutize(Path::new(stored)))
    }

    /// URL for a stored path, only when it lives under `artifacts/`
    pub fn stored_artifacts_url(&self, stored: Option<&str>) -> Option<String> {
        let stored = stored?;
        let normalized = stored.strip_prefix("./").unwrap_or(stored);
        if !normalized.starts_with(&format!("{}/", ARTIFACTS_DIR_NAME)) {
            return None;
        }
        Some(format!("/{}", normalized))
    }

    /// `/artifacts/...` URL, or None when the path resolves outside the artifacts root
    pub fn artifact_url(&self, path: &Path) -> Option<String> {
        let relative = relative_inside(&self.artifacts_root, &self.absolutize(path))?;
        Some(format!("/artifacts/{}", to_posix(&relative)))
    }

    /// `/workspace-files/...` URL, or None outside the workspace
    pub fn workspace_file_url(&self, path: &Path) -> Option<String> {
        let relative = relative_inside(&self.workspace_root, &self.absolutize(path))?;
        Some(format!("/workspace-files/{}", to_posix(&relative)))
    }

    /// Artifact URL when possible, else workspace file URL
    pub fn viewer_file_url(&self, path: &Path) -> Option<String> {
        self.artifact_url(path).or_else(|| self.workspace_file_url(path))
    }

    /// Resolve `relative` under `root` (itself relative to the workspace),
    /// returning None when the result escapes it
    pub fn resolve_under(&self, root: &Path, relative: &str) -> Option<PathBuf> {
        let relative = relative.trim();
        if relative.is_empty() {
            return None;
        }
        let root = normalize_lexically(&self.absolutize(root));
        let resolved = normalize_lexically(&self.absolutize(Path::new(relative)));
        relative_inside(&root, &resolved).map(|_| resolved)
    }

    fn absolutize(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        }
    }
}

fn is_single_component(value: &str) -> bool {
    if value.trim().is_empty() || value.contains('/') || value.contains('\\') {
        return false;
    }
    let mut components = Path::new(value).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Relative path of `path` inside `root`; None when equal to or outside it
fn relative_inside(root: &Path, path: &Path) -> Option<PathBuf> {
    let normalized = normalize_lexically(path);
    let relative = normalized.strip_prefix(root).ok()?;
    if relative.as_os_str().is_empty() {
        return None;
    }
    Some(relative.to_path_buf())
}

/// Resolve `.` and `..` without touching the filesystem
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// `/`-separated rendering of a path
pub fn to_posix(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            Component::RootDir => Some(String::new()),
            Component::ParentDir => Some("..".to_string()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> PathResolver {
        PathResolver::new("/srv/deck")
    }

    #[test]
    fn test_paths_for_is_deterministic() {
        let paths = resolver().paths_for("run-42").unwrap();
        assert_eq!(paths.run_dir, PathBuf::from("/srv/deck/artifacts/run-42"));
        assert_eq!(paths.stdout, PathBuf::from("/srv/deck/artifacts/run-42/stdout.log"));
        assert_eq!(paths.stderr, PathBuf::from("/srv/deck/artifacts/run-42/stderr.log"));
        assert_eq!(paths.report, PathBuf::from("/srv/deck/artifacts/run-42/report.json"));
        assert_eq!(paths.html_report_dir, PathBuf::from("/srv/deck/artifacts/run-42/html-report"));
        assert_eq!(paths.test_output_dir, PathBuf::from("/srv/deck/artifacts/run-42/test-results"));
        assert_eq!(
            paths.last_run_marker(),
            PathBuf::from("/srv/deck/artifacts/run-42/test-results/.last-run.json")
        );
        assert_eq!(paths, resolver().paths_for("run-42").unwrap());
    }

    #[test]
    fn test_paths_for_rejects_traversal() {
        let resolver = resolver();
        for bad in ["", " ", ".", "..", "../etc", "a/b", "a\\b", "/abs", "run/../.."] {
            assert!(
                matches!(resolver.paths_for(bad), Err(Error::InvalidRunId(_))),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_stored_path_round_trip() {
        let resolver = resolver();
        let paths = resolver.paths_for("r1").unwrap();
        let stored = resolver.to_stored_path(&paths.report);
        assert_eq!(stored, "artifacts/r1/report.json");
        assert_eq!(resolver.from_stored_path(Some(&stored)), Some(paths.report));
        assert_eq!(resolver.from_stored_path(Some("")), None);
        assert_eq!(resolver.from_stored_path(None), None);
        assert_eq!(
            resolver.from_stored_path(Some("/tmp/elsewhere.json")),
            Some(PathBuf::from("/tmp/elsewhere.json"))
        );
    }

    #[test]
    fn test_stored_artifacts_url() {
        let resolver = resolver();
        assert_eq!(
            resolver.stored_artifacts_url(Some("artifacts/r1/html-report/index.html")),
            Some("/artifacts/r1/html-report/index.html".to_string())
        );
        assert_eq!(
            resolver.stored_artifacts_url(Some("./artifacts/r1/stdout.log")),
            Some("/artifacts/r1/stdout.log".to_string())
        );
        assert_eq!(resolver.stored_artifacts_url(Some("specs/plan.md")), None);
        assert_eq!(resolver.stored_artifacts_url(None), None);
    }

    #[test]
    fn test_artifact_url_boundary() {
        let resolver = resolver();
        assert_eq!(
            resolver.artifact_url(Path::new("/srv/deck/artifacts/r1/test-results/trace.zip")),
            Some("/artifacts/r1/test-results/trace.zip".to_string())
        );
        assert_eq!(
            resolver.artifact_url(Path::new("artifacts/r1/shot.png")),
            Some("/artifacts/r1/shot.png".to_string())
        );
        assert_eq!(resolver.artifact_url(Path::new("/srv/deck/artifacts/../secrets.txt")), None);
        assert_eq!(resolver.artifact_url(Path::new("/tmp/shot.png")), None);
        assert_eq!(resolver.artifact_url(Path::new("/srv/deck/artifacts")), None);
    }

    #[test]
    fn test_viewer_file_url_falls_back_to_workspace() {
        let resolver = resolver();
        assert_eq!(
            resolver.viewer_file_url(Path::new("/srv/deck/playwright/tests/screenshots/a.png")),
            Some("/workspace-files/playwright/tests/screenshots/a.png".to_string())
        );
        assert_eq!(resolver.viewer_file_url(Path::new("/etc/passwd")), None);
    }

    #[test]
    fn test_resolve_under() {
        let resolver = resolver();
        assert_eq!(
            resolver.resolve_under(Path::new("specs"), "specs/request_1.md"),
            Some(PathBuf::from("/srv/deck/specs/request_1.md"))
        );
        assert_eq!(resolver.resolve_under(Path::new("specs"), "specs/../Cargo.toml"), None);
        assert_eq!(resolver.resolve_under(Path::new("specs"), "specs"), None);
        assert_eq!(resolver.resolve_under(Path::new("specs"), ""), None);
    }
}
