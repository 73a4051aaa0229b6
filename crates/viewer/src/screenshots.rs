//! Screenshot discovery

use crate::config::CorrelatorConfig;
use crate::correlate::{screenshots_in_window, ScreenshotCandidate};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use testdeck_common::paths::normalize_lexically;
use testdeck_common::{ParsedAttachment, PathResolver};
use tracing::warn;

const IMAGE_EXTENSIONS: &[&str] = &[".png", ".jpg", ".jpeg", ".webp"];

pub fn is_screenshot_path(path: &Path) -> bool {
    let lower = path.to_string_lossy().to_lowercase();
    IMAGE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// Content type inferred from the extension, png when unknown
pub fn image_content_type(path: &Path) -> &'static str {
    let lower = path.to_string_lossy().to_lowercase();
    if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        "image/jpeg"
    } else if lower.ends_with(".webp") {
        "image/webp"
    } else {
        "image/png"
    }
}

/// Every image file below `dirs`, with its modification time
pub fn gather_candidates(dirs: &[PathBuf]) -> Vec<ScreenshotCandidate> {
    dirs.iter()
        .flat_map(|dir| walkdir::WalkDir::new(dir).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.file_type().is_file() && is_screenshot_path(e.path()))
        .filter_map(|e| {
            let modified = e.metadata().ok()?.modified().ok()?;
            Some(ScreenshotCandidate {
                path: e.path().to_path_buf(),
                modified: DateTime::<Utc>::from(modified),
            })
        })
        .collect()
}

/// Screenshots correlated with one run
///
/// The run's own directory is always scanned; the shared manual directory is
/// added only for the manual pseudo-run. The directory walk runs on the
/// blocking pool.
pub async fn collect_run_screenshots(
    resolver: &PathResolver,
    config: &CorrelatorConfig,
    run_id: &str,
    run_dir: &Path,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Vec<ParsedAttachment> {
    let mut dirs = vec![run_dir.to_path_buf()];
    if run_id == config.manual_run_id {
        dirs.push(resolver.workspace_root().join(&config.manual_screenshots_dir));
    }

    let candidates = match tokio::task::spawn_blocking(move || gather_candidates(&dirs)).await {
        Ok(candidates) => candidates,
        Err(e) => {
            warn!("Screenshot scan for run {} failed: {}", run_id, e);
            return Vec::new();
        }
    };
    if candidates.is_empty() {
        return Vec::new();
    }

    let chosen = screenshots_in_window(
        candidates,
        started_at,
        finished_at,
        now,
        config.screenshot_padding(),
    );

    let mut seen = HashSet::new();
    chosen
        .into_iter()
        .filter_map(|candidate| {
            let path = normalize_lexically(&candidate.path);
            if !seen.insert(path.clone()) {
                return None;
            }
            let url = resolver.viewer_file_url(&path)?;
            Some(ParsedAttachment {
                name: path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                path: Some(path.to_string_lossy().into_owned()),
                url: Some(url),
                content_type: Some(image_content_type(&path).to_string()),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration as StdDuration, SystemTime};

    fn touch(path: &Path, modified: SystemTime) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, b"img").unwrap();
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(modified).unwrap();
    }

    #[test]
    fn test_content_types() {
        assert_eq!(image_content_type(Path::new("a.JPG")), "image/jpeg");
        assert_eq!(image_content_type(Path::new("a.jpeg")), "image/jpeg");
        assert_eq!(image_content_type(Path::new("a.webp")), "image/webp");
        assert_eq!(image_content_type(Path::new("a.png")), "image/png");
        assert!(is_screenshot_path(Path::new("shots/FINAL.PNG")));
        assert!(!is_screenshot_path(Path::new("trace.zip")));
    }

    #[tokio::test]
    async fn test_run_screenshots_in_window() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = PathResolver::new(dir.path());
        let config = CorrelatorConfig::default();
        let run_dir = resolver.run_dir("run-1").unwrap();

        let start = SystemTime::now() - StdDuration::from_secs(3600);
        touch(&run_dir.join("test-results/a/early.png"), start - StdDuration::from_secs(20 * 60));
        touch(&run_dir.join("test-results/a/during.jpg"), start + StdDuration::from_secs(30));
        touch(&run_dir.join("test-results/b/after.webp"), start + StdDuration::from_secs(5 * 60));
        touch(&run_dir.join("test-results/b/trace.zip"), start);

        let started_at = DateTime::<Utc>::from(start);
        let shots = collect_run_screenshots(
            &resolver,
            &config,
            "run-1",
            &run_dir,
            Some(started_at),
            Some(started_at + chrono::Duration::seconds(60)),
            Utc::now(),
        )
        .await;

        let names: Vec<_> = shots.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["during.jpg", "after.webp"]);
        assert_eq!(
            shots[0].url.as_deref(),
            Some("/artifacts/run-1/test-results/a/during.jpg")
        );
        assert_eq!(shots[0].content_type.as_deref(), Some("image/jpeg"));
        assert_eq!(shots[1].content_type.as_deref(), Some("image/webp"));
    }

    #[tokio::test]
    async fn test_manual_run_includes_shared_dir() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = PathResolver::new(dir.path());
        let config = CorrelatorConfig::default();
        let now = SystemTime::now();

        touch(&dir.path().join("playwright/tests/screenshots/home.png"), now);
        touch(&resolver.run_dir("manual_run").unwrap().join("own.png"), now);
        touch(&resolver.run_dir("other").unwrap().join("own.png"), now);

        let manual = collect_run_screenshots(
            &resolver,
            &config,
            "manual_run",
            &resolver.run_dir("manual_run").unwrap(),
            None,
            None,
            Utc::now(),
        )
        .await;
        let urls: Vec<_> = manual.iter().filter_map(|s| s.url.clone()).collect();
        assert_eq!(
            urls,
            vec![
                "/artifacts/manual_run/own.png".to_string(),
                "/workspace-files/playwright/tests/screenshots/home.png".to_string(),
            ]
        );

        let other = collect_run_screenshots(
            &resolver,
            &config,
            "other",
            &resolver.run_dir("other").unwrap(),
            None,
            None,
            Utc::now(),
        )
        .await;
        assert_eq!(other.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_dir_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = PathResolver::new(dir.path());
        let shots = collect_run_screenshots(
            &resolver,
            &CorrelatorConfig::default(),
            "absent",
            &resolver.run_dir("absent").unwrap(),
            None,
            None,
            Utc::now(),
        )
        .await;
        assert!(shots.is_empty());
    }
}
