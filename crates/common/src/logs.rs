//! Log tailing

use std::path::Path;
use tracing::debug;

/// Last `max_lines` lines of a log file, decoded lossily
///
/// Missing or unreadable files yield "".
pub async fn tail_file(path: &Path, max_lines: usize) -> String {
    match tokio::fs::read(path).await {
        Ok(bytes) => tail_lines(&String::from_utf8_lossy(&bytes), max_lines),
        Err(e) => {
            debug!("Cannot read log {:?}: {}", path, e);
            String::new()
        }
    }
}

/// Last `max_lines` lines of `content`, split on `\n` or `\r\n`
pub fn tail_lines(content: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = content
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_lines() {
        assert_eq!(tail_lines("a\nb\nc", 2), "b\nc");
        assert_eq!(tail_lines("a\r\nb\r\nc", 5), "a\nb\nc");
        assert_eq!(tail_lines("a\nb\n", 1), "");
        assert_eq!(tail_lines("a\nb\n", 2), "b\n");
        assert_eq!(tail_lines("", 3), "");
        assert_eq!(tail_lines("a\nb", 0), "");
    }

    #[tokio::test]
    async fn test_tail_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdout.log");
        let content: Vec<String> = (1..=10).map(|i| format!("line {i}")).collect();
        tokio::fs::write(&path, content.join("\n")).await.unwrap();

        assert_eq!(tail_file(&path, 3).await, "line 8\nline 9\nline 10");
        assert_eq!(tail_file(&dir.path().join("missing.log"), 3).await, "");
    }

    #[tokio::test]
    async fn test_tail_file_with_invalid_utf8() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stderr.log");
        tokio::fs::write(&path, b"line 1\nline 2\n\xff\nline 4").await.unwrap();

        assert_eq!(tail_file(&path, 3).await, "line 2\n\u{FFFD}\nline 4");
    }
}
