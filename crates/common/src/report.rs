//! Report parsing
//!
//! Turns the runner's JSON report (suites → specs → tests → retry results)
//! into flat test records, a summary and classified attachments. A report that
//! is missing or malformed is never an error: parsing yields `None` and callers
//! fall back to persisted counts.

use crate::paths::PathResolver;
use crate::types::ReportSummary;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use tracing::debug;

/// Separator used when composing a test title from its ancestors
pub const TITLE_SEPARATOR: &str = " > ";

pub const UNTITLED_TEST: &str = "Untitled test";

pub const NO_FAILURE_MESSAGE: &str = "No failure message available.";

const TRACE_HINTS: &[&str] = &["trace", ".zip"];
const SCREENSHOT_HINTS: &[&str] = &["screenshot", ".png", ".jpg"];
const VIDEO_HINTS: &[&str] = &["video", ".webm", ".mp4"];

const RESPONSE_SIGNALS: &[&str] = &["response", "request", "payload", "body"];
const RESPONSE_EXTENSIONS: &[&str] = &[".json", ".txt", ".log", ".xml", ".html", ".csv", ".md"];

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// ---------------------------------------------------------------------------
// Report document
// ---------------------------------------------------------------------------

/// Top-level report document as written by the runner
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportDocument {
    #[serde(default, deserialize_with = "null_as_default")]
    pub suites: Vec<SuiteNode>,
    #[serde(default)]
    pub stats: Option<ReportStats>,
    /// Top-level errors (e.g. config or collection failures)
    #[serde(default, deserialize_with = "null_as_default")]
    pub errors: Vec<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportStats {
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub expected: Option<u32>,
    #[serde(default)]
    pub unexpected: Option<u32>,
    #[serde(default)]
    pub flaky: Option<u32>,
    #[serde(default)]
    pub skipped: Option<u32>,
}

impl ReportStats {
    pub fn duration_ms(&self) -> u64 {
        self.duration
            .filter(|d| d.is_finite() && *d > 0.0)
            .map(|d| d.round() as u64)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SuiteNode {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub suites: Vec<SuiteNode>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub specs: Vec<SpecNode>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SpecNode {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tests: Vec<TestNode>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestNode {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub project_name: Option<String>,
    /// Test-level outcome across retries (expected/unexpected/flaky/skipped)
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub expected_status: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub results: Vec<TestResult>,
}

impl TestNode {
    /// Last retry attempt, authoritative for status, duration and attachments
    pub fn final_result(&self) -> Option<&TestResult> {
        self.results.last()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TestResult {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub error: Option<ErrorDetail>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub errors: Vec<ErrorDetail>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub attachments: Vec<RawAttachment>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub stdout: Vec<OutputChunk>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub stderr: Vec<OutputChunk>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorDetail {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub stack: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
}

impl ErrorDetail {
    fn first_text(&self) -> Option<&str> {
        [&self.message, &self.stack, &self.value]
            .into_iter()
            .find_map(|field| field.as_deref().filter(|s| !s.is_empty()))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawAttachment {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
}

/// One stdout/stderr chunk of a retry attempt
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OutputChunk {
    Text(String),
    Structured(StructuredChunk),
    Other(Value),
}

/// Object chunk; known text-bearing fields are tried in order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StructuredChunk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

impl OutputChunk {
    /// Render the chunk as text
    pub fn render(&self) -> String {
        match self {
            OutputChunk::Text(text) => text.clone(),
            OutputChunk::Structured(chunk) => {
                let known = [&chunk.text, &chunk.message, &chunk.value, &chunk.body];
                match known.into_iter().find_map(|field| field.as_ref().and_then(Value::as_str)) {
                    Some(text) => text.to_string(),
                    None => serde_json::to_string(chunk).unwrap_or_default(),
                }
            }
            OutputChunk::Other(value) => match value {
                Value::Array(_) | Value::Object(_) => serde_json::to_string(value).unwrap_or_default(),
                Value::String(text) => text.clone(),
                _ => String::new(),
            },
        }
    }
}

fn join_output(chunks: &[OutputChunk]) -> String {
    chunks
        .iter()
        .map(OutputChunk::render)
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

// ---------------------------------------------------------------------------
// Parsed model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedAttachment {
    pub name: String,
    pub path: Option<String>,
    /// None when the path resolves outside the artifacts root
    pub url: Option<String>,
    pub content_type: Option<String>,
}

impl ParsedAttachment {
    /// Whether this attachment probably holds a captured request/response body
    pub fn is_response_like(&self) -> bool {
        let signal = format!(
            "{} {} {}",
            self.name,
            self.path.as_deref().unwrap_or_default(),
            self.content_type.as_deref().unwrap_or_default()
        )
        .to_lowercase();
        if RESPONSE_SIGNALS.iter().any(|s| signal.contains(s)) {
            return true;
        }

        if let Some(content_type) = self.content_type.as_deref() {
            let content_type = content_type.to_lowercase();
            if content_type.starts_with("application/json")
                || content_type.starts_with("text/")
                || content_type.contains("xml")
            {
                return true;
            }
        }

        let path = self.path.as_deref().unwrap_or_default().to_lowercase();
        RESPONSE_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
    }

    fn matches_any(&self, hints: &[&str]) -> bool {
        let name = self.name.to_lowercase();
        let path = self.path.as_deref().unwrap_or_default().to_lowercase();
        hints.iter().any(|hint| name.contains(hint) || path.contains(hint))
    }
}

/// URL of the first attachment whose name or path contains one of `hints`
pub fn url_by_hint(attachments: &[ParsedAttachment], hints: &[&str]) -> Option<String> {
    attachments
        .iter()
        .find(|a| a.matches_any(hints))
        .and_then(|a| a.url.clone())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedTestCase {
    pub title: String,
    pub status: String,
    pub expected_status: Option<String>,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
    pub stdout: String,
    pub stderr: String,
    pub attachments: Vec<ParsedAttachment>,
    pub response_attachments: Vec<ParsedAttachment>,
    pub trace_url: Option<String>,
    pub screenshot_url: Option<String>,
    pub video_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedFailingTest {
    pub title: String,
    pub status: String,
    pub error: String,
    pub attachments: Vec<ParsedAttachment>,
    pub trace_url: Option<String>,
    pub screenshot_url: Option<String>,
    pub video_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedReport {
    pub summary: ReportSummary,
    pub tests: Vec<ParsedTestCase>,
    pub failing_tests: Vec<ParsedFailingTest>,
    /// Titles of flaky tests
    pub flaky_tests: Vec<String>,
}

/// Normalized status: test-level "flaky" wins, then the final attempt, then
/// the test-level status, then "unknown"
pub fn normalize_status(final_status: Option<&str>, test_status: Option<&str>) -> String {
    let final_status = final_status.unwrap_or_default().trim().to_lowercase();
    let test_status = test_status.unwrap_or_default().trim().to_lowercase();

    if test_status == "flaky" {
        return test_status;
    }
    if !final_status.is_empty() {
        return final_status;
    }
    if !test_status.is_empty() {
        return test_status;
    }
    "unknown".to_string()
}

/// Failing for triage: anything but passed, skipped or flaky
pub fn is_failing_status(status: &str) -> bool {
    !matches!(status.to_lowercase().as_str(), "passed" | "skipped" | "flaky")
}

fn failure_message(result: Option<&TestResult>) -> String {
    let Some(result) = result else {
        return NO_FAILURE_MESSAGE.to_string();
    };

    if let Some(message) = result.error.as_ref().and_then(|e| e.message.as_deref()) {
        if !message.is_empty() {
            return message.to_string();
        }
    }

    result
        .errors
        .iter()
        .find_map(ErrorDetail::first_text)
        .unwrap_or(NO_FAILURE_MESSAGE)
        .to_string()
}

fn compose_title(prefix: &[&str], test: &TestNode) -> String {
    let own = test.title.as_deref().map(str::trim).filter(|t| !t.is_empty());
    match own {
        Some(title) => {
            let mut parts = prefix.to_vec();
            parts.push(title);
            parts.join(TITLE_SEPARATOR)
        }
        None if !prefix.is_empty() => prefix.join(TITLE_SEPARATOR),
        None => UNTITLED_TEST.to_string(),
    }
}

fn non_empty(title: &Option<String>) -> Option<&str> {
    title.as_deref().map(str::trim).filter(|t| !t.is_empty())
}

/// Stateless parser; the resolver decides which attachment paths get URLs
#[derive(Debug, Clone)]
pub struct ReportParser {
    resolver: PathResolver,
}

impl ReportParser {
    pub fn new(resolver: PathResolver) -> Self {
        Self { resolver }
    }

    /// Read and decode a report document; None when missing or malformed
    pub async fn load_document(path: &Path) -> Option<ReportDocument> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) => {
                debug!("No report at {:?}: {}", path, e);
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(document) => Some(document),
            Err(e) => {
                debug!("Malformed report at {:?}: {}", path, e);
                None
            }
        }
    }

    pub async fn parse_file(&self, path: &Path) -> Option<ParsedReport> {
        let document = Self::load_document(path).await?;
        Some(self.parse_document(&document))
    }

    pub fn parse_str(&self, raw: &str) -> Option<ParsedReport> {
        match serde_json::from_str::<ReportDocument>(raw) {
            Ok(document) => Some(self.parse_document(&document)),
            Err(e) => {
                debug!("Malformed report: {}", e);
                None
            }
        }
    }

    pub fn parse_document(&self, document: &ReportDocument) -> ParsedReport {
        let tests = self.flatten_tests(document);

        let failing_tests = tests
            .iter()
            .filter(|t| is_failing_status(&t.status))
            .map(|t| ParsedFailingTest {
                title: t.title.clone(),
                status: t.status.clone(),
                error: t.error.clone().unwrap_or_else(|| NO_FAILURE_MESSAGE.to_string()),
                attachments: t.attachments.clone(),
                trace_url: t.trace_url.clone(),
                screenshot_url: t.screenshot_url.clone(),
                video_url: t.video_url.clone(),
            })
            .collect();

        let flaky_tests = tests
            .iter()
            .filter(|t| t.status == "flaky")
            .map(|t| t.title.clone())
            .collect();

        ParsedReport {
            summary: summarize(document),
            tests,
            failing_tests,
            flaky_tests,
        }
    }

    fn flatten_tests(&self, document: &ReportDocument) -> Vec<ParsedTestCase> {
        let mut tests = Vec::new();
        for suite in &document.suites {
            self.visit_suite(suite, &[], &mut tests);
        }
        tests
    }

    fn visit_suite<'a>(&self, suite: &'a SuiteNode, parents: &[&'a str], out: &mut Vec<ParsedTestCase>) {
        let mut titles = parents.to_vec();
        if let Some(title) = non_empty(&suite.title) {
            titles.push(title);
        }

        for spec in &suite.specs {
            let mut prefix = titles.clone();
            if let Some(title) = non_empty(&spec.title) {
                prefix.push(title);
            }
            for test in &spec.tests {
                out.push(self.parse_test(&prefix, test));
            }
        }

        for nested in &suite.suites {
            self.visit_suite(nested, &titles, out);
        }
    }

    fn parse_test(&self, prefix: &[&str], test: &TestNode) -> ParsedTestCase {
        let final_result = test.final_result();
        let status = normalize_status(
            final_result.and_then(|r| r.status.as_deref()),
            test.status.as_deref(),
        );

        let attachments: Vec<ParsedAttachment> = final_result
            .map(|r| r.attachments.iter().map(|a| self.attachment(a)).collect())
            .unwrap_or_default();

        let stdout = join_attempts(test.results.iter().map(|r| join_output(&r.stdout)));
        let stderr = join_attempts(test.results.iter().map(|r| join_output(&r.stderr)));

        let error = is_failing_status(&status).then(|| failure_message(final_result));

        ParsedTestCase {
            title: compose_title(prefix, test),
            expected_status: test.expected_status.clone(),
            duration_ms: final_result
                .and_then(|r| r.duration)
                .filter(|d| d.is_finite() && *d >= 0.0)
                .map(|d| d.round() as u64),
            error,
            stdout,
            stderr,
            response_attachments: attachments.iter().filter(|a| a.is_response_like()).cloned().collect(),
            trace_url: url_by_hint(&attachments, TRACE_HINTS),
            screenshot_url: url_by_hint(&attachments, SCREENSHOT_HINTS),
            video_url: url_by_hint(&attachments, VIDEO_HINTS),
            attachments,
            status,
        }
    }

    fn attachment(&self, raw: &RawAttachment) -> ParsedAttachment {
        let path = raw.path.clone().filter(|p| !p.is_empty());
        ParsedAttachment {
            name: raw
                .name
                .clone()
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| "attachment".to_string()),
            url: path.as_deref().and_then(|p| self.resolver.artifact_url(Path::new(p))),
            path,
            content_type: raw.content_type.clone(),
        }
    }
}

fn join_attempts(outputs: impl Iterator<Item = String>) -> String {
    outputs
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Summary from report-level stats when any counter is non-zero, else by
/// tallying each test's normalized final outcome
pub fn summarize(document: &ReportDocument) -> ReportSummary {
    let duration_ms = document.stats.as_ref().map(ReportStats::duration_ms).unwrap_or(0);

    if let Some(stats) = &document.stats {
        let expected = stats.expected.unwrap_or(0);
        let unexpected = stats.unexpected.unwrap_or(0);
        let flaky = stats.flaky.unwrap_or(0);
        let skipped = stats.skipped.unwrap_or(0);
        if expected > 0 || unexpected > 0 || flaky > 0 || skipped > 0 {
            return ReportSummary::new(expected, unexpected, flaky, duration_ms);
        }
    }

    let (mut passed, mut failed, mut flaky) = (0u32, 0u32, 0u32);
    let mut stack: Vec<&SuiteNode> = document.suites.iter().collect();
    while let Some(suite) = stack.pop() {
        for test in suite.specs.iter().flat_map(|spec| spec.tests.iter()) {
            let Some(final_status) = test.final_result().and_then(|r| r.status.as_deref()) else {
                continue;
            };
            match normalize_status(Some(final_status), test.status.as_deref()).as_str() {
                "passed" => passed += 1,
                "flaky" => flaky += 1,
                "skipped" => {}
                _ => failed += 1,
            }
        }
        stack.extend(suite.suites.iter());
    }

    ReportSummary::new(passed, failed, flaky, duration_ms)
}

/// First non-empty suite or spec title, depth-first
pub fn first_suite_title(document: &ReportDocument) -> Option<String> {
    fn visit(suite: &SuiteNode) -> Option<String> {
        if let Some(title) = non_empty(&suite.title) {
            return Some(title.to_string());
        }
        if let Some(title) = suite.specs.iter().find_map(|s| non_empty(&s.title)) {
            return Some(title.to_string());
        }
        suite.suites.iter().find_map(visit)
    }
    document.suites.iter().find_map(visit)
}
