//! Testdeck Common Library
//!
//! Shared types, persistence, artifact paths and report parsing for Testdeck.

pub mod db;
pub mod error;
pub mod logs;
pub mod paths;
pub mod report;
pub mod types;

// Re-export commonly used types
pub use db::{Database, RunStore};
pub use error::{Error, Result};
pub use logs::tail_file;
pub use paths::{PathResolver, RunPaths};
pub use report::{ParsedAttachment, ParsedFailingTest, ParsedReport, ParsedTestCase, ReportParser};
pub use types::*;

/// Testdeck version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
