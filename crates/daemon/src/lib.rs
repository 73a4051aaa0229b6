//! Testdeck Daemon
//!
//! Single-flight orchestration of the external test runner, plus the run
//! service the command line drives.

pub mod config;
pub mod orchestrator;
pub mod service;
pub mod suites;

pub use config::{DaemonConfig, RunnerConfig};
pub use orchestrator::{Orchestrator, RunPhase, RunRequest, TerminationCause};
pub use service::{RunService, StartRunRequest};
pub use suites::SuiteCatalog;
