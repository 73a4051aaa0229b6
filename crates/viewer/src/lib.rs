//! Testdeck Artifact Viewer
//!
//! Reconstructs runs from the artifact store and correlates screenshots and
//! agent automation records with them.

pub mod agents;
pub mod cleanup;
pub mod config;
pub mod correlate;
pub mod runs;
pub mod screenshots;

pub use agents::{AgentContext, AgentPhase, AgentRecord};
pub use cleanup::{cleanup_generated_files, CleanupOptions, CleanupReport};
pub use config::CorrelatorConfig;
pub use runs::{ArtifactCorrelator, ViewerRun, ViewerRunDetails};
