//! Error types for Testdeck

use thiserror::Error;

/// Result type alias using Testdeck Error
pub type Result<T> = std::result::Result<T, Error>;

/// Testdeck error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("another run is already executing ({active_run_id})")]
    Concurrency { active_run_id: String },

    #[error("{0}")]
    Validation(String),

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Invalid run id: {0}")]
    InvalidRunId(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(kind: &str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            id: id.into(),
        }
    }

    /// HTTP-equivalent status code for the API boundary
    pub fn http_status(&self) -> u16 {
        match self {
            Error::Validation(_) | Error::InvalidRunId(_) => 400,
            Error::NotFound { .. } => 404,
            Error::Concurrency { .. } => 409,
            _ => 500,
        }
    }

    pub fn is_concurrency(&self) -> bool {
        matches!(self, Error::Concurrency { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_mapping() {
        let conflict = Error::Concurrency {
            active_run_id: "run-a".to_string(),
        };
        assert_eq!(conflict.http_status(), 409);
        assert!(conflict.is_concurrency());

        assert_eq!(Error::Validation("suiteName was not found".into()).http_status(), 400);
        assert_eq!(Error::InvalidRunId("../etc".into()).http_status(), 400);
        assert_eq!(Error::not_found("target", "t1").http_status(), 404);
        assert_eq!(Error::Internal("boom".into()).http_status(), 500);
    }
}
