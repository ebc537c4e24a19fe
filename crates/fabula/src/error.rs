//! Error taxonomy for the generation core.
//!
//! Each variant maps to a distinct recovery policy:
//! - [`EngineError::User`] surfaces directly with a readable message.
//! - [`EngineError::Validation`] is fatal for the run; the offending
//!   artifact is never persisted.
//! - [`EngineError::AtomicWrite`] leaves on-disk state rolled back to the
//!   pre-attempt bundle; a resume retries the node.
//! - [`EngineError::Transient`] is handled by the owning component via
//!   retry-with-backoff; it only escapes as a logged degradation.
//! - [`EngineError::Cancelled`] is cooperative; the last completed node's
//!   checkpoint becomes the stop point.
//! - [`EngineError::Corruption`] means reconciliation could not square the
//!   checkpoint with the filesystem.

use thiserror::Error;

use crate::schema::ValidationIssue;

/// Core error type shared by every component boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid input from the operator (bad project name, missing prompt,
    /// rollback target out of range).
    #[error("{0}")]
    User(String),

    /// An artifact or plugin output failed schema validation.
    #[error("validation failed for {artifact}: {}", format_issues(.issues))]
    Validation {
        /// Which artifact (or plugin) produced the invalid value.
        artifact: String,
        /// All problems found, so callers can report every one at once.
        issues: Vec<ValidationIssue>,
    },

    /// The atomic bundle write failed; on-disk state was rolled back.
    #[error("atomic bundle write failed: {message}")]
    AtomicWrite {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Timeout or connectivity failure against an external collaborator.
    #[error("transient failure in {operation}: {message}")]
    Transient { operation: String, message: String },

    /// The shutdown flag was observed; the run stopped cooperatively.
    #[error("run interrupted by shutdown signal")]
    Cancelled,

    /// Checkpoint unreadable or irreconcilable with the filesystem.
    #[error("checkpoint corruption: {0}")]
    Corruption(String),

    /// The graph executed more nodes than the configured budget allows.
    #[error("graph recursion limit of {0} node executions exceeded")]
    RecursionLimit(u32),

    /// Underlying storage failure (filesystem or SQLite).
    #[error("storage error: {0}")]
    Storage(String),
}

impl EngineError {
    /// Build a validation error from collected issues.
    pub fn validation(artifact: impl Into<String>, issues: Vec<ValidationIssue>) -> Self {
        EngineError::Validation {
            artifact: artifact.into(),
            issues,
        }
    }

    pub fn user(message: impl Into<String>) -> Self {
        EngineError::User(message.into())
    }

    pub fn storage(message: impl std::fmt::Display) -> Self {
        EngineError::Storage(message.to_string())
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Storage(format!("JSON serialization: {e}"))
    }
}

fn format_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|i| format!("{}: {}", i.path, i.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Convenience alias used throughout the core.
pub type Result<T, E = EngineError> = std::result::Result<T, E>;
