//! Error taxonomy shared by the engine components.
//!
//! Batch-level problems (`Configuration`) abort a run before any mutation.
//! Everything else is recovered per file and surfaces as a value inside the
//! run report; the variants here are what those values are built from.

use std::path::PathBuf;

use miette::Diagnostic;

use crate::core::generator::GenerationError;

/// Engine-wide error type
#[derive(Debug, thiserror::Error, Diagnostic)]
pub enum EngineError {
    /// Missing or invalid setting; fatal at startup
    #[error("configuration error: {0}")]
    #[diagnostic(code(tagsafe::config), help("check tagsafe.toml and TAGSAFE__* variables"))]
    Configuration(String),

    /// Read/write/permission failure on a single path
    #[error("{op} failed for {}: {source}", .path.display())]
    #[diagnostic(code(tagsafe::file))]
    FileOperation {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// External generator failure, timeout or malformed response
    #[error(transparent)]
    #[diagnostic(code(tagsafe::generation))]
    Generation(#[from] GenerationError),

    /// Backup could not be created or restored
    #[error("backup failed for {}: {reason}", .path.display())]
    #[diagnostic(
        code(tagsafe::backup),
        help("the target file was left untouched; fix the cause and re-run")
    )]
    Backup { path: PathBuf, reason: String },

    /// Malformed instruction, rejected before any I/O
    #[error("invalid instruction: {0}")]
    #[diagnostic(code(tagsafe::validation))]
    Validation(String),

    /// Workflow state could not be persisted or read
    #[error("state error: {0}")]
    #[diagnostic(code(tagsafe::state))]
    State(String),
}

impl EngineError {
    pub fn io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        EngineError::FileOperation {
            op,
            path: path.into(),
            source,
        }
    }

    pub fn backup(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        EngineError::Backup {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// True when the underlying I/O error is "not found"
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            EngineError::FileOperation { source, .. }
                if source.kind() == std::io::ErrorKind::NotFound
        )
    }
}
