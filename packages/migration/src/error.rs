use std::path::PathBuf;

use sea_orm::DbErr;
use thiserror::Error;

/// Failures surfaced by the revision runner.
///
/// None of these are recovered inside the crate: callers turn them into a
/// non-zero exit.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// The caller supplied no usable change description.
    #[error("usage: {message}")]
    Usage { message: String },

    /// The declared model could not be read, validated or diffed.
    #[error("generation failed: {message}")]
    Generation { message: String },

    /// The artifact history is ambiguous, broken, or disagrees with the marker.
    #[error("chain error: {message}")]
    Chain { message: String },

    /// An artifact's upgrade (or downgrade) set failed against the live database.
    #[error(
        "apply failed at revision {revision}: {message} (marker={}, applied this run: {})",
        .marker.as_deref().unwrap_or("<base>"),
        .applied.len()
    )]
    Apply {
        revision: String,
        marker: Option<String>,
        applied: Vec<String>,
        message: String,
    },

    /// Reading or writing the artifact store failed.
    #[error("artifact store error at {}: {message}", .path.display())]
    Store { path: PathBuf, message: String },

    /// Database access outside of an artifact's operation set.
    #[error("database error: {0}")]
    Db(#[from] DbErr),
}

impl MigrationError {
    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage {
            message: message.into(),
        }
    }

    pub fn generation(message: impl Into<String>) -> Self {
        Self::Generation {
            message: message.into(),
        }
    }

    pub fn chain(message: impl Into<String>) -> Self {
        Self::Chain {
            message: message.into(),
        }
    }

    pub fn store(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Store {
            path: path.into(),
            message: message.into(),
        }
    }

    /// True for refusals that happen before any side effect.
    pub fn is_usage(&self) -> bool {
        matches!(self, Self::Usage { .. })
    }
}
