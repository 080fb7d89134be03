use migration::MigrationError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbInfraError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Connection error: {message}")]
    Connect { message: String },

    #[error("Lock error: {message}")]
    Lock { message: String },

    #[error("Post-check failed: {message}")]
    PostCheck { message: String },

    #[error(transparent)]
    Migration(#[from] MigrationError),
}

impl DbInfraError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn lock(message: impl Into<String>) -> Self {
        Self::Lock {
            message: message.into(),
        }
    }

    /// Invocation mistakes (e.g. an empty description) rather than runtime failures.
    pub fn is_usage(&self) -> bool {
        matches!(self, Self::Migration(e) if e.is_usage())
    }
}
