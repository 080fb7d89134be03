//! Shared database configuration and revision orchestration.
//! Used by the migration CLI.

pub mod config;
pub mod error;
pub mod infra;

pub use config::db;
pub use config::db::{DbKind, MigrateConfig, RuntimeEnv};
pub use error::DbInfraError;
pub use infra::db::core::{build_admin_pool, orchestrate_revision, RevisionOutcome};
