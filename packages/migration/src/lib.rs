//! Schema revision runner.
//!
//! `generate` turns the difference between the declared data model and the
//! head of the artifact chain into a new immutable artifact; `apply` brings a
//! live database from its Schema Version Marker up to the head.

pub use sea_orm::{ConnectionTrait, DatabaseConnection, TransactionTrait};

pub mod artifact;
pub mod chain;
pub mod diff;
pub mod error;
pub mod introspect;
pub mod marker;
pub mod ops;
pub mod runner;
pub mod schema;
pub mod store;

pub use artifact::{Artifact, Description};
pub use chain::Chain;
pub use error::MigrationError;
pub use ops::SchemaOp;
pub use runner::{apply, downgrade, generate, status, ArtifactState, ArtifactStatus};
pub use schema::{ColumnDef, ColumnType, IndexDef, ModelFile, ModelSource, SchemaSnapshot, TableDef};
pub use store::ArtifactStore;

/// Revision the live database is at, `None` at the base or before the first run.
pub async fn current_revision<C: ConnectionTrait>(db: &C) -> Result<Option<String>, MigrationError> {
    marker::read(db).await
}

/// Number of artifacts applied to the live database.
/// Returns 0 if the marker table doesn't exist yet.
pub async fn count_applied<C: ConnectionTrait>(
    db: &C,
    store: &ArtifactStore,
) -> Result<usize, MigrationError> {
    let statuses = status(db, store).await?;
    Ok(statuses
        .iter()
        .filter(|s| s.state == ArtifactState::Applied)
        .count())
}
