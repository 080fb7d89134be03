use std::fmt;

use sea_orm::{ConnectionTrait, DatabaseBackend, Statement, TransactionTrait};
use tracing::{error, info, warn};

use crate::artifact::{Artifact, Description};
use crate::chain::Chain;
use crate::diff::diff;
use crate::error::MigrationError;
use crate::marker;
use crate::ops::SchemaOp;
use crate::schema::ModelSource;
use crate::store::ArtifactStore;

/// Per-artifact lifecycle within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactState {
    Pending,
    Applying,
    Applied,
    Failed,
}

impl fmt::Display for ArtifactState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArtifactState::Pending => "pending",
            ArtifactState::Applying => "applying",
            ArtifactState::Applied => "applied",
            ArtifactState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactStatus {
    pub revision: String,
    pub description: String,
    pub state: ArtifactState,
}

/// Diff the declared model against the head of the chain and write the
/// result as a new artifact whose predecessor is that head.
///
/// An empty description is refused before anything is read or written.
/// The live database is never touched.
pub fn generate(
    store: &ArtifactStore,
    model: &dyn ModelSource,
    description: &str,
) -> Result<Artifact, MigrationError> {
    let description = Description::new(description)?;

    let chain = Chain::build(store.load()?)?;
    let head = chain.head()?;
    let recorded = chain.schema_at(head.map(|a| a.revision.as_str()))?;

    let declared = model.declared()?;
    declared.validate()?;

    let upgrade = diff(&recorded, &declared);
    if upgrade.is_empty() {
        warn!(
            head = head.map(|a| a.revision.as_str()).unwrap_or("<base>"),
            "declared model matches the chain head; writing an empty revision"
        );
    }

    let artifact = Artifact::next(head, &description, upgrade)?;
    let path = store.write(&artifact)?;

    info!(
        revision = %artifact.revision,
        down_revision = artifact.down_revision.as_deref().unwrap_or("<base>"),
        ops = artifact.upgrade.len(),
        path = %path.display(),
        "artifact=generated"
    );
    for op in &artifact.upgrade {
        info!(revision = %artifact.revision, "  {op}");
    }

    Ok(artifact)
}

/// Apply every artifact after the marker, in chain order, one transaction
/// per artifact. Returns the applied revision ids (empty when already at head).
///
/// Progress is durable per artifact: when artifact *k* fails, the marker
/// stays at *k-1* and earlier artifacts of this run are not rolled back.
pub async fn apply<C>(db: &C, store: &ArtifactStore) -> Result<Vec<String>, MigrationError>
where
    C: ConnectionTrait + TransactionTrait,
{
    let chain = Chain::build(store.load()?)?;
    let ordered = chain.ordered()?;

    marker::ensure(db).await?;
    let start_marker = marker::read(db).await?;
    let start = match &start_marker {
        None => 0,
        Some(revision) => position(&ordered, revision)? + 1,
    };

    let diag = DbDiagnostics::collect(db).await;
    info!("▶ connected to DB: {} ({})", diag.name, diag.profile);
    info!(
        "▶ BEFORE: chain has {} artifact(s), {} applied, marker={}",
        ordered.len(),
        start,
        start_marker.as_deref().unwrap_or("<base>")
    );

    let pending = &ordered[start..];
    if pending.is_empty() {
        info!("apply=noop up_to_date=true");
        return Ok(Vec::new());
    }

    let backend = db.get_database_backend();
    let mut applied = Vec::with_capacity(pending.len());
    let mut current = start_marker;

    for artifact in pending {
        info!(
            revision = %artifact.revision,
            description = %artifact.description,
            state = %ArtifactState::Applying,
            "artifact transition"
        );

        let step = run_step(
            db,
            backend,
            &artifact.upgrade,
            current.as_deref(),
            Some(&artifact.revision),
        )
        .await;

        match step {
            Ok(()) => {
                info!(
                    revision = %artifact.revision,
                    state = %ArtifactState::Applied,
                    "artifact transition"
                );
                applied.push(artifact.revision.clone());
                current = Some(artifact.revision.clone());
            }
            Err(failure) => {
                error!(
                    revision = %artifact.revision,
                    state = %ArtifactState::Failed,
                    marker = current.as_deref().unwrap_or("<base>"),
                    "artifact transition"
                );
                return Err(failure.into_error(&artifact.revision, current, applied));
            }
        }
    }

    info!(
        "▶ AFTER: {} applied this run, marker={}",
        applied.len(),
        current.as_deref().unwrap_or("<base>")
    );
    Ok(applied)
}

/// Run the downgrade sets of the last `steps` applied artifacts, newest first,
/// moving the marker back to each predecessor. Returns the reverted ids.
pub async fn downgrade<C>(
    db: &C,
    store: &ArtifactStore,
    steps: usize,
) -> Result<Vec<String>, MigrationError>
where
    C: ConnectionTrait + TransactionTrait,
{
    let chain = Chain::build(store.load()?)?;
    let ordered = chain.ordered()?;

    let Some(start_marker) = marker::read(db).await? else {
        info!("downgrade=noop at_base=true");
        return Ok(Vec::new());
    };
    let top = position(&ordered, &start_marker)?;

    let backend = db.get_database_backend();
    let mut reverted = Vec::new();
    let mut current = Some(start_marker);

    for artifact in ordered[..=top].iter().rev().take(steps) {
        let target = artifact.down_revision.clone();
        info!(
            revision = %artifact.revision,
            target = target.as_deref().unwrap_or("<base>"),
            "artifact=downgrading"
        );
        if let Err(failure) = run_step(
            db,
            backend,
            &artifact.downgrade,
            current.as_deref(),
            target.as_deref(),
        )
        .await
        {
            return Err(failure.into_error(&artifact.revision, current, reverted));
        }
        reverted.push(artifact.revision.clone());
        current = target;
    }

    Ok(reverted)
}

/// Every artifact in chain order with its state relative to the marker.
pub async fn status<C: ConnectionTrait>(
    db: &C,
    store: &ArtifactStore,
) -> Result<Vec<ArtifactStatus>, MigrationError> {
    let chain = Chain::build(store.load()?)?;
    let ordered = chain.ordered()?;
    let applied_through = match marker::read(db).await? {
        None => 0,
        Some(revision) => position(&ordered, &revision)? + 1,
    };

    Ok(ordered
        .iter()
        .enumerate()
        .map(|(i, a)| ArtifactStatus {
            revision: a.revision.clone(),
            description: a.description.clone(),
            state: if i < applied_through {
                ArtifactState::Applied
            } else {
                ArtifactState::Pending
            },
        })
        .collect())
}

fn position(ordered: &[&Artifact], revision: &str) -> Result<usize, MigrationError> {
    ordered
        .iter()
        .position(|a| a.revision == revision)
        .ok_or_else(|| {
            MigrationError::chain(format!(
                "database is at revision {revision}, which is not in the artifact store"
            ))
        })
}

enum StepFailure {
    /// A statement of the operation set (or the transaction around it) failed.
    Statement(String),
    /// The marker could not be moved; carries the marker's own error.
    Marker(MigrationError),
}

impl StepFailure {
    fn into_error(
        self,
        revision: &str,
        marker: Option<String>,
        applied: Vec<String>,
    ) -> MigrationError {
        match self {
            StepFailure::Statement(message) => MigrationError::Apply {
                revision: revision.to_string(),
                marker,
                applied,
                message,
            },
            StepFailure::Marker(e) => e,
        }
    }
}

/// One artifact's operation set plus the marker move, in a single transaction.
async fn run_step<C>(
    db: &C,
    backend: DatabaseBackend,
    ops: &[SchemaOp],
    expected: Option<&str>,
    next: Option<&str>,
) -> Result<(), StepFailure>
where
    C: TransactionTrait,
{
    let mut statements: Vec<(String, Statement)> = Vec::new();
    for op in ops {
        let rendered = op.statements(backend).map_err(StepFailure::Statement)?;
        statements.extend(rendered.into_iter().map(|s| (op.to_string(), s)));
    }

    let txn = db
        .begin()
        .await
        .map_err(|e| StepFailure::Statement(format!("cannot open transaction: {e}")))?;

    for (op, statement) in statements {
        txn.execute(statement)
            .await
            .map_err(|e| StepFailure::Statement(format!("{op}: {e}")))?;
    }

    marker::advance(&txn, expected, next)
        .await
        .map_err(|e| match e {
            MigrationError::Db(db_err) => StepFailure::Statement(format!("marker update: {db_err}")),
            other => StepFailure::Marker(other),
        })?;

    txn.commit()
        .await
        .map_err(|e| StepFailure::Statement(format!("commit failed: {e}")))
}

#[derive(Debug)]
struct DbDiagnostics {
    profile: String,
    name: String,
}

impl DbDiagnostics {
    async fn collect<C: ConnectionTrait>(db: &C) -> Self {
        let backend = db.get_database_backend();
        let profile = format!("{backend:?}");

        let query = match backend {
            DatabaseBackend::Postgres => Some("select current_database() as name"),
            DatabaseBackend::Sqlite => {
                Some("SELECT file AS name FROM pragma_database_list WHERE name = 'main'")
            }
            DatabaseBackend::MySql => None,
        };

        let name = match query {
            Some(sql) => match db.query_one(Statement::from_string(backend, sql)).await {
                Ok(Some(row)) => match row.try_get::<String>("", "name") {
                    Ok(file) if file.is_empty() => ":memory:".to_string(),
                    Ok(name) => name,
                    Err(_) => "<unknown>".to_string(),
                },
                _ => "<unknown>".to_string(),
            },
            None => "<unsupported>".to_string(),
        };

        Self { profile, name }
    }
}
