use std::future::Future;
use std::time::{Duration, Instant};

use migration::introspect::{drift, expected_tables, live_tables};
use migration::{
    apply, current_revision, generate, Artifact, ArtifactStore, Chain, Description, ModelFile,
};
use rand::Rng;
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, Statement};
use tracing::{error, info, trace, warn};

use crate::config::db::{DbKind, MigrateConfig};
use crate::error::DbInfraError;
use crate::infra::db::diagnostics::migration_counters;
use crate::infra::db::locking::{BootstrapLock, FileLock, Guard, InMemoryLock, PgAdvisoryLock};

/// Result of one `generate` + `apply` invocation.
#[derive(Debug, Clone)]
pub struct RevisionOutcome {
    /// The artifact written by this run.
    pub artifact: Artifact,
    /// Revisions applied by this run, oldest first.
    pub applied: Vec<String>,
    /// Marker value after the run.
    pub marker: Option<String>,
}

fn get_db_engine(db_kind: DbKind) -> &'static str {
    match db_kind {
        DbKind::Postgres => "postgresql",
        DbKind::SqliteFile | DbKind::SqliteMemory => "sqlite",
    }
}

async fn retry_connection<T, F, Fut>(
    mut connect_fn: F,
    max_attempts: u32,
    interval_ms: u64,
) -> Result<T, DbInfraError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DbInfraError>>,
{
    let mut last_error = None;

    for attempt in 1..=max_attempts {
        match connect_fn().await {
            Ok(result) => {
                if attempt > 1 {
                    info!(
                        "connection_retry=success attempts={} interval_ms={}",
                        attempt, interval_ms
                    );
                }
                return Ok(result);
            }
            Err(e) => {
                last_error = Some(e);
                if attempt < max_attempts {
                    warn!(
                        "connection_retry=failed attempt={} max_attempts={} interval_ms={}",
                        attempt, max_attempts, interval_ms
                    );
                    tokio::time::sleep(Duration::from_millis(interval_ms)).await;
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| DbInfraError::Connect {
        message: format!("no connection attempt was made (max_attempts={max_attempts})"),
    }))
}

/// Single-session pool (min = max = 1) used for locking and for applying.
pub async fn build_admin_pool(config: &MigrateConfig) -> Result<DatabaseConnection, DbInfraError> {
    let mut opt = ConnectOptions::new(config.database_url.clone());
    opt.min_connections(1)
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(2))
        .sqlx_logging(false);

    let target = config.sanitized_url();
    if matches!(config.db_kind, DbKind::Postgres) {
        retry_connection(
            || {
                let opt_clone = opt.clone();
                let target = target.clone();
                async move {
                    Database::connect(opt_clone)
                        .await
                        .map_err(|e| DbInfraError::Connect {
                            message: format!("failed to connect to {target}: {e}"),
                        })
                }
            },
            5,
            500,
        )
        .await
    } else {
        Database::connect(opt)
            .await
            .map_err(|e| DbInfraError::Connect {
                message: format!("failed to connect to {target}: {e}"),
            })
    }
}

/// Poll `lock` with exponential backoff plus jitter until it is acquired or
/// `timeout` has elapsed.
pub async fn acquire_with_backoff<L>(lock: &mut L, timeout: Duration) -> Result<Guard, DbInfraError>
where
    L: BootstrapLock + ?Sized,
{
    let start = Instant::now();
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;

        if let Some(guard) = lock.try_acquire().await? {
            migration_counters::add_lock_acquire_attempts(attempts as usize);
            migration_counters::lock_acquired();
            trace!(
                lock = "won",
                target = %lock.describe(),
                attempts = attempts,
                elapsed_ms = start.elapsed().as_millis()
            );
            return Ok(guard);
        }

        if start.elapsed() >= timeout {
            migration_counters::add_lock_acquire_attempts(attempts as usize);
            migration_counters::lock_acquire_timeout();
            return Err(DbInfraError::lock(format!(
                "timed out waiting for {} after {:?} ({} attempts); another migration run holds it",
                lock.describe(),
                start.elapsed(),
                attempts
            )));
        }

        let base_delay_ms = (5u64 << attempts.saturating_sub(1).min(4)).min(80);
        let jitter_ms = rand::rng().random::<u64>() % 4;
        let delay_ms = base_delay_ms + jitter_ms;

        trace!(
            lock = "backoff",
            attempts = attempts,
            delay_ms = delay_ms,
            elapsed_ms = start.elapsed().as_millis()
        );
        migration_counters::lock_backoff_event();
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }
}

async fn release_guard(mut guard: Guard, what: &str) {
    if let Err(e) = guard.release().await {
        warn!(error = %e, lock = what, "Failed to release lock");
    }
}

/// Generate a revision for `description` from the declared model, then apply
/// every pending artifact to the configured database.
///
/// Order: description check, store lock, generate, store unlock, connect,
/// database lock, apply, post-check, database unlock, disconnect. The
/// connection is closed on every path once opened.
pub async fn orchestrate_revision(
    config: &MigrateConfig,
    description: &str,
) -> Result<RevisionOutcome, DbInfraError> {
    let description = Description::new(description)?;

    info!(
        "migrate=start env={:?} db_kind={:?} engine={} target={} store={} model={}",
        config.env,
        config.db_kind,
        get_db_engine(config.db_kind),
        config.sanitized_url(),
        config.store_dir.display(),
        config.model_path.display()
    );

    let artifact = generate_locked(config, &description).await?;

    let pool = build_admin_pool(config).await?;
    let result = apply_locked(&pool, config, &artifact).await;
    if let Err(e) = pool.close().await {
        warn!(error = %e, "Failed to close database connection");
    }

    migration_counters::log_snapshot("revision_orchestration");

    let (applied, marker) = result?;
    info!(
        "migrate=done revision={} applied={} marker={}",
        artifact.revision,
        applied.len(),
        marker.as_deref().unwrap_or("<base>")
    );

    Ok(RevisionOutcome {
        artifact,
        applied,
        marker,
    })
}

async fn generate_locked(
    config: &MigrateConfig,
    description: &Description,
) -> Result<Artifact, DbInfraError> {
    let store = ArtifactStore::new(&config.store_dir);
    let model = ModelFile::new(&config.model_path);

    let mut lock = FileLock::new(&config.store_lock_path());
    let guard = acquire_with_backoff(&mut lock, config.lock_timeout).await?;
    let generated = generate(&store, &model, description.as_str());
    release_guard(guard, "artifact store").await;

    let artifact = generated?;
    migration_counters::artifact_generated();
    Ok(artifact)
}

async fn apply_locked(
    pool: &DatabaseConnection,
    config: &MigrateConfig,
    generated: &Artifact,
) -> Result<(Vec<String>, Option<String>), DbInfraError> {
    match config.db_kind {
        DbKind::Postgres => {
            let key = format!("migration:apply:{}", config.sanitized_url());
            let lock = PgAdvisoryLock::new(pool.clone(), &key);
            apply_with_lock(pool, lock, config, generated).await
        }
        DbKind::SqliteFile => {
            let lock = FileLock::new(&config.sqlite_lock_path()?);
            apply_with_lock(pool, lock, config, generated).await
        }
        DbKind::SqliteMemory => apply_with_lock(pool, InMemoryLock, config, generated).await,
    }
}

async fn apply_with_lock<L>(
    pool: &DatabaseConnection,
    mut lock: L,
    config: &MigrateConfig,
    generated: &Artifact,
) -> Result<(Vec<String>, Option<String>), DbInfraError>
where
    L: BootstrapLock,
{
    info!(
        acquire_ms = config.lock_timeout.as_millis() as u64,
        lock = %lock.describe(),
        "migration lock configured"
    );

    let guard = acquire_with_backoff(&mut lock, config.lock_timeout).await?;
    let result = apply_under_guard(pool, config, generated).await;
    release_guard(guard, "database").await;
    result
}

async fn apply_under_guard(
    pool: &DatabaseConnection,
    config: &MigrateConfig,
    generated: &Artifact,
) -> Result<(Vec<String>, Option<String>), DbInfraError> {
    let start = Instant::now();

    if matches!(config.db_kind, DbKind::SqliteFile) {
        setup_sqlite_file_prerequisites(pool).await?;
    }

    let store = ArtifactStore::new(&config.store_dir);
    let applied = match apply(pool, &store).await {
        Ok(applied) => applied,
        Err(e) => {
            migration_counters::apply_failed();
            let message = e.to_string();
            if message.contains("database is locked") || message.contains("SQLITE_BUSY") {
                migration_counters::busy_event();
                error!("sqlite_busy op=apply err={}", message);
            }
            return Err(e.into());
        }
    };
    migration_counters::add_artifacts_applied(applied.len());

    info!(
        migrator = "ran",
        applied = applied.len(),
        elapsed_ms = start.elapsed().as_millis()
    );

    let marker = post_check(pool, &store, generated).await?;
    Ok((applied, marker))
}

/// The marker must have reached the revision generated by this run. Drift
/// between the live schema and the marker's schema is reported, not fatal.
async fn post_check(
    pool: &DatabaseConnection,
    store: &ArtifactStore,
    generated: &Artifact,
) -> Result<Option<String>, DbInfraError> {
    let chain = Chain::build(store.load()?)?;
    let ordered = chain.ordered()?;
    let marker = current_revision(pool).await?;

    let position = |revision: &str| ordered.iter().position(|a| a.revision == revision);
    let reached = match (marker.as_deref().and_then(position), position(&generated.revision)) {
        (Some(at), Some(target)) => at >= target,
        _ => false,
    };
    if !reached {
        migration_counters::postcheck_mismatch();
        return Err(DbInfraError::PostCheck {
            message: format!(
                "expected the database at or past revision {}, but the marker is at {}",
                generated.revision,
                marker.as_deref().unwrap_or("<base>")
            ),
        });
    }

    let expected = expected_tables(&chain.schema_at(marker.as_deref())?);
    match live_tables(pool).await {
        Ok(live) => {
            for finding in drift(&live, &expected) {
                warn!(drift = %finding, "live schema differs from the recorded schema");
            }
        }
        Err(e) => warn!(error = %e, "skipping drift check"),
    }

    Ok(marker)
}

async fn setup_sqlite_file_prerequisites(pool: &DatabaseConnection) -> Result<(), DbInfraError> {
    for pragma in ["PRAGMA journal_mode = WAL;", "PRAGMA synchronous = NORMAL;"] {
        pool.execute(Statement::from_string(pool.get_database_backend(), pragma))
            .await
            .map_err(|e| DbInfraError::Connect {
                message: format!("failed to apply `{pragma}`: {e}"),
            })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn retry_connection_gives_up_with_last_error() {
        let mut calls = 0;
        let result: Result<(), DbInfraError> = retry_connection(
            || {
                calls += 1;
                let n = calls;
                async move {
                    Err(DbInfraError::Connect {
                        message: format!("attempt {n}"),
                    })
                }
            },
            3,
            1,
        )
        .await;
        assert_eq!(calls, 3);
        assert!(result.unwrap_err().to_string().contains("attempt 3"));
    }

    #[tokio::test]
    async fn retry_connection_returns_first_success() {
        let mut calls = 0;
        let result = retry_connection(
            || {
                calls += 1;
                let n = calls;
                async move {
                    if n < 2 {
                        Err(DbInfraError::Connect {
                            message: "not yet".to_string(),
                        })
                    } else {
                        Ok(n)
                    }
                }
            },
            5,
            1,
        )
        .await
        .unwrap();
        assert_eq!(result, 2);
    }
}
