//! Schema Version Marker: a single-row table recording the last applied revision.

use sea_orm::{ConnectionTrait, DatabaseBackend, DbErr, Statement};
use sea_orm_migration::prelude::*;

use crate::error::MigrationError;
use crate::schema::MARKER_TABLE;

#[derive(Iden)]
enum SchemaVersion {
    Table,
    Id,
    Revision,
    AppliedAt,
}

const MARKER_ROW: i32 = 1;

/// Create the marker table and its row if this database has never been migrated.
pub async fn ensure<C: ConnectionTrait>(db: &C) -> Result<(), MigrationError> {
    let backend = db.get_database_backend();

    let create = Table::create()
        .table(SchemaVersion::Table)
        .if_not_exists()
        .col(
            ColumnDef::new(SchemaVersion::Id)
                .integer()
                .not_null()
                .primary_key(),
        )
        .col(ColumnDef::new(SchemaVersion::Revision).string_len(64).null())
        .col(ColumnDef::new(SchemaVersion::AppliedAt).timestamp().null())
        .to_owned();
    db.execute(backend.build(&create)).await?;

    let mut seed = Query::insert();
    seed.into_table(SchemaVersion::Table)
        .columns([SchemaVersion::Id])
        .values([MARKER_ROW.into()])
        .map_err(|e| DbErr::Custom(format!("failed to build marker seed row: {e}")))?
        .on_conflict(
            OnConflict::column(SchemaVersion::Id)
                .do_nothing()
                .to_owned(),
        );
    db.execute(backend.build(&seed)).await?;

    Ok(())
}

async fn table_exists<C: ConnectionTrait>(db: &C) -> Result<bool, MigrationError> {
    let backend = db.get_database_backend();
    let sql = match backend {
        DatabaseBackend::Postgres => {
            "SELECT COUNT(*) AS present FROM information_schema.tables \
             WHERE table_schema = current_schema() AND table_name = $1"
        }
        DatabaseBackend::Sqlite => {
            "SELECT COUNT(*) AS present FROM sqlite_master WHERE type = 'table' AND name = ?"
        }
        DatabaseBackend::MySql => {
            "SELECT COUNT(*) AS present FROM information_schema.tables \
             WHERE table_schema = DATABASE() AND table_name = ?"
        }
    };
    let row = db
        .query_one(Statement::from_sql_and_values(backend, sql, [MARKER_TABLE.into()]))
        .await?;
    let present = match row {
        Some(row) => row.try_get::<i64>("", "present")? > 0,
        None => false,
    };
    Ok(present)
}

/// Last applied revision; `None` when nothing was applied or the table is absent.
///
/// Any failure other than a missing table is returned, so a busy or damaged
/// database is never mistaken for an unmigrated one.
pub async fn read<C: ConnectionTrait>(db: &C) -> Result<Option<String>, MigrationError> {
    if !table_exists(db).await? {
        return Ok(None);
    }

    let backend = db.get_database_backend();
    let select = Query::select()
        .column(SchemaVersion::Revision)
        .from(SchemaVersion::Table)
        .and_where(Expr::col(SchemaVersion::Id).eq(MARKER_ROW))
        .to_owned();

    match db.query_one(backend.build(&select)).await? {
        Some(row) => Ok(row.try_get::<Option<String>>("", "revision")?),
        None => Ok(None),
    }
}

/// Move the marker from `expected` to `next`.
///
/// Compare-and-swap: the update only matches when the stored value still
/// equals `expected`, so a concurrent writer surfaces as a chain error
/// instead of a silently lost update.
pub async fn advance<C: ConnectionTrait>(
    db: &C,
    expected: Option<&str>,
    next: Option<&str>,
) -> Result<(), MigrationError> {
    let backend = db.get_database_backend();
    let current_matches = match expected {
        Some(revision) => Expr::col(SchemaVersion::Revision).eq(revision),
        None => Expr::col(SchemaVersion::Revision).is_null(),
    };

    let update = Query::update()
        .table(SchemaVersion::Table)
        .values([
            (SchemaVersion::Revision, next.map(str::to_string).into()),
            (SchemaVersion::AppliedAt, Expr::current_timestamp().into()),
        ])
        .and_where(Expr::col(SchemaVersion::Id).eq(MARKER_ROW))
        .and_where(current_matches)
        .to_owned();

    let result = db.execute(backend.build(&update)).await?;
    if result.rows_affected() != 1 {
        return Err(MigrationError::chain(format!(
            "schema version marker is no longer at {}; another runner moved it",
            expected.unwrap_or("<base>")
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::{ConnectOptions, Database, DatabaseConnection};

    async fn memory_db() -> DatabaseConnection {
        let mut opt = ConnectOptions::new("sqlite::memory:");
        opt.min_connections(1).max_connections(1).sqlx_logging(false);
        Database::connect(opt).await.unwrap()
    }

    #[tokio::test]
    async fn read_before_ensure_is_none() {
        let db = memory_db().await;
        assert_eq!(read(&db).await.unwrap(), None);
    }

    #[tokio::test]
    async fn ensure_is_idempotent_and_starts_at_base() {
        let db = memory_db().await;
        ensure(&db).await.unwrap();
        ensure(&db).await.unwrap();
        assert_eq!(read(&db).await.unwrap(), None);
    }

    #[tokio::test]
    async fn advance_is_compare_and_swap() {
        let db = memory_db().await;
        ensure(&db).await.unwrap();

        advance(&db, None, Some("aaaaaaaaaaaa")).await.unwrap();
        assert_eq!(read(&db).await.unwrap().as_deref(), Some("aaaaaaaaaaaa"));

        // Stale expectation: marker is no longer at the base.
        let err = advance(&db, None, Some("bbbbbbbbbbbb")).await.unwrap_err();
        assert!(matches!(err, MigrationError::Chain { .. }));
        assert_eq!(read(&db).await.unwrap().as_deref(), Some("aaaaaaaaaaaa"));

        advance(&db, Some("aaaaaaaaaaaa"), None).await.unwrap();
        assert_eq!(read(&db).await.unwrap(), None);
    }

    #[tokio::test]
    async fn unreadable_marker_table_is_an_error() {
        let db = memory_db().await;
        db.execute(Statement::from_string(
            db.get_database_backend(),
            "CREATE TABLE schema_version (id INTEGER PRIMARY KEY, version TEXT)",
        ))
        .await
        .unwrap();

        let err = read(&db).await.unwrap_err();
        assert!(matches!(err, MigrationError::Db(_)), "unexpected error: {err}");
    }
}
