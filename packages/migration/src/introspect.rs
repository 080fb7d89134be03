use std::collections::BTreeMap;

use sea_orm::{ConnectionTrait, DatabaseBackend, Statement};

use crate::error::MigrationError;
use crate::schema::{SchemaSnapshot, MARKER_TABLE};

/// Table name -> column names as the live database reports them.
pub type LiveTables = BTreeMap<String, Vec<String>>;

pub async fn live_tables<C: ConnectionTrait>(db: &C) -> Result<LiveTables, MigrationError> {
    let backend = db.get_database_backend();
    let sql = match backend {
        DatabaseBackend::Postgres => {
            "SELECT table_name::text AS table_name, column_name::text AS column_name \
             FROM information_schema.columns \
             WHERE table_schema = current_schema() \
             ORDER BY table_name, ordinal_position"
        }
        DatabaseBackend::Sqlite => {
            "SELECT m.name AS table_name, p.name AS column_name \
             FROM sqlite_master m JOIN pragma_table_info(m.name) p \
             WHERE m.type = 'table' AND m.name NOT LIKE 'sqlite_%' \
             ORDER BY m.name, p.cid"
        }
        DatabaseBackend::MySql => {
            return Err(MigrationError::generation(
                "MySQL introspection is not supported, only SQLite and PostgreSQL",
            ))
        }
    };

    let rows = db.query_all(Statement::from_string(backend, sql)).await?;
    let mut tables = LiveTables::new();
    for row in rows {
        let table: String = row.try_get("", "table_name")?;
        let column: String = row.try_get("", "column_name")?;
        if table == MARKER_TABLE {
            continue;
        }
        tables.entry(table).or_default().push(column);
    }
    Ok(tables)
}

/// Same shape as [`live_tables`], derived from a snapshot.
pub fn expected_tables(snapshot: &SchemaSnapshot) -> LiveTables {
    snapshot
        .tables
        .values()
        .map(|t| {
            (
                t.name.clone(),
                t.columns.iter().map(|c| c.name.clone()).collect(),
            )
        })
        .collect()
}

/// Human-readable differences between the live database and a snapshot,
/// compared by table and column names.
pub fn drift(live: &LiveTables, expected: &LiveTables) -> Vec<String> {
    let mut findings = Vec::new();
    for (table, columns) in expected {
        match live.get(table) {
            None => findings.push(format!("table {table} is missing")),
            Some(live_columns) => {
                for column in columns {
                    if !live_columns.contains(column) {
                        findings.push(format!("column {table}.{column} is missing"));
                    }
                }
                for column in live_columns {
                    if !columns.contains(column) {
                        findings.push(format!("column {table}.{column} is not tracked"));
                    }
                }
            }
        }
    }
    for table in live.keys() {
        if !expected.contains_key(table) {
            findings.push(format!("table {table} is not tracked"));
        }
    }
    findings
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables(entries: &[(&str, &[&str])]) -> LiveTables {
        entries
            .iter()
            .map(|(t, cols)| (t.to_string(), cols.iter().map(|c| c.to_string()).collect()))
            .collect()
    }

    #[test]
    fn drift_reports_both_directions() {
        let live = tables(&[("users", &["id", "email", "extra"]), ("stray", &["id"])]);
        let expected = tables(&[("users", &["id", "email", "username"]), ("posts", &["id"])]);

        let findings = drift(&live, &expected);
        assert_eq!(
            findings,
            vec![
                "table posts is missing",
                "column users.username is missing",
                "column users.extra is not tracked",
                "table stray is not tracked",
            ]
        );
        assert!(drift(&expected, &expected).is_empty());
    }
}
