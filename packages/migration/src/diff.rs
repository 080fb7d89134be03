//! Autogenerate: compare a recorded snapshot with the declared one.

use crate::ops::SchemaOp;
use crate::schema::{SchemaSnapshot, TableDef};

/// Operations that turn `current` into `declared`.
///
/// Order is deterministic: new tables first (by name), then per-table column
/// and index changes, then dropped tables. Equal snapshots give an empty list.
pub fn diff(current: &SchemaSnapshot, declared: &SchemaSnapshot) -> Vec<SchemaOp> {
    let mut created = Vec::new();
    let mut altered = Vec::new();
    let mut dropped = Vec::new();

    for (name, wanted) in &declared.tables {
        match current.tables.get(name) {
            None => created.push(SchemaOp::CreateTable {
                table: wanted.clone(),
            }),
            Some(existing) => diff_table(existing, wanted, &mut altered),
        }
    }

    for (name, existing) in &current.tables {
        if !declared.tables.contains_key(name) {
            dropped.push(SchemaOp::DropTable {
                table: existing.clone(),
            });
        }
    }

    created.extend(altered);
    created.extend(dropped);
    created
}

fn diff_table(existing: &TableDef, wanted: &TableDef, out: &mut Vec<SchemaOp>) {
    let table = &wanted.name;

    // Indexes go first so that dropped columns are no longer referenced.
    for index in &existing.indexes {
        match wanted.find_index(&index.name) {
            Some(same) if same == index => {}
            _ => out.push(SchemaOp::DropIndex {
                table: table.clone(),
                index: index.clone(),
            }),
        }
    }

    for column in &wanted.columns {
        match existing.find_column(&column.name) {
            None => out.push(SchemaOp::AddColumn {
                table: table.clone(),
                column: column.clone(),
            }),
            Some(old) if old != column => out.push(SchemaOp::AlterColumn {
                table: table.clone(),
                from: old.clone(),
                to: column.clone(),
            }),
            Some(_) => {}
        }
    }

    for column in &existing.columns {
        if wanted.find_column(&column.name).is_none() {
            out.push(SchemaOp::DropColumn {
                table: table.clone(),
                column: column.clone(),
            });
        }
    }

    for index in &wanted.indexes {
        match existing.find_index(&index.name) {
            Some(same) if same == index => {}
            _ => out.push(SchemaOp::CreateIndex {
                table: table.clone(),
                index: index.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::invert;
    use crate::schema::{ColumnDef, ColumnType, IndexDef};

    fn users() -> TableDef {
        TableDef::new("users")
            .column(
                ColumnDef::new("id", ColumnType::Integer)
                    .primary_key()
                    .auto_increment(),
            )
            .column(ColumnDef::new("email", ColumnType::Varchar(254)).not_null())
    }

    fn replay(base: &SchemaSnapshot, ops: &[SchemaOp]) -> SchemaSnapshot {
        let mut snapshot = base.clone();
        for op in ops {
            snapshot.apply_op(op).unwrap();
        }
        snapshot
    }

    #[test]
    fn equal_snapshots_produce_no_ops() {
        let snapshot = SchemaSnapshot::new().with_table(users());
        assert!(diff(&snapshot, &snapshot).is_empty());
    }

    #[test]
    fn new_table_is_created() {
        let declared = SchemaSnapshot::new().with_table(users());
        let ops = diff(&SchemaSnapshot::new(), &declared);
        assert_eq!(ops.len(), 1);
        assert!(matches!(&ops[0], SchemaOp::CreateTable { table } if table.name == "users"));
    }

    #[test]
    fn column_changes_are_detected() {
        let current = SchemaSnapshot::new().with_table(
            users().column(ColumnDef::new("legacy", ColumnType::Text)),
        );
        let mut changed = users();
        changed.columns[1] = ColumnDef::new("email", ColumnType::Varchar(320)).not_null();
        let declared = SchemaSnapshot::new().with_table(
            changed.column(ColumnDef::new("username", ColumnType::Varchar(50))),
        );

        let ops = diff(&current, &declared);
        let rendered: Vec<String> = ops.iter().map(|op| op.to_string()).collect();
        assert_eq!(
            rendered,
            vec![
                "alter column users.email varchar(254) -> varchar(320)",
                "add column users.username varchar(50)",
                "drop column users.legacy",
            ]
        );
    }

    #[test]
    fn index_changes_drop_before_create() {
        let current = SchemaSnapshot::new()
            .with_table(users().index(IndexDef::new("ix_users_email", &["email"])));
        let declared = SchemaSnapshot::new()
            .with_table(users().index(IndexDef::new("ix_users_email", &["email"]).unique()));

        let ops = diff(&current, &declared);
        assert_eq!(ops.len(), 2);
        assert!(matches!(ops[0], SchemaOp::DropIndex { .. }));
        assert!(matches!(ops[1], SchemaOp::CreateIndex { .. }));
    }

    #[test]
    fn dropped_tables_come_last() {
        let current = SchemaSnapshot::new()
            .with_table(TableDef::new("audit").column(ColumnDef::new("id", ColumnType::Integer)));
        let declared = SchemaSnapshot::new().with_table(users());

        let ops = diff(&current, &declared);
        assert!(matches!(ops.first(), Some(SchemaOp::CreateTable { .. })));
        assert!(matches!(ops.last(), Some(SchemaOp::DropTable { .. })));
    }

    #[test]
    fn diff_then_inverse_restores_snapshot() {
        let current = SchemaSnapshot::new()
            .with_table(users().column(ColumnDef::new("legacy", ColumnType::Text)))
            .with_table(TableDef::new("audit").column(ColumnDef::new("id", ColumnType::Integer)));
        let declared = SchemaSnapshot::new()
            .with_table(users().index(IndexDef::new("ix_users_email", &["email"]).unique()))
            .with_table(
                TableDef::new("posts").column(ColumnDef::new("id", ColumnType::BigInteger)),
            );

        let ops = diff(&current, &declared);
        let upgraded = replay(&current, &ops);
        assert_eq!(upgraded, declared);
        assert_eq!(replay(&upgraded, &invert(&ops)), current);
    }
}
