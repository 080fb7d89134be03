use std::fmt;

use sea_orm::sea_query::{Alias, ColumnDef as SeaColumnDef, Expr, Index, Table};
use sea_orm::{DatabaseBackend, Statement};
use serde::{Deserialize, Serialize};

use crate::schema::{ColumnDef, ColumnType, IndexDef, TableDef};

/// One structural change. Each variant carries the full definitions it
/// touches so that [`SchemaOp::inverse`] is exact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SchemaOp {
    CreateTable { table: TableDef },
    DropTable { table: TableDef },
    AddColumn { table: String, column: ColumnDef },
    DropColumn { table: String, column: ColumnDef },
    AlterColumn { table: String, from: ColumnDef, to: ColumnDef },
    CreateIndex { table: String, index: IndexDef },
    DropIndex { table: String, index: IndexDef },
}

impl SchemaOp {
    pub fn inverse(&self) -> SchemaOp {
        match self {
            SchemaOp::CreateTable { table } => SchemaOp::DropTable {
                table: table.clone(),
            },
            SchemaOp::DropTable { table } => SchemaOp::CreateTable {
                table: table.clone(),
            },
            SchemaOp::AddColumn { table, column } => SchemaOp::DropColumn {
                table: table.clone(),
                column: column.clone(),
            },
            SchemaOp::DropColumn { table, column } => SchemaOp::AddColumn {
                table: table.clone(),
                column: column.clone(),
            },
            SchemaOp::AlterColumn { table, from, to } => SchemaOp::AlterColumn {
                table: table.clone(),
                from: to.clone(),
                to: from.clone(),
            },
            SchemaOp::CreateIndex { table, index } => SchemaOp::DropIndex {
                table: table.clone(),
                index: index.clone(),
            },
            SchemaOp::DropIndex { table, index } => SchemaOp::CreateIndex {
                table: table.clone(),
                index: index.clone(),
            },
        }
    }

    pub fn table_name(&self) -> &str {
        match self {
            SchemaOp::CreateTable { table } | SchemaOp::DropTable { table } => &table.name,
            SchemaOp::AddColumn { table, .. }
            | SchemaOp::DropColumn { table, .. }
            | SchemaOp::AlterColumn { table, .. }
            | SchemaOp::CreateIndex { table, .. }
            | SchemaOp::DropIndex { table, .. } => table,
        }
    }

    /// Render the operation as SQL statements for `backend`, in execution order.
    pub fn statements(&self, backend: DatabaseBackend) -> Result<Vec<Statement>, String> {
        let statements = match self {
            SchemaOp::CreateTable { table } => {
                let mut create = Table::create();
                create.table(Alias::new(&table.name));
                for column in &table.columns {
                    create.col(&mut column_statement(column));
                }
                let mut out = vec![backend.build(&create)];
                for index in &table.indexes {
                    out.push(backend.build(&create_index(&table.name, index)));
                }
                out
            }
            SchemaOp::DropTable { table } => {
                let drop = Table::drop().table(Alias::new(&table.name)).to_owned();
                vec![backend.build(&drop)]
            }
            SchemaOp::AddColumn { table, column } => {
                let alter = Table::alter()
                    .table(Alias::new(table))
                    .add_column(&mut column_statement(column))
                    .to_owned();
                vec![backend.build(&alter)]
            }
            SchemaOp::DropColumn { table, column } => {
                let alter = Table::alter()
                    .table(Alias::new(table))
                    .drop_column(Alias::new(&column.name))
                    .to_owned();
                vec![backend.build(&alter)]
            }
            SchemaOp::AlterColumn { table, from, to } => match backend {
                DatabaseBackend::Postgres => alter_column_postgres(table, from, to)?
                    .into_iter()
                    .map(|sql| Statement::from_string(backend, sql))
                    .collect(),
                _ => {
                    return Err(format!(
                        "{backend:?} cannot alter column '{table}.{}' in place",
                        from.name
                    ))
                }
            },
            SchemaOp::CreateIndex { table, index } => {
                vec![backend.build(&create_index(table, index))]
            }
            SchemaOp::DropIndex { index, .. } => {
                let drop = Index::drop().name(&index.name).to_owned();
                vec![backend.build(&drop)]
            }
        };
        Ok(statements)
    }
}

impl fmt::Display for SchemaOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaOp::CreateTable { table } => write!(f, "create table {}", table.name),
            SchemaOp::DropTable { table } => write!(f, "drop table {}", table.name),
            SchemaOp::AddColumn { table, column } => {
                write!(f, "add column {table}.{} {}", column.name, column.column_type)
            }
            SchemaOp::DropColumn { table, column } => {
                write!(f, "drop column {table}.{}", column.name)
            }
            SchemaOp::AlterColumn { table, from, to } => write!(
                f,
                "alter column {table}.{} {} -> {}",
                from.name, from.column_type, to.column_type
            ),
            SchemaOp::CreateIndex { table, index } => {
                write!(f, "create index {} on {table}", index.name)
            }
            SchemaOp::DropIndex { table, index } => {
                write!(f, "drop index {} on {table}", index.name)
            }
        }
    }
}

/// Inverse of an operation set: inverses in reverse order.
pub fn invert(ops: &[SchemaOp]) -> Vec<SchemaOp> {
    ops.iter().rev().map(SchemaOp::inverse).collect()
}

fn apply_type(def: &mut SeaColumnDef, column_type: ColumnType) {
    match column_type {
        ColumnType::Integer => def.integer(),
        ColumnType::BigInteger => def.big_integer(),
        ColumnType::Varchar(len) => def.string_len(len),
        ColumnType::Text => def.text(),
        ColumnType::Boolean => def.boolean(),
        ColumnType::Float => def.float(),
        ColumnType::Double => def.double(),
        ColumnType::Timestamp => def.timestamp(),
        ColumnType::TimestampTz => def.timestamp_with_time_zone(),
        ColumnType::Date => def.date(),
        ColumnType::Uuid => def.uuid(),
        ColumnType::Json => def.json(),
        ColumnType::Binary => def.binary(),
    };
}

fn column_statement(column: &ColumnDef) -> SeaColumnDef {
    let mut def = SeaColumnDef::new(Alias::new(&column.name));
    apply_type(&mut def, column.column_type);
    if column.nullable && !column.primary_key {
        def.null();
    } else {
        def.not_null();
    }
    if column.primary_key {
        def.primary_key();
    }
    if column.auto_increment {
        def.auto_increment();
    }
    if column.unique && !column.primary_key {
        def.unique_key();
    }
    if let Some(expr) = &column.default {
        def.default(Expr::cust(expr.as_str()));
    }
    def
}

/// Name Postgres gives the constraint behind an inline `UNIQUE` column; alters
/// add and drop uniqueness under the same name.
pub fn unique_constraint_name(table: &str, column: &str) -> String {
    format!("{table}_{column}_key")
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn postgres_type(column_type: ColumnType) -> String {
    match column_type {
        ColumnType::Integer => "integer".to_string(),
        ColumnType::BigInteger => "bigint".to_string(),
        ColumnType::Varchar(len) => format!("varchar({len})"),
        ColumnType::Text => "text".to_string(),
        ColumnType::Boolean => "bool".to_string(),
        ColumnType::Float => "real".to_string(),
        ColumnType::Double => "double precision".to_string(),
        ColumnType::Timestamp => "timestamp without time zone".to_string(),
        ColumnType::TimestampTz => "timestamp with time zone".to_string(),
        ColumnType::Date => "date".to_string(),
        ColumnType::Uuid => "uuid".to_string(),
        ColumnType::Json => "json".to_string(),
        ColumnType::Binary => "bytea".to_string(),
    }
}

/// One clause per attribute that differs between `from` and `to`; rendering
/// the swapped pair undoes exactly what this pair did. Key and identity
/// changes need a table rebuild and are refused.
fn alter_column_postgres(
    table: &str,
    from: &ColumnDef,
    to: &ColumnDef,
) -> Result<Vec<String>, String> {
    if from.name != to.name {
        return Err(format!(
            "cannot rename column '{table}.{}' to '{}' in place",
            from.name, to.name
        ));
    }
    if from.primary_key != to.primary_key || from.auto_increment != to.auto_increment {
        return Err(format!(
            "cannot change primary key or auto increment of '{table}.{}' in place",
            from.name
        ));
    }

    let prefix = format!("ALTER TABLE {} ", quote(table));
    let column = quote(&to.name);
    let constraint = quote(&unique_constraint_name(table, &to.name));
    let from_unique = from.unique && !from.primary_key;
    let to_unique = to.unique && !to.primary_key;
    let mut out = Vec::new();

    if from_unique && !to_unique {
        out.push(format!("{prefix}DROP CONSTRAINT {constraint}"));
    }
    if from.column_type != to.column_type {
        let ty = postgres_type(to.column_type);
        out.push(format!("{prefix}ALTER COLUMN {column} TYPE {ty} USING {column}::{ty}"));
    }
    let from_nullable = from.nullable && !from.primary_key;
    let to_nullable = to.nullable && !to.primary_key;
    if from_nullable != to_nullable {
        let clause = if to_nullable { "DROP NOT NULL" } else { "SET NOT NULL" };
        out.push(format!("{prefix}ALTER COLUMN {column} {clause}"));
    }
    if from.default != to.default {
        match &to.default {
            Some(expr) => out.push(format!("{prefix}ALTER COLUMN {column} SET DEFAULT {expr}")),
            None => out.push(format!("{prefix}ALTER COLUMN {column} DROP DEFAULT")),
        }
    }
    if to_unique && !from_unique {
        out.push(format!("{prefix}ADD CONSTRAINT {constraint} UNIQUE ({column})"));
    }
    Ok(out)
}

fn create_index(table: &str, index: &IndexDef) -> sea_orm::sea_query::IndexCreateStatement {
    let mut create = Index::create();
    create.name(&index.name).table(Alias::new(table));
    for column in &index.columns {
        create.col(Alias::new(column));
    }
    if index.unique {
        create.unique();
    }
    create
}
