//! Declared data model.
//!
//! A [`SchemaSnapshot`] is the structural picture of a database: tables,
//! their columns and their indexes. The declared model (what the schema
//! should look like) and the recorded model (what the artifact chain has
//! produced so far) are both snapshots, and the diff between them is what a
//! new artifact captures.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::MigrationError;
use crate::ops::SchemaOp;

/// Name of the table the runner keeps its marker in. Declared models may not use it.
pub const MARKER_TABLE: &str = "schema_version";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    BigInteger,
    Varchar(u32),
    Text,
    Boolean,
    Float,
    Double,
    Timestamp,
    TimestampTz,
    Date,
    Uuid,
    Json,
    Binary,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Integer => write!(f, "integer"),
            ColumnType::BigInteger => write!(f, "big_integer"),
            ColumnType::Varchar(len) => write!(f, "varchar({len})"),
            ColumnType::Text => write!(f, "text"),
            ColumnType::Boolean => write!(f, "boolean"),
            ColumnType::Float => write!(f, "float"),
            ColumnType::Double => write!(f, "double"),
            ColumnType::Timestamp => write!(f, "timestamp"),
            ColumnType::TimestampTz => write!(f, "timestamp_tz"),
            ColumnType::Date => write!(f, "date"),
            ColumnType::Uuid => write!(f, "uuid"),
            ColumnType::Json => write!(f, "json"),
            ColumnType::Binary => write!(f, "binary"),
        }
    }
}

fn default_nullable() -> bool {
    true
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub primary_key: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub auto_increment: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub unique: bool,
    /// Raw SQL default expression, emitted verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
            primary_key: false,
            auto_increment: false,
            unique: false,
            default: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn default_expr(mut self, expr: impl Into<String>) -> Self {
        self.default = Some(expr.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    pub columns: Vec<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub unique: bool,
}

impl IndexDef {
    pub fn new(name: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            name: name.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub indexes: Vec<IndexDef>,
}

impl TableDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            indexes: Vec::new(),
        }
    }

    pub fn column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    pub fn index(mut self, index: IndexDef) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn find_column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn find_index(&self, name: &str) -> Option<&IndexDef> {
        self.indexes.iter().find(|i| i.name == name)
    }
}

/// Structural picture of a schema, keyed by table name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    #[serde(with = "table_list")]
    pub tables: BTreeMap<String, TableDef>,
}

/// The model file lists tables as an array; the snapshot keys them by name.
mod table_list {
    use std::collections::BTreeMap;

    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::TableDef;

    pub fn serialize<S: Serializer>(
        tables: &BTreeMap<String, TableDef>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let list: Vec<&TableDef> = tables.values().collect();
        list.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, TableDef>, D::Error> {
        let list = Vec::<TableDef>::deserialize(deserializer)?;
        let mut tables = BTreeMap::new();
        for table in list {
            let name = table.name.clone();
            if tables.insert(name.clone(), table).is_some() {
                return Err(D::Error::custom(format!("table '{name}' declared twice")));
            }
        }
        Ok(tables)
    }
}

fn valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl SchemaSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, table: TableDef) -> Self {
        self.tables.insert(table.name.clone(), table);
        self
    }

    pub fn table(&self, name: &str) -> Option<&TableDef> {
        self.tables.get(name)
    }

    /// Check the structural rules every declared model has to satisfy.
    pub fn validate(&self) -> Result<(), MigrationError> {
        let mut index_names = BTreeSet::new();

        for (key, table) in &self.tables {
            if key != &table.name {
                return Err(MigrationError::generation(format!(
                    "table keyed as '{key}' is named '{}'",
                    table.name
                )));
            }
            if !valid_identifier(&table.name) {
                return Err(MigrationError::generation(format!(
                    "invalid table name '{}'",
                    table.name
                )));
            }
            if table.name == MARKER_TABLE {
                return Err(MigrationError::generation(format!(
                    "table name '{MARKER_TABLE}' is reserved for the schema version marker"
                )));
            }
            if table.columns.is_empty() {
                return Err(MigrationError::generation(format!(
                    "table '{}' has no columns",
                    table.name
                )));
            }

            let mut column_names = BTreeSet::new();
            for column in &table.columns {
                if !valid_identifier(&column.name) {
                    return Err(MigrationError::generation(format!(
                        "invalid column name '{}.{}'",
                        table.name, column.name
                    )));
                }
                if !column_names.insert(column.name.as_str()) {
                    return Err(MigrationError::generation(format!(
                        "column '{}.{}' declared twice",
                        table.name, column.name
                    )));
                }
                if column.auto_increment && !column.primary_key {
                    return Err(MigrationError::generation(format!(
                        "auto-increment column '{}.{}' must be the primary key",
                        table.name, column.name
                    )));
                }
            }

            let primary_keys = table.columns.iter().filter(|c| c.primary_key).count();
            if primary_keys > 1 {
                return Err(MigrationError::generation(format!(
                    "table '{}' declares {primary_keys} primary key columns; composite keys are not supported",
                    table.name
                )));
            }

            for index in &table.indexes {
                if !valid_identifier(&index.name) {
                    return Err(MigrationError::generation(format!(
                        "invalid index name '{}'",
                        index.name
                    )));
                }
                // Index names share one namespace per database.
                if !index_names.insert(index.name.as_str()) {
                    return Err(MigrationError::generation(format!(
                        "index '{}' declared twice",
                        index.name
                    )));
                }
                if index.columns.is_empty() {
                    return Err(MigrationError::generation(format!(
                        "index '{}' has no columns",
                        index.name
                    )));
                }
                if let Some(missing) = index
                    .columns
                    .iter()
                    .find(|c| !column_names.contains(c.as_str()))
                {
                    return Err(MigrationError::generation(format!(
                        "index '{}' references unknown column '{}.{missing}'",
                        index.name, table.name
                    )));
                }
            }
        }

        Ok(())
    }

    /// Replay one structural operation onto this snapshot.
    ///
    /// Returns a message describing the inconsistency when the operation does
    /// not fit the snapshot (e.g. creating a table that already exists).
    pub fn apply_op(&mut self, op: &SchemaOp) -> Result<(), String> {
        match op {
            SchemaOp::CreateTable { table } => {
                if self.tables.contains_key(&table.name) {
                    return Err(format!("table '{}' already exists", table.name));
                }
                self.tables.insert(table.name.clone(), table.clone());
            }
            SchemaOp::DropTable { table } => {
                if self.tables.remove(&table.name).is_none() {
                    return Err(format!("table '{}' does not exist", table.name));
                }
            }
            SchemaOp::AddColumn { table, column } => {
                let target = self.table_mut(table)?;
                if target.find_column(&column.name).is_some() {
                    return Err(format!("column '{table}.{}' already exists", column.name));
                }
                target.columns.push(column.clone());
            }
            SchemaOp::DropColumn { table, column } => {
                let target = self.table_mut(table)?;
                let before = target.columns.len();
                target.columns.retain(|c| c.name != column.name);
                if target.columns.len() == before {
                    return Err(format!("column '{table}.{}' does not exist", column.name));
                }
            }
            SchemaOp::AlterColumn { table, from, to } => {
                let target = self.table_mut(table)?;
                let slot = target
                    .columns
                    .iter_mut()
                    .find(|c| c.name == from.name)
                    .ok_or_else(|| format!("column '{table}.{}' does not exist", from.name))?;
                *slot = to.clone();
            }
            SchemaOp::CreateIndex { table, index } => {
                let target = self.table_mut(table)?;
                if target.find_index(&index.name).is_some() {
                    return Err(format!("index '{}' already exists", index.name));
                }
                target.indexes.push(index.clone());
            }
            SchemaOp::DropIndex { table, index } => {
                let target = self.table_mut(table)?;
                let before = target.indexes.len();
                target.indexes.retain(|i| i.name != index.name);
                if target.indexes.len() == before {
                    return Err(format!("index '{}' does not exist", index.name));
                }
            }
        }
        Ok(())
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut TableDef, String> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| format!("table '{name}' does not exist"))
    }
}

/// Source of the declared data model consumed by `generate`.
pub trait ModelSource {
    fn declared(&self) -> Result<SchemaSnapshot, MigrationError>;
}

impl ModelSource for SchemaSnapshot {
    fn declared(&self) -> Result<SchemaSnapshot, MigrationError> {
        Ok(self.clone())
    }
}

/// Declared model stored as a JSON file (`{"tables": [...]}`).
#[derive(Debug, Clone)]
pub struct ModelFile {
    path: PathBuf,
}

impl ModelFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ModelSource for ModelFile {
    fn declared(&self) -> Result<SchemaSnapshot, MigrationError> {
        let raw = std::fs::read_to_string(&self.path).map_err(|e| {
            MigrationError::generation(format!(
                "cannot read model file {}: {e}",
                self.path.display()
            ))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            MigrationError::generation(format!(
                "cannot parse model file {}: {e}",
                self.path.display()
            ))
        })
    }
}
