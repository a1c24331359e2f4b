use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Version of the schema document layout itself, stored alongside every
/// schema in destination bookkeeping tables.
pub const SCHEMA_ENGINE_VERSION: u32 = 1;

/// Policy governing whether newly produced rows append to or replace
/// existing destination data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WriteDisposition {
    #[default]
    Append,
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Bigint,
    Double,
    Bool,
    Text,
    Timestamp,
    Json,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Bigint => "bigint",
            ColumnType::Double => "double",
            ColumnType::Bool => "bool",
            ColumnType::Text => "text",
            ColumnType::Timestamp => "timestamp",
            ColumnType::Json => "json",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: ColumnType,
    pub nullable: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
        }
    }
}

/// Schema of a single destination table. Columns are kept in a `BTreeMap`
/// so serialization and hashing are deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub write_disposition: WriteDisposition,
    /// Parent table name for child tables produced from nested lists.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parent: Option<String>,
    pub columns: BTreeMap<String, Column>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, write_disposition: WriteDisposition) -> Self {
        Self {
            name: name.into(),
            write_disposition,
            parent: None,
            columns: BTreeMap::new(),
        }
    }

    /// Columns present here but missing from `existing`, in name order.
    /// Types of columns already present are never revisited.
    pub fn new_columns(&self, existing: &BTreeMap<String, Column>) -> Vec<Column> {
        self.columns
            .values()
            .filter(|c| !existing.contains_key(&c.name))
            .cloned()
            .collect()
    }
}

/// The stored schema of one pipeline: every known table plus a version
/// counter and content hash used by destinations to skip redundant
/// migrations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    pub name: String,
    pub version: u32,
    pub version_hash: String,
    pub tables: BTreeMap<String, TableSchema>,
}

impl Schema {
    pub fn new(name: impl Into<String>) -> Self {
        let mut schema = Self {
            name: name.into(),
            version: 0,
            version_hash: String::new(),
            tables: BTreeMap::new(),
        };
        schema.version_hash = schema.content_hash();
        schema
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(name)
    }

    /// Merges `incoming` into the schema, adding new tables and new columns
    /// only. Returns the delta that was applied: `(table, added columns)`
    /// pairs, with a table's full column list when the table itself is new.
    pub fn merge_table(&mut self, incoming: TableSchema) -> Vec<(String, Vec<Column>)> {
        let mut delta = Vec::new();
        match self.tables.get_mut(&incoming.name) {
            Some(existing) => {
                let added = incoming.new_columns(&existing.columns);
                if !added.is_empty() {
                    for column in &added {
                        existing.columns.insert(column.name.clone(), column.clone());
                    }
                    delta.push((incoming.name.clone(), added));
                }
            }
            None => {
                let added: Vec<Column> = incoming.columns.values().cloned().collect();
                delta.push((incoming.name.clone(), added));
                self.tables.insert(incoming.name.clone(), incoming);
            }
        }
        delta
    }

    /// Recomputes the content hash and bumps the version when the schema
    /// actually changed. Call after a batch of merges.
    pub fn bump_version(&mut self) -> bool {
        let hash = self.content_hash();
        if hash != self.version_hash {
            self.version += 1;
            self.version_hash = hash;
            true
        } else {
            false
        }
    }

    fn content_hash(&self) -> String {
        // Hash name and tables only; version fields must not feed the hash.
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        let tables = serde_json::to_string(&self.tables).unwrap_or_default();
        hasher.update(tables.as_bytes());
        hex::encode(&hasher.finalize()[..16])
    }
}
