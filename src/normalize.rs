use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::{PipelineError, Result};
use crate::load::package::LoadPackage;
use crate::naming::{nested_identifier, normalize_identifier};
use crate::schema::{Column, ColumnType, Schema, TableSchema, WriteDisposition};
use crate::storage::PipelineStorage;

/// Name of the column holding scalar list items in child tables.
const VALUE_COLUMN: &str = "value";

#[derive(Debug, Clone)]
pub struct NormalizeInfo {
    pub load_id: String,
    pub table_rows: BTreeMap<String, u64>,
}

/// Flattens the extracted rows of a load package into relational rows,
/// evolves the stored schema with whatever new tables and columns showed
/// up, and stages the rows as load jobs inside the package.
///
/// Nested objects flatten into `parent__key` columns; nested lists become
/// child tables named `<table>__<path>` whose rows carry the parent row id
/// and their list position.
pub fn normalize(
    storage: &PipelineStorage,
    schema: &mut Schema,
    load_id: &str,
) -> Result<NormalizeInfo> {
    let package = LoadPackage::open(storage.package_dir(load_id), load_id)?;
    let dispositions = package.read_dispositions()?;

    let mut normalizer = Normalizer {
        schema: &*schema,
        load_id,
        out: BTreeMap::new(),
        inferred: BTreeMap::new(),
    };

    for (table, path) in package.extracted_tables()? {
        let disposition = dispositions.get(&table).copied().unwrap_or_default();
        let reader = BufReader::new(File::open(path)?);
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let item: Value = serde_json::from_str(&line)?;
            normalizer.add_row(table.clone(), disposition, None, item)?;
        }
    }

    let Normalizer { out, inferred, .. } = normalizer;

    for table in inferred.into_values() {
        schema.merge_table(table);
    }
    schema.bump_version();

    let mut table_rows = BTreeMap::new();
    for (table, rows) in &out {
        package.write_job(table, rows)?;
        table_rows.insert(table.clone(), rows.len() as u64);
    }
    package.write_schema(schema)?;
    package.clear_extracted()?;

    info!(
        load_id = %load_id,
        schema_version = schema.version,
        tables = table_rows.len(),
        "normalize finished"
    );
    Ok(NormalizeInfo {
        load_id: load_id.to_string(),
        table_rows,
    })
}

struct ParentLink {
    row_id: String,
    list_idx: usize,
}

struct Normalizer<'a> {
    schema: &'a Schema,
    load_id: &'a str,
    out: BTreeMap<String, Vec<Map<String, Value>>>,
    inferred: BTreeMap<String, TableSchema>,
}

impl Normalizer<'_> {
    fn add_row(
        &mut self,
        table: String,
        disposition: WriteDisposition,
        parent: Option<ParentLink>,
        item: Value,
    ) -> Result<()> {
        let obj = to_object(item);
        let mut flat = Map::new();
        let mut lists: Vec<(String, Vec<Value>)> = Vec::new();
        flatten_into(&table, "", &obj, &mut flat, &mut lists);

        let row_id = row_hash(&table, parent.as_ref(), &flat);
        flat.insert("_siphon_id".to_string(), Value::String(row_id.clone()));
        flat.insert(
            "_siphon_load_id".to_string(),
            Value::String(self.load_id.to_string()),
        );
        let parent_table = if let Some(link) = parent {
            flat.insert(
                "_siphon_parent_id".to_string(),
                Value::String(link.row_id),
            );
            flat.insert(
                "_siphon_list_idx".to_string(),
                Value::from(link.list_idx as u64),
            );
            // Child table names embed the parent path up to the last `__`.
            table
                .rsplit_once("__")
                .map(|(parent, _)| parent.to_string())
        } else {
            None
        };

        let mut row = Map::new();
        for (column, value) in flat {
            if value.is_null() {
                continue;
            }
            let coerced = self.coerce(&table, disposition, parent_table.as_deref(), &column, value)?;
            row.insert(column, coerced);
        }
        self.out.entry(table.clone()).or_default().push(row);

        for (child_table, items) in lists {
            for (idx, child_item) in items.into_iter().enumerate() {
                self.add_row(
                    child_table.clone(),
                    disposition,
                    Some(ParentLink {
                        row_id: row_id.clone(),
                        list_idx: idx,
                    }),
                    child_item,
                )?;
            }
        }
        Ok(())
    }

    /// Applies the stored column type when the column is already known,
    /// otherwise infers a type from the first value seen and records it.
    fn coerce(
        &mut self,
        table: &str,
        disposition: WriteDisposition,
        parent_table: Option<&str>,
        column: &str,
        value: Value,
    ) -> Result<Value> {
        let existing = self
            .schema
            .table(table)
            .and_then(|t| t.columns.get(column))
            .or_else(|| self.inferred.get(table).and_then(|t| t.columns.get(column)))
            .map(|c| c.data_type);

        match existing {
            Some(data_type) => coerce_value(table, column, data_type, value),
            None => {
                let data_type = infer_type(&value);
                let entry = self.inferred.entry(table.to_string()).or_insert_with(|| {
                    let mut t = TableSchema::new(table, disposition);
                    t.parent = parent_table.map(|p| p.to_string());
                    t
                });
                entry
                    .columns
                    .insert(column.to_string(), Column::new(column, data_type));
                Ok(value)
            }
        }
    }
}

fn to_object(item: Value) -> Map<String, Value> {
    match item {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert(VALUE_COLUMN.to_string(), other);
            map
        }
    }
}

/// Walks an object, writing scalars into `flat` under flattened column
/// names and collecting nested lists as `(child table, items)` pairs.
/// A list that itself contains lists stays inline as a JSON value.
fn flatten_into(
    table: &str,
    prefix: &str,
    obj: &Map<String, Value>,
    flat: &mut Map<String, Value>,
    lists: &mut Vec<(String, Vec<Value>)>,
) {
    for (key, value) in obj {
        let column = if prefix.is_empty() {
            normalize_identifier(key)
        } else {
            nested_identifier(prefix, key)
        };
        match value {
            Value::Object(inner) => flatten_into(table, &column, inner, flat, lists),
            Value::Array(items) => {
                if items.iter().any(Value::is_array) {
                    // no relational shape for lists of lists
                    flat.insert(column, value.clone());
                } else {
                    lists.push((format!("{}__{}", table, column), items.clone()));
                }
            }
            scalar => {
                flat.insert(column, scalar.clone());
            }
        }
    }
}

fn infer_type(value: &Value) -> ColumnType {
    match value {
        Value::Bool(_) => ColumnType::Bool,
        Value::Number(n) if n.is_i64() || n.is_u64() => ColumnType::Bigint,
        Value::Number(_) => ColumnType::Double,
        Value::String(s) => {
            if chrono::DateTime::parse_from_rfc3339(s).is_ok() {
                ColumnType::Timestamp
            } else {
                ColumnType::Text
            }
        }
        Value::Array(_) | Value::Object(_) => ColumnType::Json,
        Value::Null => ColumnType::Text,
    }
}

fn coerce_value(
    table: &str,
    column: &str,
    data_type: ColumnType,
    value: Value,
) -> Result<Value> {
    let mismatch = |value: &Value| PipelineError::TypeMismatch {
        table: table.to_string(),
        column: column.to_string(),
        expected: data_type.as_str().to_string(),
        value: value.to_string(),
    };
    match data_type {
        ColumnType::Text => match value {
            Value::String(_) => Ok(value),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            other => Err(mismatch(&other)),
        },
        ColumnType::Timestamp => match value {
            Value::String(_) => Ok(value),
            other => Err(mismatch(&other)),
        },
        ColumnType::Bigint => match &value {
            Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value),
            Value::Number(n) => {
                let f = n.as_f64().unwrap_or_default();
                if f.fract() == 0.0 {
                    Ok(Value::from(f as i64))
                } else {
                    Err(mismatch(&value))
                }
            }
            _ => Err(mismatch(&value)),
        },
        ColumnType::Double => match &value {
            Value::Number(n) => Ok(Value::from(n.as_f64().ok_or_else(|| mismatch(&value))?)),
            _ => Err(mismatch(&value)),
        },
        ColumnType::Bool => match value {
            Value::Bool(_) => Ok(value),
            other => Err(mismatch(&other)),
        },
        ColumnType::Json => Ok(value),
    }
}

fn row_hash(table: &str, parent: Option<&ParentLink>, flat: &Map<String, Value>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(table.as_bytes());
    if let Some(link) = parent {
        hasher.update(link.row_id.as_bytes());
        hasher.update(link.list_idx.to_le_bytes());
    }
    hasher.update(serde_json::to_string(flat).unwrap_or_default().as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{extract, Resource, Source};
    use serde_json::json;
    use tempfile::tempdir;

    fn run_normalize(rows: Vec<Value>) -> (Schema, BTreeMap<String, Vec<Map<String, Value>>>) {
        let dir = tempdir().unwrap();
        let storage = PipelineStorage::new(dir.path());
        storage.ensure_layout().unwrap();
        let source = Source::new("demo")
            .resource(Resource::new("items", rows))
            .unwrap();
        let info = extract(&storage, source).unwrap();
        let mut schema = Schema::new("demo");
        normalize(&storage, &mut schema, &info.load_id).unwrap();

        let package =
            LoadPackage::open(storage.package_dir(&info.load_id), &info.load_id).unwrap();
        let mut staged = BTreeMap::new();
        for job in package.new_jobs().unwrap() {
            staged.insert(
                job.table.clone(),
                package.read_job_rows("new", &job).unwrap(),
            );
        }
        (schema, staged)
    }

    #[test]
    fn nested_objects_flatten_into_columns() {
        let (schema, staged) = run_normalize(vec![json!({
            "id": 1,
            "address": {"city": "Seattle", "zip": "98101"}
        })]);
        let row = &staged["items"][0];
        assert_eq!(row["address__city"], json!("Seattle"));
        let table = schema.table("items").unwrap();
        assert_eq!(
            table.columns["address__zip"].data_type,
            ColumnType::Text
        );
    }

    #[test]
    fn nested_lists_become_child_tables_with_lineage() {
        let (schema, staged) = run_normalize(vec![json!({
            "id": 1,
            "tags": ["a", "b"]
        })]);
        let parent = &staged["items"][0];
        let children = &staged["items__tags"];
        assert_eq!(children.len(), 2);
        assert_eq!(children[0]["value"], json!("a"));
        assert_eq!(children[0]["_siphon_parent_id"], parent["_siphon_id"]);
        assert_eq!(children[0]["_siphon_list_idx"], json!(0));
        assert_eq!(children[1]["_siphon_list_idx"], json!(1));

        let child_schema = schema.table("items__tags").unwrap();
        assert_eq!(child_schema.parent.as_deref(), Some("items"));
    }

    #[test]
    fn lists_of_objects_flatten_inside_child_tables() {
        let (_, staged) = run_normalize(vec![json!({
            "id": 1,
            "lines": [{"sku": "x", "qty": 2}, {"sku": "y", "qty": 1}]
        })]);
        let children = &staged["items__lines"];
        assert_eq!(children[0]["sku"], json!("x"));
        assert_eq!(children[1]["qty"], json!(1));
    }

    #[test]
    fn lists_of_lists_stay_inline_as_json() {
        let (schema, staged) = run_normalize(vec![json!({
            "id": 1,
            "matrix": [[1, 2], [3]]
        })]);
        assert!(staged.get("items__matrix").is_none());
        assert_eq!(staged["items"][0]["matrix"], json!([[1, 2], [3]]));
        assert_eq!(
            schema.table("items").unwrap().columns["matrix"].data_type,
            ColumnType::Json
        );
    }

    #[test]
    fn types_are_inferred_per_column() {
        let (schema, _) = run_normalize(vec![json!({
            "id": 7,
            "score": 1.5,
            "active": true,
            "name": "x",
            "seen_at": "2024-05-01T10:00:00Z"
        })]);
        let table = schema.table("items").unwrap();
        assert_eq!(table.columns["id"].data_type, ColumnType::Bigint);
        assert_eq!(table.columns["score"].data_type, ColumnType::Double);
        assert_eq!(table.columns["active"].data_type, ColumnType::Bool);
        assert_eq!(table.columns["name"].data_type, ColumnType::Text);
        assert_eq!(table.columns["seen_at"].data_type, ColumnType::Timestamp);
    }

    #[test]
    fn nulls_do_not_create_columns() {
        let (schema, staged) = run_normalize(vec![json!({"id": 1, "gone": null})]);
        assert!(schema.table("items").unwrap().columns.get("gone").is_none());
        assert!(staged["items"][0].get("gone").is_none());
    }

    #[test]
    fn conflicting_value_coerces_to_stored_text_type() {
        let (schema, staged) = run_normalize(vec![
            json!({"code": "a1"}),
            json!({"code": 42}),
        ]);
        assert_eq!(
            schema.table("items").unwrap().columns["code"].data_type,
            ColumnType::Text
        );
        assert_eq!(staged["items"][1]["code"], json!("42"));
    }

    #[test]
    fn string_against_numeric_column_is_an_error() {
        let dir = tempdir().unwrap();
        let storage = PipelineStorage::new(dir.path());
        storage.ensure_layout().unwrap();
        let source = Source::new("demo")
            .resource(Resource::new(
                "items",
                vec![json!({"id": 1}), json!({"id": "oops"})],
            ))
            .unwrap();
        let info = extract(&storage, source).unwrap();
        let mut schema = Schema::new("demo");
        let err = normalize(&storage, &mut schema, &info.load_id).unwrap_err();
        assert!(matches!(err, PipelineError::TypeMismatch { .. }));
    }

    #[test]
    fn schema_version_advances_only_on_new_columns() {
        let dir = tempdir().unwrap();
        let storage = PipelineStorage::new(dir.path());
        storage.ensure_layout().unwrap();
        let mut schema = Schema::new("demo");

        let source = Source::new("demo")
            .resource(Resource::new("items", vec![json!({"id": 1})]))
            .unwrap();
        let info = extract(&storage, source).unwrap();
        normalize(&storage, &mut schema, &info.load_id).unwrap();
        let v1 = schema.version;

        let source = Source::new("demo")
            .resource(Resource::new("items", vec![json!({"id": 2})]))
            .unwrap();
        let info = extract(&storage, source).unwrap();
        normalize(&storage, &mut schema, &info.load_id).unwrap();
        assert_eq!(schema.version, v1);

        let source = Source::new("demo")
            .resource(Resource::new("items", vec![json!({"id": 3, "extra": "x"})]))
            .unwrap();
        let info = extract(&storage, source).unwrap();
        normalize(&storage, &mut schema, &info.load_id).unwrap();
        assert_eq!(schema.version, v1 + 1);
    }
}
