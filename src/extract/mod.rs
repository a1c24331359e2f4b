pub mod pipe;
pub mod resource;

pub use pipe::{PipeItem, PipeIterator};
pub use resource::{Resource, Source};

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufWriter, Write};

use chrono::Utc;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::error::Result;
use crate::load::package::LoadPackage;
use crate::storage::PipelineStorage;

#[derive(Debug, Clone)]
pub struct ExtractInfo {
    pub load_id: String,
    pub table_rows: BTreeMap<String, u64>,
}

pub fn new_load_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().timestamp(), &suffix[..8])
}

/// Runs every resource pipe of `source` and spools the produced rows into a
/// fresh load package, one jsonl file per destination table. Rows yielded
/// as arrays are unpacked into individual rows.
pub fn extract(storage: &PipelineStorage, source: Source) -> Result<ExtractInfo> {
    let load_id = new_load_id();
    let package = LoadPackage::create(storage.package_dir(&load_id), &load_id)?;

    let iterator = PipeIterator::from_source(source)?;
    let dispositions: BTreeMap<_, _> = iterator.table_dispositions().into_iter().collect();
    package.write_dispositions(&dispositions)?;

    let mut writers: HashMap<String, BufWriter<File>> = HashMap::new();
    let mut table_rows: BTreeMap<String, u64> = BTreeMap::new();

    for item in iterator {
        match item.row {
            Value::Array(rows) => {
                for row in rows {
                    write_row(&package, &mut writers, &mut table_rows, &item.table, &row)?;
                }
            }
            row => write_row(&package, &mut writers, &mut table_rows, &item.table, &row)?,
        }
    }

    for writer in writers.values_mut() {
        writer.flush()?;
    }

    info!(
        load_id = %load_id,
        tables = table_rows.len(),
        rows = table_rows.values().sum::<u64>(),
        "extract finished"
    );
    Ok(ExtractInfo {
        load_id,
        table_rows,
    })
}

fn write_row(
    package: &LoadPackage,
    writers: &mut HashMap<String, BufWriter<File>>,
    table_rows: &mut BTreeMap<String, u64>,
    table: &str,
    row: &Value,
) -> Result<()> {
    use std::collections::hash_map::Entry;

    // Writers are created lazily so empty tables leave no file behind.
    let writer = match writers.entry(table.to_string()) {
        Entry::Occupied(entry) => entry.into_mut(),
        Entry::Vacant(entry) => {
            let file = File::create(package.extracted_file(table))?;
            entry.insert(BufWriter::new(file))
        }
    };
    serde_json::to_writer(&mut *writer, row)?;
    writer.write_all(b"\n")?;
    *table_rows.entry(table.to_string()).or_insert(0) += 1;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::WriteDisposition;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn extract_spools_rows_per_table() {
        let dir = tempdir().unwrap();
        let storage = PipelineStorage::new(dir.path());
        storage.ensure_layout().unwrap();

        let source = Source::new("demo")
            .resource(
                Resource::new(
                    "users",
                    vec![json!({"id": 1}), json!({"id": 2})],
                )
                .write_disposition(WriteDisposition::Replace),
            )
            .unwrap()
            .resource(Resource::new("batches", vec![json!([{"id": 3}, {"id": 4}])]))
            .unwrap();

        let info = extract(&storage, source).unwrap();
        assert_eq!(info.table_rows["users"], 2);
        assert_eq!(info.table_rows["batches"], 2);

        let package =
            LoadPackage::open(storage.package_dir(&info.load_id), &info.load_id).unwrap();
        let tables = package.extracted_tables().unwrap();
        assert_eq!(tables.len(), 2);
        let dispositions = package.read_dispositions().unwrap();
        assert_eq!(dispositions["users"], WriteDisposition::Replace);
        assert_eq!(dispositions["batches"], WriteDisposition::Append);
    }

    #[test]
    fn empty_resource_leaves_no_table_file() {
        let dir = tempdir().unwrap();
        let storage = PipelineStorage::new(dir.path());
        storage.ensure_layout().unwrap();

        let source = Source::new("demo")
            .resource(Resource::new("empty", Vec::<serde_json::Value>::new()))
            .unwrap();
        let info = extract(&storage, source).unwrap();
        assert!(info.table_rows.is_empty());
        let package =
            LoadPackage::open(storage.package_dir(&info.load_id), &info.load_id).unwrap();
        assert!(package.extracted_tables().unwrap().is_empty());
    }
}
