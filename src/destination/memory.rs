use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use super::{Destination, JobStatus};
use crate::error::{PipelineError, Result};
use crate::schema::{Schema, TableSchema, WriteDisposition};

/// In-memory destination used in tests and dry runs. Jobs can be scripted
/// to fail or ask for a retry, which exercises the loader's state machine
/// deterministically.
#[derive(Default)]
pub struct MemoryDestination {
    tables: Mutex<HashMap<String, Vec<Map<String, Value>>>>,
    schema_hashes: Mutex<HashSet<String>>,
    loads: Mutex<Vec<(String, String)>>,
    truncated: Mutex<HashSet<(String, String)>>,
    /// Scripted statuses per table, consumed one per load attempt.
    job_script: Mutex<HashMap<String, VecDeque<JobStatus>>>,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the next load attempts for `table`; once the script runs
    /// out, attempts complete normally.
    pub fn script_job_statuses(&self, table: &str, statuses: &[JobStatus]) {
        let mut script = self.job_script.lock().unwrap();
        script
            .entry(table.to_string())
            .or_default()
            .extend(statuses.iter().copied());
    }

    pub fn rows(&self, table: &str) -> Vec<Map<String, Value>> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn completed_loads(&self) -> Vec<(String, String)> {
        self.loads.lock().unwrap().clone()
    }

    pub fn stored_schema_hashes(&self) -> HashSet<String> {
        self.schema_hashes.lock().unwrap().clone()
    }

    fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> Result<std::sync::MutexGuard<'a, T>> {
        mutex
            .lock()
            .map_err(|_| PipelineError::Destination(format!("{} state poisoned", what)))
    }
}

#[async_trait]
impl Destination for MemoryDestination {
    async fn initialize_storage(&self) -> Result<()> {
        Ok(())
    }

    async fn update_schema(&self, schema: &Schema) -> Result<bool> {
        let mut hashes = Self::lock(&self.schema_hashes, "schema")?;
        Ok(hashes.insert(schema.version_hash.clone()))
    }

    async fn load_table(
        &self,
        table: &TableSchema,
        rows: &[Map<String, Value>],
        load_id: &str,
    ) -> Result<JobStatus> {
        {
            let mut script = Self::lock(&self.job_script, "job script")?;
            if let Some(next) = script.get_mut(&table.name).and_then(VecDeque::pop_front) {
                if next != JobStatus::Completed {
                    debug!(table = %table.name, ?next, "scripted job outcome");
                    return Ok(next);
                }
            }
        }

        let mut tables = Self::lock(&self.tables, "table")?;
        let entry = tables.entry(table.name.clone()).or_default();
        if table.write_disposition == WriteDisposition::Replace {
            let mut truncated = Self::lock(&self.truncated, "truncation")?;
            if truncated.insert((load_id.to_string(), table.name.clone())) {
                entry.clear();
            }
        }
        entry.extend(rows.iter().cloned());
        Ok(JobStatus::Completed)
    }

    async fn complete_load(&self, load_id: &str, schema_name: &str) -> Result<()> {
        let mut loads = Self::lock(&self.loads, "loads")?;
        loads.push((load_id.to_string(), schema_name.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Column, ColumnType};
    use serde_json::json;

    fn table(disposition: WriteDisposition) -> TableSchema {
        let mut t = TableSchema::new("users", disposition);
        t.columns
            .insert("id".to_string(), Column::new("id", ColumnType::Bigint));
        t
    }

    fn row(id: i64) -> Map<String, Value> {
        match json!({"id": id}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn replace_keeps_jobs_of_same_load() {
        let dest = MemoryDestination::new();
        let t = table(WriteDisposition::Replace);
        dest.load_table(&t, &[row(1)], "load1").await.unwrap();
        dest.load_table(&t, &[row(2)], "load2").await.unwrap();
        dest.load_table(&t, &[row(3)], "load2").await.unwrap();
        assert_eq!(dest.rows("users").len(), 2);
    }

    #[tokio::test]
    async fn scripted_statuses_are_consumed_in_order() {
        let dest = MemoryDestination::new();
        let t = table(WriteDisposition::Append);
        dest.script_job_statuses("users", &[JobStatus::Retry, JobStatus::Completed]);

        assert_eq!(
            dest.load_table(&t, &[row(1)], "load1").await.unwrap(),
            JobStatus::Retry
        );
        assert_eq!(
            dest.load_table(&t, &[row(1)], "load1").await.unwrap(),
            JobStatus::Completed
        );
        assert_eq!(dest.rows("users").len(), 1);
    }

    #[tokio::test]
    async fn update_schema_skips_known_hashes() {
        let dest = MemoryDestination::new();
        let schema = Schema::new("demo");
        assert!(dest.update_schema(&schema).await.unwrap());
        assert!(!dest.update_schema(&schema).await.unwrap());
    }
}
