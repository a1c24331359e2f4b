use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, types::Value as SqlValue, Connection};
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::{Destination, JobStatus};
use crate::error::{PipelineError, Result};
use crate::schema::{Column, ColumnType, Schema, TableSchema, SCHEMA_ENGINE_VERSION};

const VERSIONS_TABLE: &str = "_siphon_schema_versions";
const LOADS_TABLE: &str = "_siphon_loads";

/// SQLite-backed warehouse destination. Table DDL is generated from schema
/// deltas; row data arrives as normalized JSON rows.
pub struct SqliteDestination {
    conn: Mutex<Connection>,
    /// (load_id, table) pairs already truncated for a replace load.
    truncated: Mutex<HashSet<(String, String)>>,
}

impl SqliteDestination {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Ok(Self {
            conn: Mutex::new(conn),
            truncated: Mutex::new(HashSet::new()),
        })
    }

    /// Number of rows currently in `table`.
    pub fn row_count(&self, table: &str) -> Result<i64> {
        let conn = self.lock_conn()?;
        let count =
            conn.query_row(&format!("SELECT COUNT(*) FROM \"{}\"", table), [], |row| {
                row.get(0)
            })?;
        Ok(count)
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| PipelineError::Destination("sqlite connection poisoned".to_string()))
    }

    fn db_type(data_type: ColumnType) -> &'static str {
        match data_type {
            ColumnType::Bigint | ColumnType::Bool => "INTEGER",
            ColumnType::Double => "REAL",
            ColumnType::Text | ColumnType::Timestamp | ColumnType::Json => "TEXT",
        }
    }

    fn column_def(column: &Column) -> String {
        format!("\"{}\" {}", column.name, Self::db_type(column.data_type))
    }

    /// Column names the destination table already has, or `None` when the
    /// table does not exist yet.
    fn existing_columns(conn: &Connection, table: &str) -> Result<Option<HashSet<String>>> {
        let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
        let names: std::result::Result<HashSet<String>, _> = stmt
            .query_map(params![table], |row| row.get::<_, String>(0))?
            .collect();
        let names = names?;
        if names.is_empty() {
            Ok(None)
        } else {
            Ok(Some(names))
        }
    }

    /// CREATE or ALTER statements bringing `table` up to date, one string
    /// per statement.
    fn table_update_sql(conn: &Connection, table: &TableSchema) -> Result<Vec<String>> {
        let mut statements = Vec::new();
        match Self::existing_columns(conn, &table.name)? {
            None => {
                let defs: Vec<String> = table.columns.values().map(Self::column_def).collect();
                statements.push(format!(
                    "CREATE TABLE \"{}\" (\n{}\n);",
                    table.name,
                    defs.join(",\n")
                ));
            }
            Some(existing) => {
                // sqlite takes one ADD COLUMN per statement
                for column in table.columns.values() {
                    if !existing.contains(&column.name) {
                        statements.push(format!(
                            "ALTER TABLE \"{}\" ADD COLUMN {};",
                            table.name,
                            Self::column_def(column)
                        ));
                    }
                }
            }
        }
        Ok(statements)
    }

    fn to_sql_value(value: &Value) -> SqlValue {
        match value {
            Value::Null => SqlValue::Null,
            Value::Bool(b) => SqlValue::Integer(*b as i64),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    SqlValue::Integer(i)
                } else {
                    SqlValue::Real(n.as_f64().unwrap_or_default())
                }
            }
            Value::String(s) => SqlValue::Text(s.clone()),
            composite => SqlValue::Text(composite.to_string()),
        }
    }
}

#[async_trait]
impl Destination for SqliteDestination {
    async fn initialize_storage(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{versions}" (
                version_hash   TEXT NOT NULL,
                schema_name    TEXT NOT NULL,
                version        INTEGER NOT NULL,
                engine_version INTEGER NOT NULL,
                inserted_at    TEXT NOT NULL,
                schema         TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS "{loads}" (
                load_id     TEXT NOT NULL,
                schema_name TEXT NOT NULL,
                status      INTEGER NOT NULL,
                inserted_at TEXT NOT NULL
            );
            "#,
            versions = VERSIONS_TABLE,
            loads = LOADS_TABLE,
        ))?;
        Ok(())
    }

    async fn update_schema(&self, schema: &Schema) -> Result<bool> {
        let mut conn = self.lock_conn()?;
        let known: Option<String> = conn
            .query_row(
                &format!(
                    "SELECT inserted_at FROM \"{}\" WHERE version_hash = ?1",
                    VERSIONS_TABLE
                ),
                params![schema.version_hash],
                |row| row.get(0),
            )
            .ok();
        if let Some(inserted_at) = known {
            debug!(
                version_hash = %schema.version_hash,
                %inserted_at,
                "schema already stored, no upgrade required"
            );
            return Ok(false);
        }

        info!(
            version = schema.version,
            version_hash = %schema.version_hash,
            "schema not found in storage, upgrading"
        );
        let tx = conn.transaction()?;
        for table in schema.tables.values() {
            for statement in Self::table_update_sql(&tx, table)? {
                tx.execute_batch(&statement)?;
            }
        }
        tx.execute(
            &format!(
                "INSERT INTO \"{}\" (version_hash, schema_name, version, engine_version, inserted_at, schema)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                VERSIONS_TABLE
            ),
            params![
                schema.version_hash,
                schema.name,
                schema.version,
                SCHEMA_ENGINE_VERSION,
                Utc::now().to_rfc3339(),
                serde_json::to_string(schema)?,
            ],
        )?;
        tx.commit()?;
        Ok(true)
    }

    async fn load_table(
        &self,
        table: &TableSchema,
        rows: &[Map<String, Value>],
        load_id: &str,
    ) -> Result<JobStatus> {
        use crate::schema::WriteDisposition;

        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;

        // Truncate on the first job of a (load, table) pair, but only mark
        // the pair once the transaction commits: a rolled back DELETE must
        // run again when the job is retried.
        let truncate_key = if table.write_disposition == WriteDisposition::Replace {
            let key = (load_id.to_string(), table.name.clone());
            let truncated = self.truncated.lock().map_err(|_| {
                PipelineError::Destination("truncation state poisoned".to_string())
            })?;
            if truncated.contains(&key) {
                None
            } else {
                tx.execute(&format!("DELETE FROM \"{}\"", table.name), [])?;
                Some(key)
            }
        } else {
            None
        };

        let columns: Vec<&str> = table.columns.keys().map(String::as_str).collect();
        let column_list: Vec<String> = columns.iter().map(|c| format!("\"{}\"", c)).collect();
        let placeholders: Vec<String> =
            (1..=columns.len()).map(|i| format!("?{}", i)).collect();
        let insert_sql = format!(
            "INSERT INTO \"{}\" ({}) VALUES ({})",
            table.name,
            column_list.join(", "),
            placeholders.join(", ")
        );

        {
            let mut stmt = tx.prepare(&insert_sql)?;
            for row in rows {
                let values: Vec<SqlValue> = columns
                    .iter()
                    .map(|c| row.get(*c).map(Self::to_sql_value).unwrap_or(SqlValue::Null))
                    .collect();
                stmt.execute(rusqlite::params_from_iter(values))?;
            }
        }
        tx.commit()?;

        if let Some(key) = truncate_key {
            self.truncated
                .lock()
                .map_err(|_| {
                    PipelineError::Destination("truncation state poisoned".to_string())
                })?
                .insert(key);
        }

        debug!(table = %table.name, rows = rows.len(), "job loaded");
        Ok(JobStatus::Completed)
    }

    async fn complete_load(&self, load_id: &str, schema_name: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            &format!(
                "INSERT INTO \"{}\" (load_id, schema_name, status, inserted_at) VALUES (?1, ?2, 0, ?3)",
                LOADS_TABLE
            ),
            params![load_id, schema_name, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}
