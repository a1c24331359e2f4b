pub mod memory;
pub mod sqlite;

pub use memory::MemoryDestination;
pub use sqlite::SqliteDestination;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::Result;
use crate::schema::{Schema, TableSchema};

/// Outcome of running one load job against a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Completed,
    /// Transient failure; the loader requeues the job up to its retry limit.
    Retry,
    Failed,
}

/// A warehouse the pipeline loads into. Implementations own their
/// connection handling and their dialect's DDL.
#[async_trait]
pub trait Destination: Send + Sync {
    /// Creates the dataset/namespace and bookkeeping tables if absent.
    async fn initialize_storage(&self) -> Result<()>;

    /// Applies the schema delta between `schema` and what the destination
    /// already has. Returns `true` when a migration ran; a schema whose
    /// version hash is already stored is skipped.
    async fn update_schema(&self, schema: &Schema) -> Result<bool>;

    /// Writes one job's rows into `table` honoring its write disposition.
    /// A `Replace` table is truncated once per load id, so several jobs of
    /// the same load never clobber each other.
    async fn load_table(
        &self,
        table: &TableSchema,
        rows: &[Map<String, Value>],
        load_id: &str,
    ) -> Result<JobStatus>;

    /// Records a fully loaded package in the destination's loads table.
    async fn complete_load(&self, load_id: &str, schema_name: &str) -> Result<()>;
}
