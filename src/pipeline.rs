use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::config::{Config, DestinationConfig};
use crate::destination::{Destination, MemoryDestination, SqliteDestination};
use crate::error::Result;
use crate::extract::{self, ExtractInfo, Source};
use crate::load::{LoadInfo, Loader};
use crate::normalize::{self, NormalizeInfo};
use crate::schema::Schema;
use crate::storage::PipelineStorage;

/// A named pipeline: a working directory for staged load packages, a
/// stored schema, and a destination to load into. Stages can run as one
/// shot via [`run`](Self::run) or independently for resumable operation.
pub struct Pipeline {
    name: String,
    storage: PipelineStorage,
    destination: Arc<dyn Destination>,
    max_retries: u32,
}

impl Pipeline {
    pub fn new(
        name: impl Into<String>,
        working_dir: impl AsRef<Path>,
        destination: Arc<dyn Destination>,
    ) -> Result<Self> {
        let storage = PipelineStorage::new(working_dir.as_ref());
        storage.ensure_layout()?;
        Ok(Self {
            name: name.into(),
            storage,
            destination,
            max_retries: 3,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let destination: Arc<dyn Destination> = match &config.destination {
            DestinationConfig::Sqlite { path } => Arc::new(SqliteDestination::open(path)?),
            DestinationConfig::Memory => Arc::new(MemoryDestination::new()),
        };
        let mut pipeline = Self::new(
            config.pipeline.name.clone(),
            &config.pipeline.working_dir,
            destination,
        )?;
        pipeline.max_retries = config.load.max_retries;
        Ok(pipeline)
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn storage(&self) -> &PipelineStorage {
        &self.storage
    }

    /// The stored schema, or a fresh one for a first run.
    pub fn schema(&self) -> Result<Schema> {
        Ok(self
            .storage
            .read_schema(&self.name)?
            .unwrap_or_else(|| Schema::new(&self.name)))
    }

    /// Runs all three stages for `source` and returns what the load did.
    pub async fn run(&self, source: Source) -> Result<LoadInfo> {
        let extract_info = self.extract(source)?;
        self.normalize(&extract_info.load_id)?;
        self.load(&extract_info.load_id).await
    }

    /// Evaluates the source's resource pipes into a new load package.
    pub fn extract(&self, source: Source) -> Result<ExtractInfo> {
        info!(pipeline = %self.name, source = source.name(), "extracting");
        extract::extract(&self.storage, source)
    }

    /// Flattens an extracted package and evolves the stored schema.
    pub fn normalize(&self, load_id: &str) -> Result<NormalizeInfo> {
        let mut schema = self.schema()?;
        let info = normalize::normalize(&self.storage, &mut schema, load_id)?;
        self.storage.write_schema(&schema)?;
        Ok(info)
    }

    /// Loads one normalized package into the destination.
    pub async fn load(&self, load_id: &str) -> Result<LoadInfo> {
        let loader = Loader::new(self.destination.as_ref(), self.max_retries);
        loader.load_package(&self.storage, load_id).await
    }

    /// Resumes every package still sitting in the pending area, oldest
    /// first. This is the crash-recovery path.
    pub async fn load_pending(&self) -> Result<Vec<LoadInfo>> {
        let mut infos = Vec::new();
        for load_id in self.storage.pending_packages()? {
            infos.push(self.load(&load_id).await?);
        }
        Ok(infos)
    }
}
