pub mod package;

pub use package::{JobFile, LoadPackage, PackageCounts};

use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::destination::{Destination, JobStatus};
use crate::error::Result;
use crate::storage::PipelineStorage;

/// Outcome of loading one package into a destination.
#[derive(Debug, Clone)]
pub struct LoadInfo {
    pub load_id: String,
    pub schema_name: String,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
    pub table_rows: BTreeMap<String, u64>,
}

impl LoadInfo {
    pub fn is_success(&self) -> bool {
        self.failed_jobs == 0
    }
}

/// Walks a load package's jobs through `new → started → completed/failed`
/// against a destination. Transient destination trouble requeues a job
/// until its retry count exceeds `max_retries`.
pub struct Loader<'a> {
    destination: &'a dyn Destination,
    max_retries: u32,
}

impl<'a> Loader<'a> {
    pub fn new(destination: &'a dyn Destination, max_retries: u32) -> Self {
        Self {
            destination,
            max_retries,
        }
    }

    pub async fn load_package(
        &self,
        storage: &PipelineStorage,
        load_id: &str,
    ) -> Result<LoadInfo> {
        let package = LoadPackage::open(storage.package_dir(load_id), load_id)?;
        let schema = package.read_schema()?;

        self.destination.initialize_storage().await?;
        self.destination.update_schema(&schema).await?;

        // Jobs left in `started` by an interrupted run go back to the queue.
        for job in package.started_jobs()? {
            warn!(load_id = %load_id, job = %job.file_name, "requeueing interrupted job");
            package.retry_job(&job)?;
        }

        let mut info = LoadInfo {
            load_id: load_id.to_string(),
            schema_name: schema.name.clone(),
            completed_jobs: 0,
            failed_jobs: 0,
            table_rows: BTreeMap::new(),
        };

        while let Some(job) = package.new_jobs()?.into_iter().next() {
            package.start_job(&job)?;

            if job.retry > self.max_retries {
                warn!(job = %job.file_name, "job exceeded retry limit");
                package.fail_job(&job, "retry limit exceeded")?;
                info.failed_jobs += 1;
                continue;
            }

            let Some(table) = schema.table(&job.table) else {
                package.fail_job(&job, "table missing from package schema")?;
                info.failed_jobs += 1;
                continue;
            };

            let rows = package.read_job_rows("started", &job)?;
            match self.destination.load_table(table, &rows, load_id).await {
                Ok(JobStatus::Completed) => {
                    package.complete_job(&job)?;
                    info.completed_jobs += 1;
                    *info.table_rows.entry(job.table.clone()).or_insert(0) += rows.len() as u64;
                }
                Ok(JobStatus::Retry) => {
                    warn!(job = %job.file_name, retry = job.retry, "destination asked for retry");
                    package.retry_job(&job)?;
                }
                Ok(JobStatus::Failed) => {
                    package.fail_job(&job, "destination rejected job")?;
                    info.failed_jobs += 1;
                }
                Err(e) => {
                    warn!(job = %job.file_name, error = %e, "job errored");
                    package.retry_job(&job)?;
                }
            }
        }

        if package.is_complete()? {
            if info.is_success() {
                self.destination
                    .complete_load(load_id, &schema.name)
                    .await?;
            }
            storage.archive_package(load_id)?;
        }

        info!(
            load_id = %load_id,
            completed = info.completed_jobs,
            failed = info.failed_jobs,
            "load finished"
        );
        Ok(info)
    }
}
