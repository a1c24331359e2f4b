use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::schema::{Schema, WriteDisposition};

/// A load job file sitting in one of the package state directories.
/// File name layout: `<table>.<job_id>.<retry>.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFile {
    pub table: String,
    pub job_id: String,
    pub retry: u32,
    pub file_name: String,
}

impl JobFile {
    pub fn parse(file_name: &str) -> Option<Self> {
        let parts: Vec<&str> = file_name.split('.').collect();
        if parts.len() != 4 || parts[3] != "jsonl" {
            return None;
        }
        Some(Self {
            table: parts[0].to_string(),
            job_id: parts[1].to_string(),
            retry: parts[2].parse().ok()?,
            file_name: file_name.to_string(),
        })
    }

    fn with_retry(&self, retry: u32) -> Self {
        let file_name = format!("{}.{}.{}.jsonl", self.table, self.job_id, retry);
        Self {
            table: self.table.clone(),
            job_id: self.job_id.clone(),
            retry,
            file_name,
        }
    }
}

/// One staged load package on disk. Extracted rows land in `extracted/`,
/// normalization turns them into job files under `new/`, and the loader
/// walks jobs through `new → started → completed | failed`.
pub struct LoadPackage {
    load_id: String,
    dir: PathBuf,
}

impl LoadPackage {
    pub fn create(dir: PathBuf, load_id: &str) -> Result<Self> {
        for sub in ["extracted", "new", "started", "completed", "failed"] {
            fs::create_dir_all(dir.join(sub))?;
        }
        Ok(Self {
            load_id: load_id.to_string(),
            dir,
        })
    }

    pub fn open(dir: PathBuf, load_id: &str) -> Result<Self> {
        if !dir.is_dir() {
            return Err(PipelineError::Package {
                load_id: load_id.to_string(),
                message: "package directory does not exist".to_string(),
            });
        }
        Ok(Self {
            load_id: load_id.to_string(),
            dir,
        })
    }

    pub fn load_id(&self) -> &str {
        &self.load_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // Extracted rows

    pub fn extracted_file(&self, table: &str) -> PathBuf {
        self.dir.join("extracted").join(format!("{}.jsonl", table))
    }

    pub fn extracted_tables(&self) -> Result<Vec<(String, PathBuf)>> {
        let dir = self.dir.join("extracted");
        let mut tables = Vec::new();
        if !dir.exists() {
            return Ok(tables);
        }
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(table) = name.strip_suffix(".jsonl") {
                tables.push((table.to_string(), entry.path()));
            }
        }
        tables.sort();
        Ok(tables)
    }

    /// Drops the extracted area once normalization has produced job files.
    pub fn clear_extracted(&self) -> Result<()> {
        let dir = self.dir.join("extracted");
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    // Package metadata

    pub fn write_schema(&self, schema: &Schema) -> Result<()> {
        fs::write(
            self.dir.join("schema.json"),
            serde_json::to_string_pretty(schema)?,
        )?;
        Ok(())
    }

    pub fn read_schema(&self) -> Result<Schema> {
        let content = fs::read_to_string(self.dir.join("schema.json")).map_err(|_| {
            PipelineError::Package {
                load_id: self.load_id.clone(),
                message: "package has no schema.json; was it normalized?".to_string(),
            }
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn write_dispositions(
        &self,
        dispositions: &BTreeMap<String, WriteDisposition>,
    ) -> Result<()> {
        fs::write(
            self.dir.join("dispositions.json"),
            serde_json::to_string_pretty(dispositions)?,
        )?;
        Ok(())
    }

    pub fn read_dispositions(&self) -> Result<BTreeMap<String, WriteDisposition>> {
        let path = self.dir.join("dispositions.json");
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    // Job lifecycle

    pub fn write_job(&self, table: &str, rows: &[Map<String, Value>]) -> Result<JobFile> {
        let job_id = Uuid::new_v4().simple().to_string();
        let file_name = format!("{}.{}.0.jsonl", table, job_id);
        let path = self.dir.join("new").join(&file_name);
        let mut writer = BufWriter::new(fs::File::create(&path)?);
        for row in rows {
            serde_json::to_writer(&mut writer, row)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        JobFile::parse(&file_name).ok_or_else(|| PipelineError::Package {
            load_id: self.load_id.clone(),
            message: format!("invalid job file name '{}'", file_name),
        })
    }

    pub fn new_jobs(&self) -> Result<Vec<JobFile>> {
        self.jobs_in("new")
    }

    pub fn started_jobs(&self) -> Result<Vec<JobFile>> {
        self.jobs_in("started")
    }

    fn jobs_in(&self, state: &str) -> Result<Vec<JobFile>> {
        let dir = self.dir.join(state);
        let mut jobs = Vec::new();
        if !dir.exists() {
            return Ok(jobs);
        }
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(job) = JobFile::parse(&name) {
                jobs.push(job);
            }
        }
        jobs.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        Ok(jobs)
    }

    pub fn start_job(&self, job: &JobFile) -> Result<PathBuf> {
        let to = self.dir.join("started").join(&job.file_name);
        fs::rename(self.dir.join("new").join(&job.file_name), &to)?;
        Ok(to)
    }

    pub fn complete_job(&self, job: &JobFile) -> Result<()> {
        fs::rename(
            self.dir.join("started").join(&job.file_name),
            self.dir.join("completed").join(&job.file_name),
        )?;
        Ok(())
    }

    pub fn fail_job(&self, job: &JobFile, message: &str) -> Result<()> {
        fs::rename(
            self.dir.join("started").join(&job.file_name),
            self.dir.join("failed").join(&job.file_name),
        )?;
        fs::write(
            self.dir
                .join("failed")
                .join(format!("{}.error", job.file_name)),
            message,
        )?;
        Ok(())
    }

    /// Moves a started job back to `new` with its retry count bumped.
    pub fn retry_job(&self, job: &JobFile) -> Result<JobFile> {
        let retried = job.with_retry(job.retry + 1);
        fs::rename(
            self.dir.join("started").join(&job.file_name),
            self.dir.join("new").join(&retried.file_name),
        )?;
        Ok(retried)
    }

    pub fn read_job_rows(&self, state: &str, job: &JobFile) -> Result<Vec<Map<String, Value>>> {
        let path = self.dir.join(state).join(&job.file_name);
        let reader = BufReader::new(fs::File::open(path)?);
        let mut rows = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            rows.push(serde_json::from_str(&line)?);
        }
        Ok(rows)
    }

    pub fn counts(&self) -> Result<PackageCounts> {
        Ok(PackageCounts {
            new: self.jobs_in("new")?.len(),
            started: self.jobs_in("started")?.len(),
            completed: self.jobs_in("completed")?.len(),
            failed: self.jobs_in("failed")?.len(),
        })
    }

    /// Row counts per table across every job state, whatever stage the
    /// jobs have reached.
    pub fn table_row_counts(&self) -> Result<BTreeMap<String, u64>> {
        let mut counts = BTreeMap::new();
        for state in ["new", "started", "completed", "failed"] {
            for job in self.jobs_in(state)? {
                let rows = self.read_job_rows(state, &job)?.len() as u64;
                *counts.entry(job.table).or_insert(0) += rows;
            }
        }
        Ok(counts)
    }

    /// A package is complete when no job is waiting or in flight.
    pub fn is_complete(&self) -> Result<bool> {
        let counts = self.counts()?;
        Ok(counts.new == 0 && counts.started == 0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackageCounts {
    pub new: usize,
    pub started: usize,
    pub completed: usize,
    pub failed: usize,
}
