use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::schema::Schema;

/// Filesystem layout of one pipeline's working directory:
///
/// ```text
/// <root>/
///   schemas/<name>.schema.json
///   load/<load_id>/     pending load packages
///   loaded/<load_id>/   archived load packages
/// ```
pub struct PipelineStorage {
    root: PathBuf,
}

impl PipelineStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure_layout(&self) -> Result<()> {
        fs::create_dir_all(self.root.join("schemas"))?;
        fs::create_dir_all(self.load_dir())?;
        fs::create_dir_all(self.loaded_dir())?;
        Ok(())
    }

    pub fn load_dir(&self) -> PathBuf {
        self.root.join("load")
    }

    pub fn loaded_dir(&self) -> PathBuf {
        self.root.join("loaded")
    }

    pub fn package_dir(&self, load_id: &str) -> PathBuf {
        self.load_dir().join(load_id)
    }

    fn schema_path(&self, name: &str) -> PathBuf {
        self.root.join("schemas").join(format!("{}.schema.json", name))
    }

    pub fn read_schema(&self, name: &str) -> Result<Option<Schema>> {
        let path = self.schema_path(name);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    pub fn write_schema(&self, schema: &Schema) -> Result<()> {
        let path = self.schema_path(&schema.name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(schema)?)?;
        Ok(())
    }

    /// Load ids of packages not yet loaded, oldest first.
    pub fn pending_packages(&self) -> Result<Vec<String>> {
        Self::list_dirs(&self.load_dir())
    }

    /// Load ids of packages already loaded and archived, oldest first.
    pub fn archived_packages(&self) -> Result<Vec<String>> {
        Self::list_dirs(&self.loaded_dir())
    }

    /// Moves a completed package out of the pending area.
    pub fn archive_package(&self, load_id: &str) -> Result<()> {
        fs::create_dir_all(self.loaded_dir())?;
        fs::rename(self.package_dir(load_id), self.loaded_dir().join(load_id))?;
        Ok(())
    }

    fn list_dirs(dir: &Path) -> Result<Vec<String>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Schema;
    use tempfile::tempdir;

    #[test]
    fn schema_round_trips_through_store() {
        let dir = tempdir().unwrap();
        let storage = PipelineStorage::new(dir.path());
        storage.ensure_layout().unwrap();

        assert!(storage.read_schema("demo").unwrap().is_none());
        let schema = Schema::new("demo");
        storage.write_schema(&schema).unwrap();
        let read = storage.read_schema("demo").unwrap().unwrap();
        assert_eq!(read.name, "demo");
        assert_eq!(read.version_hash, schema.version_hash);
    }

    #[test]
    fn archive_moves_package_between_areas() {
        let dir = tempdir().unwrap();
        let storage = PipelineStorage::new(dir.path());
        storage.ensure_layout().unwrap();
        std::fs::create_dir_all(storage.package_dir("100-abc")).unwrap();

        assert_eq!(storage.pending_packages().unwrap(), vec!["100-abc"]);
        storage.archive_package("100-abc").unwrap();
        assert!(storage.pending_packages().unwrap().is_empty());
        assert_eq!(storage.archived_packages().unwrap(), vec!["100-abc"]);
    }
}
