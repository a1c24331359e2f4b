use crate::error::{PipelineError, Result};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub destination: DestinationConfig,
    #[serde(default)]
    pub load: LoadConfig,
}

#[derive(Debug, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DestinationConfig {
    /// SQLite database file destination.
    Sqlite { path: PathBuf },
    /// In-memory destination, useful for dry runs.
    Memory,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        DestinationConfig::Sqlite {
            path: PathBuf::from("siphon.db"),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoadConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
        }
    }
}

fn default_working_dir() -> PathBuf {
    PathBuf::from(".siphon")
}

fn default_max_retries() -> u32 {
    3
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from("siphon.toml")
    }

    pub fn load_from(config_path: &str) -> Result<Self> {
        let config_content = fs::read_to_string(config_path).map_err(|e| {
            PipelineError::Config(format!(
                "Failed to read config file '{}': {}",
                config_path, e
            ))
        })?;

        let config: Config = toml::from_str(&config_content)?;
        Ok(config)
    }
}
