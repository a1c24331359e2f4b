use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid source definition: {0}")]
    Source(String),

    #[error("Load package '{load_id}': {message}")]
    Package { load_id: String, message: String },

    #[error("Type mismatch in table '{table}' column '{column}': cannot store {value} as {expected}")]
    TypeMismatch {
        table: String,
        column: String,
        expected: String,
        value: String,
    },

    #[error("Destination error: {0}")]
    Destination(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
