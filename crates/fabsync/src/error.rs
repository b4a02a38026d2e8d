use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FabsyncError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Reconciliation error: {0}")]
    GitOps(#[from] crate::gitops::GitOpsError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Logging setup failed: {0}")]
    Logging(String),

    #[error("Runtime error: {0}")]
    Runtime(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },
}

pub type Result<T> = std::result::Result<T, FabsyncError>;
