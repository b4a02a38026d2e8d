//! GitOps engine error types.

use std::path::PathBuf;
use thiserror::Error;

use super::alert::AlertError;
use super::cluster::ClusterError;
use super::lifecycle::TransitionError;
use super::source::SourceError;
use crate::db::DatabaseError;

/// Errors that can occur while reconciling.
#[derive(Error, Debug)]
pub enum GitOpsError {
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Transition rejected: {0}")]
    Transition(#[from] TransitionError),

    #[error("Alert error: {0}")]
    Alert(#[from] AlertError),

    #[error("Failed to parse YAML in '{path}': {message}")]
    ParseYaml { path: PathBuf, message: String },

    #[error("Failed to serialize YAML: {0}")]
    SerializeYaml(String),

    #[error("Invalid resource in '{path}': {message}")]
    InvalidResource { path: PathBuf, message: String },

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Concurrent updates to {0} did not settle")]
    Contention(String),

    #[error("Cannot run {action}: {reason}")]
    ActionRejected { action: String, reason: String },

    #[error("{action} timed out after {secs}s")]
    ActionTimeout { action: String, secs: u64 },

    #[error("Reconciliation cancelled")]
    Cancelled,

    #[error("Watch error: {0}")]
    WatchError(String),

    #[error("Background task failed: {0}")]
    Join(String),
}

impl From<serde_yaml::Error> for GitOpsError {
    fn from(err: serde_yaml::Error) -> Self {
        GitOpsError::SerializeYaml(err.to_string())
    }
}

impl GitOpsError {
    /// Returns true if the error is likely transient and the operation can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            GitOpsError::Source(e) => e.is_retryable(),
            GitOpsError::Cluster(e) => e.is_retryable(),
            GitOpsError::Database(e) => e.is_conflict(),
            GitOpsError::ActionTimeout { .. } => true,
            _ => false,
        }
    }
}

/// Result type for GitOps operations.
pub type Result<T> = std::result::Result<T, GitOpsError>;
