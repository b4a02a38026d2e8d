pub mod config;
pub mod db;
pub mod error;
pub mod gitops;
pub mod logging;

pub use config::{load_config, Config};
pub use db::{Database, DatabaseError};
pub use error::{ConfigError, FabsyncError, Result};
pub use gitops::{GitOpsError, SyncOrchestrator, SyncScheduler};
