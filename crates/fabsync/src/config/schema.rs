use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    pub fabric_id: String,
    #[serde(default)]
    pub fabric_name: Option<String>,
    pub source_directory: String,
    #[serde(default = "default_raw_directory")]
    pub raw_directory: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub database_path: Option<String>,
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_action_timeout")]
    pub action_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_archive_suffix")]
    pub archive_suffix: String,
    #[serde(default = "default_true")]
    pub auto_remediate_low_drift: bool,
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// A configuration with every optional field at its default.
    pub fn new(fabric_id: &str, source_directory: &str) -> Self {
        Self {
            version: "1.0".to_string(),
            fabric_id: fabric_id.to_string(),
            fabric_name: None,
            source_directory: source_directory.to_string(),
            raw_directory: default_raw_directory(),
            namespace: default_namespace(),
            database_path: None,
            sync_interval_secs: default_sync_interval(),
            worker_count: default_worker_count(),
            action_timeout_secs: default_action_timeout(),
            retry: RetryConfig::default(),
            archive_suffix: default_archive_suffix(),
            auto_remediate_low_drift: true,
            log: LogConfig::default(),
        }
    }

    pub fn fabric_name(&self) -> &str {
        self.fabric_name.as_deref().unwrap_or(&self.fabric_id)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout_secs)
    }

    /// Configured database path, or the per-user default.
    pub fn database_path(&self) -> Option<PathBuf> {
        match &self.database_path {
            Some(path) => Some(PathBuf::from(path)),
            None => crate::db::default_database_path(),
        }
    }
}

fn default_raw_directory() -> String {
    "raw".to_string()
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_sync_interval() -> u64 {
    60
}

fn default_worker_count() -> usize {
    num_cpus::get()
}

fn default_action_timeout() -> u64 {
    30
}

fn default_archive_suffix() -> String {
    ".processed".to_string()
}

fn default_true() -> bool {
    true
}

/// Exponential backoff for connectivity errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    10_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1),
    /// capped at `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}
