use std::path::{Component, Path};

use crate::config::schema::Config;
use crate::error::ConfigError;
use crate::gitops::resource::ResourceKind;

const SCHEMA_JSON: &str = include_str!("../../../../schema/config-v1.json");

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let config: Config = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    if config.fabric_id.trim().is_empty() {
        return Err(ConfigError::Validation {
            message: "fabric_id must not be empty".to_string(),
        });
    }

    if config.worker_count == 0 {
        return Err(ConfigError::Validation {
            message: "worker_count must be at least 1".to_string(),
        });
    }

    let raw = Path::new(&config.raw_directory);
    if raw
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(ConfigError::Validation {
            message: format!(
                "raw_directory must be relative to source_directory: {}",
                config.raw_directory
            ),
        });
    }

    let Some(first) = raw.components().find_map(|c| match c {
        Component::Normal(name) => Some(name.to_string_lossy()),
        _ => None,
    }) else {
        return Err(ConfigError::Validation {
            message: format!(
                "raw_directory must name a subdirectory of source_directory: '{}'",
                config.raw_directory
            ),
        });
    };
    if ResourceKind::from_directory(&first).is_some() {
        return Err(ConfigError::Validation {
            message: format!(
                "raw_directory '{}' collides with a managed resource directory",
                config.raw_directory
            ),
        });
    }

    // Archived names must not look like YAML or they are ingested again.
    let suffix = config.archive_suffix.to_ascii_lowercase();
    if suffix.ends_with(".yaml") || suffix.ends_with(".yml") {
        return Err(ConfigError::Validation {
            message: format!(
                "archive_suffix '{}' would keep archived files ingestible",
                config.archive_suffix
            ),
        });
    }

    if config.retry.base_delay_ms > config.retry.max_delay_ms {
        return Err(ConfigError::Validation {
            message: "retry.base_delay_ms must not exceed retry.max_delay_ms".to_string(),
        });
    }

    Ok(())
}
