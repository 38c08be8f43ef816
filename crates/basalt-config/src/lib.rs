//! Configuration management for Basalt
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. Environment variables (BASALT_* prefix, highest precedence)
//! 2. basalt.local.toml (gitignored, local overrides)
//! 3. basalt.toml (git-tracked, project config)
//! 4. ~/.config/basalt/config.toml (user defaults)
//! 5. Built-in defaults (lowest precedence)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::Paths;

/// Main Basalt configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BasaltConfig {
    pub project: ProjectConfig,
    pub database: DatabaseConfig,
    pub views: ViewsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub name: String,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            name: "basalt-project".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Directory holding flushed table segments and view build bookkeeping.
    pub data_dir: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".basalt/data"),
        }
    }
}

/// Materialized view maintenance settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewsConfig {
    /// Base rows scanned per view build step before the builder yields.
    pub build_batch_size: usize,
    /// Rows per internal chunk when one base modification touches many rows.
    pub propagation_chunk_size: usize,
    /// Largest serialized key component a view may be keyed by, in bytes.
    pub max_key_size: usize,
    /// Update mode for views created without an explicit mode.
    pub default_update_mode: UpdateMode,
    /// Pending asynchronous view updates held before writers fall back to
    /// applying updates inline.
    pub queue_capacity: usize,
    /// Attempts made on a queued update before it is reported as failed.
    pub max_apply_attempts: u32,
}

impl Default for ViewsConfig {
    fn default() -> Self {
        Self {
            build_batch_size: 128,
            propagation_chunk_size: 100,
            max_key_size: 65_535,
            default_update_mode: UpdateMode::Asynchronous,
            queue_capacity: 4096,
            max_apply_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateMode {
    Synchronous,
    Asynchronous,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive, e.g. `"info,basalt_view=debug"`.
    pub filter: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    Pretty,
    Json,
}

impl BasaltConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// Load configuration from specific project directory
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }

    /// Parse a single TOML file, without layering.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::ParseError {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Create a configuration suited to tests: synchronous views, small
    /// queue, and a data directory under `data_dir`.
    pub fn testing(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            database: DatabaseConfig {
                data_dir: data_dir.into(),
            },
            views: ViewsConfig {
                default_update_mode: UpdateMode::Synchronous,
                queue_capacity: 64,
                ..Default::default()
            },
            logging: LoggingConfig {
                filter: "debug".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Rejects settings the view engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let views = &self.views;
        if views.build_batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "views.build_batch_size must be at least 1".to_string(),
            ));
        }
        if views.propagation_chunk_size == 0 {
            return Err(ConfigError::ValidationError(
                "views.propagation_chunk_size must be at least 1".to_string(),
            ));
        }
        if views.queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "views.queue_capacity must be at least 1".to_string(),
            ));
        }
        if views.max_apply_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "views.max_apply_attempts must be at least 1".to_string(),
            ));
        }
        if views.max_key_size == 0 || views.max_key_size > 65_535 {
            return Err(ConfigError::ValidationError(format!(
                "views.max_key_size must be between 1 and 65535, got {}",
                views.max_key_size
            )));
        }
        Ok(())
    }

    /// Resolve relative paths to absolute
    pub fn resolve_paths(&mut self, base_dir: impl AsRef<Path>) {
        let base = base_dir.as_ref();

        if self.database.data_dir.is_relative() {
            self.database.data_dir = base.join(&self.database.data_dir);
        }
    }
}
