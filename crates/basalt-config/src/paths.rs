//! Path utilities and XDG directory discovery

use crate::ConfigError;
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

/// XDG-compliant paths for Basalt
pub struct Paths {
    project_dirs: Option<ProjectDirs>,
}

impl Paths {
    /// Create a new Paths instance with XDG discovery
    pub fn new() -> Self {
        Self {
            project_dirs: ProjectDirs::from("dev", "Basalt", "basalt"),
        }
    }

    /// Get user config directory (~/.config/basalt/)
    pub fn user_config_dir(&self) -> Result<PathBuf, ConfigError> {
        self.project_dirs
            .as_ref()
            .map(|p| p.config_dir().to_path_buf())
            .ok_or_else(|| {
                ConfigError::XdgError("Failed to determine user config directory".to_string())
            })
    }

    /// Get user config file path (~/.config/basalt/config.toml)
    pub fn user_config_file(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.user_config_dir()?.join("config.toml"))
    }

    /// Get project config file path (basalt.toml)
    pub fn project_config_file(project_dir: impl AsRef<Path>) -> PathBuf {
        project_dir.as_ref().join("basalt.toml")
    }

    /// Get local config file path (basalt.local.toml, gitignored)
    pub fn local_config_file(project_dir: impl AsRef<Path>) -> PathBuf {
        project_dir.as_ref().join("basalt.local.toml")
    }

    /// File recording per-partition view build checkpoints.
    pub fn build_progress_file(data_dir: impl AsRef<Path>) -> PathBuf {
        data_dir.as_ref().join("views_builds_in_progress.json")
    }

    /// File recording which views have finished building.
    pub fn built_views_file(data_dir: impl AsRef<Path>) -> PathBuf {
        data_dir.as_ref().join("built_views.json")
    }

    /// Directory holding flushed segments for one table or view.
    pub fn segment_dir(data_dir: impl AsRef<Path>, name: &str) -> PathBuf {
        data_dir.as_ref().join("segments").join(name)
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}
