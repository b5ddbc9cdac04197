//! Path utilities and XDG directory discovery.

use crate::ConfigError;
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

/// XDG-compliant paths for Nestor.
pub struct Paths {
    project_dirs: Option<ProjectDirs>,
}

impl Paths {
    /// Create a new Paths instance with XDG discovery.
    pub fn new() -> Self {
        Self {
            project_dirs: ProjectDirs::from("com", "Nestor", "nestor"),
        }
    }

    /// Get user config directory (`~/.config/nestor/`).
    pub fn user_config_dir(&self) -> Result<PathBuf, ConfigError> {
        self.project_dirs
            .as_ref()
            .map(|p| p.config_dir().to_path_buf())
            .ok_or_else(|| {
                ConfigError::XdgError("failed to determine user config directory".to_string())
            })
    }

    /// Get user config file path (`~/.config/nestor/config.toml`).
    pub fn user_config_file(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.user_config_dir()?.join("config.toml"))
    }

    /// Get project config file path (`nestor.toml`).
    pub fn project_config_file(project_dir: impl AsRef<Path>) -> PathBuf {
        project_dir.as_ref().join("nestor.toml")
    }

    /// Get local config file path (`nestor.local.toml`, gitignored).
    pub fn local_config_file(project_dir: impl AsRef<Path>) -> PathBuf {
        project_dir.as_ref().join("nestor.local.toml")
    }

    /// Check if a project is initialized (has `nestor.toml`).
    pub fn is_initialized(project_dir: impl AsRef<Path>) -> bool {
        Self::project_config_file(project_dir).exists()
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xdg_paths() {
        let paths = Paths::new();
        if let Ok(config_dir) = paths.user_config_dir() {
            assert!(config_dir.to_string_lossy().contains("nestor"));
        }
    }

    #[test]
    fn test_project_paths() {
        let temp_dir = tempfile::tempdir().expect("failed to create temp dir");
        let project_dir = temp_dir.path();

        let config_file = Paths::project_config_file(project_dir);
        assert_eq!(config_file, project_dir.join("nestor.toml"));

        let local_file = Paths::local_config_file(project_dir);
        assert_eq!(local_file, project_dir.join("nestor.local.toml"));

        assert!(!Paths::is_initialized(project_dir));
        std::fs::write(&config_file, "storage_file = \"test\"\n").unwrap();
        assert!(Paths::is_initialized(project_dir));
    }
}
