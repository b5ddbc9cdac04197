//! Configuration loader with multi-source merging.

use crate::{Paths, StorageOptions};
use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};

/// Configuration loader with builder pattern.
pub struct ConfigLoader {
    project_dir: PathBuf,
    env_prefix: String,
}

impl ConfigLoader {
    /// Create a new config loader with default project directory (current dir).
    pub fn new() -> Self {
        Self {
            project_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env_prefix: "NESTOR".to_string(),
        }
    }

    /// Set the project directory.
    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Set the environment variable prefix (default: "NESTOR").
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Load configuration from all sources with proper precedence.
    pub fn load(self) -> Result<StorageOptions> {
        let mut builder = config::Config::builder();

        // 1. Start with built-in defaults.
        let defaults = StorageOptions::default();
        builder = builder.add_source(config::Config::try_from(&defaults)?);

        // 2. User config (~/.config/nestor/config.toml).
        let paths = Paths::new();
        if let Ok(user_config_file) = paths.user_config_file() {
            if user_config_file.exists() {
                builder = builder.add_source(
                    config::File::from(user_config_file)
                        .required(false)
                        .format(config::FileFormat::Toml),
                );
            }
        }

        // 3. Project config (nestor.toml).
        let project_config_file = Paths::project_config_file(&self.project_dir);
        if project_config_file.exists() {
            builder = builder.add_source(
                config::File::from(project_config_file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        // 4. Local config (nestor.local.toml, gitignored).
        let local_config_file = Paths::local_config_file(&self.project_dir);
        if local_config_file.exists() {
            builder = builder.add_source(
                config::File::from(local_config_file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        // 5. Environment variables (NESTOR_*).
        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .separator("_")
                .try_parsing(true),
        );

        let config = builder.build().context("failed to build configuration")?;

        let mut options: StorageOptions = config
            .try_deserialize()
            .context("failed to deserialize configuration")?;

        options.resolve_paths(&self.project_dir);

        Ok(options)
    }

    /// Load configuration or return defaults if not found.
    pub fn load_or_default(self) -> StorageOptions {
        self.load().unwrap_or_default()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_load_defaults() {
        let temp_dir = tempdir().expect("failed to create temp dir");
        let options = ConfigLoader::new()
            .with_project_dir(temp_dir.path())
            .load()
            .expect("failed to load config");

        assert_eq!(options.storage_file, "storage");
        assert_eq!(options.read_buffer_size, 4096);
    }

    #[test]
    fn test_load_project_config() {
        let temp_dir = tempdir().expect("failed to create temp dir");
        let project_dir = temp_dir.path();

        let config_content = r#"
storage_file = "events"
write_buffer_size = 65536
sync_on_flush = true
"#;
        fs::write(project_dir.join("nestor.toml"), config_content)
            .expect("failed to write config");

        let options = ConfigLoader::new()
            .with_project_dir(project_dir)
            .load()
            .expect("failed to load config");

        assert_eq!(options.storage_file, "events");
        assert_eq!(options.write_buffer_size, 65536);
        assert!(options.sync_on_flush);
    }

    #[test]
    fn test_local_overrides() {
        let temp_dir = tempdir().expect("failed to create temp dir");
        let project_dir = temp_dir.path();

        fs::write(
            project_dir.join("nestor.toml"),
            "storage_file = \"events\"\n",
        )
        .expect("failed to write project config");

        fs::write(
            project_dir.join("nestor.local.toml"),
            "storage_file = \"events-local\"\n",
        )
        .expect("failed to write local config");

        let options = ConfigLoader::new()
            .with_project_dir(project_dir)
            .load()
            .expect("failed to load config");

        assert_eq!(options.storage_file, "events-local");
    }

    #[test]
    fn test_path_resolution() {
        let temp_dir = tempdir().expect("failed to create temp dir");
        let project_dir = temp_dir.path();

        let options = ConfigLoader::new()
            .with_project_dir(project_dir)
            .load()
            .expect("failed to load config");

        assert!(options.data_directory.is_absolute());
        assert!(options.index_directory.unwrap().is_absolute());
    }
}
