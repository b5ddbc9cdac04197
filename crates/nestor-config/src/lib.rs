//! Configuration loading for the Nestor storage engine.
//!
//! Provides hierarchical configuration loading from multiple sources,
//! lowest to highest precedence:
//! 1. Built-in defaults
//! 2. `~/.config/nestor/config.toml` (user defaults)
//! 3. `nestor.toml` (git-tracked, project config)
//! 4. `nestor.local.toml` (gitignored, local overrides)
//! 5. Environment variables (`NESTOR_*` prefix)
//!
//! Only the scalar options a [`config`] source can express are covered
//! here — `serializer`, `partitioner` and `hmacSecret`'s byte value are
//! runtime objects supplied directly to `Storage::open`, not loaded from
//! TOML or the environment.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::Paths;

/// The scalar options recognized at Storage construction time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageOptions {
    /// Base directory for partition files.
    pub data_directory: PathBuf,
    /// Directory for index files; defaults to `data_directory` when unset.
    pub index_directory: Option<PathBuf>,
    /// Base name shared by partition and index files.
    pub storage_file: String,
    /// Read buffer size in bytes.
    pub read_buffer_size: usize,
    /// Write buffer size in bytes.
    pub write_buffer_size: usize,
    /// Force-flush threshold in buffered documents; 0 means unlimited.
    pub max_write_buffer_documents: usize,
    /// Call an `fsync`-equivalent after every flush.
    pub sync_on_flush: bool,
    /// Allow reads to observe bytes still sitting in the write buffer.
    pub dirty_reads: bool,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            data_directory: PathBuf::from("."),
            index_directory: None,
            storage_file: "storage".to_string(),
            read_buffer_size: 4096,
            write_buffer_size: 16384,
            max_write_buffer_documents: 0,
            sync_on_flush: false,
            dirty_reads: true,
        }
    }
}

impl StorageOptions {
    /// Load configuration from default locations relative to the current
    /// directory.
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// Load configuration from a specific project directory.
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }

    /// Resolves `data_directory` and `index_directory` to absolute paths
    /// and fills `index_directory` from `data_directory` if unset.
    pub fn resolve_paths(&mut self, base_dir: impl AsRef<Path>) {
        let base = base_dir.as_ref();

        if self.data_directory.is_relative() {
            self.data_directory = base.join(&self.data_directory);
        }

        self.index_directory = Some(match self.index_directory.take() {
            Some(dir) if dir.is_relative() => base.join(dir),
            Some(dir) => dir,
            None => self.data_directory.clone(),
        });
    }

    /// Directory index files live in, resolving the `index_directory`
    /// fallback without requiring `resolve_paths` to have run first.
    #[must_use]
    pub fn effective_index_directory(&self) -> PathBuf {
        self.index_directory
            .clone()
            .unwrap_or_else(|| self.data_directory.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_table() {
        let opts = StorageOptions::default();
        assert_eq!(opts.storage_file, "storage");
        assert_eq!(opts.read_buffer_size, 4096);
        assert_eq!(opts.write_buffer_size, 16384);
        assert_eq!(opts.max_write_buffer_documents, 0);
        assert!(!opts.sync_on_flush);
        assert!(opts.dirty_reads);
    }

    #[test]
    fn index_directory_falls_back_to_data_directory() {
        let opts = StorageOptions::default();
        assert_eq!(opts.effective_index_directory(), opts.data_directory);
    }

    #[test]
    fn resolve_paths_makes_everything_absolute() {
        let mut opts = StorageOptions::default();
        opts.data_directory = PathBuf::from("data");
        opts.resolve_paths("/srv/nestor");

        assert_eq!(opts.data_directory, PathBuf::from("/srv/nestor/data"));
        assert_eq!(
            opts.index_directory,
            Some(PathBuf::from("/srv/nestor/data"))
        );
    }
}
