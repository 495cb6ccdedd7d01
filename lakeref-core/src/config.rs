//! Adapter configuration
//!
//! Stored as `lakeref-config.json` next to a repository. A missing file means
//! defaults.

use crate::adapter::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// File name of the configuration document
pub const CONFIG_FILE_NAME: &str = "lakeref-config.json";

/// Tunables shared by every backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Length of the ancestor list kept in each commit's scan acceleration
    #[serde(default = "default_parents_per_commit")]
    pub parents_per_commit: usize,
    /// Number of commits between two full key-list checkpoints
    #[serde(default = "default_key_list_distance")]
    pub key_list_distance: u32,
    /// Branch created by `initialize_repo` when the caller has no preference
    #[serde(default = "default_branch")]
    pub default_branch: String,
    /// Rows fetched per page by paginated scans
    #[serde(default = "default_scan_page_size")]
    pub scan_page_size: usize,
}

fn default_parents_per_commit() -> usize {
    20
}

fn default_key_list_distance() -> u32 {
    20
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_scan_page_size() -> usize {
    256
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            parents_per_commit: default_parents_per_commit(),
            key_list_distance: default_key_list_distance(),
            default_branch: default_branch(),
            scan_page_size: default_scan_page_size(),
        }
    }
}

impl AdapterConfig {
    pub fn with_parents_per_commit(mut self, parents_per_commit: usize) -> Self {
        self.parents_per_commit = parents_per_commit.max(1);
        self
    }

    pub fn with_key_list_distance(mut self, key_list_distance: u32) -> Self {
        self.key_list_distance = key_list_distance.max(1);
        self
    }

    pub fn with_scan_page_size(mut self, scan_page_size: usize) -> Self {
        self.scan_page_size = scan_page_size.max(1);
        self
    }

    /// Path of the configuration document for a repository directory
    pub fn file_path(repo_dir: &Path) -> PathBuf {
        repo_dir.join(CONFIG_FILE_NAME)
    }

    /// Load the configuration from a repository directory
    pub fn load(repo_dir: &Path) -> StoreResult<Self> {
        let config_path = Self::file_path(repo_dir);
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&config_path)?;
        let config: AdapterConfig = serde_json::from_str(&data).map_err(|e| {
            StoreError::Corrupted(format!("failed to parse {:?}: {}", config_path, e))
        })?;
        Ok(config.normalized())
    }

    /// Save the configuration into a repository directory
    pub fn save(&self, repo_dir: &Path) -> StoreResult<()> {
        fs::create_dir_all(repo_dir)?;
        let config_path = Self::file_path(repo_dir);
        let tmp_path = config_path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)
            .map_err(|e| StoreError::Corrupted(format!("failed to encode config: {}", e)))?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, &config_path)?;
        Ok(())
    }

    // Zero values would stall checkpointing and paging.
    fn normalized(self) -> Self {
        Self {
            parents_per_commit: self.parents_per_commit.max(1),
            key_list_distance: self.key_list_distance.max(1),
            scan_page_size: self.scan_page_size.max(1),
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = AdapterConfig::load(dir.path()).unwrap();
        assert_eq!(config, AdapterConfig::default());
        assert_eq!(config.parents_per_commit, 20);
        assert_eq!(config.key_list_distance, 20);
        assert_eq!(config.default_branch, "main");
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let config = AdapterConfig::default()
            .with_key_list_distance(5)
            .with_parents_per_commit(3);
        config.save(dir.path()).unwrap();

        let loaded = AdapterConfig::load(dir.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_document_fills_defaults() {
        let dir = TempDir::new().unwrap();
        fs::write(
            AdapterConfig::file_path(dir.path()),
            r#"{ "key_list_distance": 0, "default_branch": "trunk" }"#,
        )
        .unwrap();

        let loaded = AdapterConfig::load(dir.path()).unwrap();
        assert_eq!(loaded.default_branch, "trunk");
        assert_eq!(loaded.key_list_distance, 1);
        assert_eq!(loaded.parents_per_commit, 20);
    }
}
