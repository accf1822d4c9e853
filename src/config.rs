use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where the shared history lives and how transactions reach it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    /// Address of the shared repository (path or URL)
    pub remote: String,

    /// Local bare working copy used by transactions
    #[serde(default = "default_working_copy")]
    pub working_copy: PathBuf,

    /// Reuse the working copy between transactions when it is safe
    #[serde(default = "default_true")]
    pub reuse_working_copy: bool,

    /// How often a rejected transaction is retried
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
}

/// Complete settings file
///
/// ```toml
/// remote = "/srv/sync/history.git"
/// max_retries = 5
///
/// [folders]
/// docs = "/home/me/Documents"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(flatten)]
    pub store: StoreConfig,

    /// Accept modification times this many seconds apart as equal
    #[serde(default)]
    pub mtime_tolerance_secs: u64,

    /// Folder name -> local path
    #[serde(default)]
    pub folders: BTreeMap<String, PathBuf>,
}

fn default_working_copy() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("syncpoint")
        .join("working-copy")
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> usize {
    3
}

impl Config {
    /// Default config file location (`~/.config/syncpoint/config.toml`)
    pub fn config_path() -> Result<PathBuf> {
        let dir = dirs::config_dir().ok_or_else(|| {
            SyncError::Config("Cannot determine config directory (HOME not set)".to_string())
        })?;
        Ok(dir.join("syncpoint").join("config.toml"))
    }

    /// Load from `path`, or from the default location
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };

        let content = std::fs::read_to_string(&path).map_err(|e| {
            SyncError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::parse(&content)?;
        tracing::debug!(
            "Loaded config from {} ({} folder(s))",
            path.display(),
            config.folders.len()
        );
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| SyncError::Config(format!("Invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.store.remote.trim().is_empty() {
            return Err(SyncError::Config("remote must not be empty".to_string()));
        }
        for name in self.folders.keys() {
            if name.is_empty() || name.contains('/') {
                return Err(SyncError::Config(format!(
                    "Invalid folder name '{}': must be non-empty and contain no '/'",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn folder(&self, name: &str) -> Result<&Path> {
        self.folders
            .get(name)
            .map(PathBuf::as_path)
            .ok_or_else(|| SyncError::Config(format!("Folder '{}' is not configured", name)))
    }

    pub fn mtime_tolerance(&self) -> Duration {
        Duration::from_secs(self.mtime_tolerance_secs)
    }
}
