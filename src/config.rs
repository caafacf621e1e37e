use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::storage::PoolConfig;

/// Engine configuration, usually read from `holdfast.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HoldfastConfig {
    /// Maximum pooled connections
    pub max_connections: usize,
    /// How long a caller may wait for a pooled connection; unset waits forever
    pub acquire_timeout_ms: Option<u64>,
    pub busy_timeout_ms: u64,
    /// Drop stored columns a descriptor no longer declares
    pub drop_unknown_columns: bool,
    /// Days between compactions; 0 disables interval compaction
    pub compaction_interval_days: u32,
    pub force_compaction: bool,
    pub compact_on_close: bool,
    /// Period of the background compactor; unset disables it
    pub background_compaction_minutes: Option<u64>,
    /// Rows fetched per query window
    pub fetch_scale: usize,
    /// Strongly held records per type
    pub cache_capacity: usize,
}

impl Default for HoldfastConfig {
    fn default() -> Self {
        Self {
            max_connections: 16,
            acquire_timeout_ms: None,
            busy_timeout_ms: 5000,
            drop_unknown_columns: false,
            compaction_interval_days: 7,
            force_compaction: false,
            compact_on_close: true,
            background_compaction_minutes: None,
            fetch_scale: 50,
            cache_capacity: 1024,
        }
    }
}

impl HoldfastConfig {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout_ms.map(Duration::from_millis))
            .busy_timeout(Duration::from_millis(self.busy_timeout_ms))
    }

    pub fn background_period(&self) -> Option<Duration> {
        self.background_compaction_minutes
            .filter(|m| *m > 0)
            .map(|m| Duration::from_secs(m * 60))
    }
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("holdfast.toml")
}

pub fn database_path(root: &Path) -> PathBuf {
    root.join("holdfast.db")
}

pub fn lob_dir(root: &Path) -> PathBuf {
    root.join("lobs")
}

pub fn journal_path(root: &Path) -> PathBuf {
    lob_dir(root).join("pending.journal")
}

pub fn marker_path(root: &Path) -> PathBuf {
    root.join("compaction.marker")
}

pub fn load_config(path: Option<&Path>) -> anyhow::Result<Option<HoldfastConfig>> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    if !path.exists() {
        return Ok(None);
    }

    let contents = std::fs::read_to_string(&path)?;
    let config: HoldfastConfig = toml::from_str(&contents)?;
    Ok(Some(config))
}

pub fn write_config(path: &Path, config: &HoldfastConfig, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("config already exists at {} (use --force to overwrite)", path.display());
    }

    let contents = toml::to_string_pretty(config)?;
    std::fs::write(path, contents)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: HoldfastConfig = toml::from_str("max_connections = 1\nfetch_scale = 8\n").unwrap();
        assert_eq!(config.max_connections, 1);
        assert_eq!(config.fetch_scale, 8);
        assert_eq!(config.compaction_interval_days, 7);
        assert!(config.compact_on_close);
        assert!(config.background_period().is_none());
    }

    #[test]
    fn test_write_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("holdfast.toml");
        let config = HoldfastConfig {
            drop_unknown_columns: true,
            acquire_timeout_ms: Some(250),
            ..Default::default()
        };
        write_config(&path, &config, false).unwrap();
        assert!(write_config(&path, &config, false).is_err());

        let loaded = load_config(Some(&path)).unwrap().unwrap();
        assert!(loaded.drop_unknown_columns);
        assert_eq!(loaded.pool_config().acquire_timeout, Some(Duration::from_millis(250)));
    }
}
