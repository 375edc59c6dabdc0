//! Engine configuration.
//!
//! All fields have defaults, so a TOML document only needs to name what it
//! overrides:
//!
//! ```toml
//! root_path = "/var/lib/seglog"
//! max_segment_size = 1048576
//! index_density = 0.1
//! ```

use crate::types::{LogError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory holding one sub-directory per topic.
    #[serde(default = "default_root_path")]
    pub root_path: PathBuf,

    /// Rotate the head segment once it grows past this many bytes (default: 100MB)
    #[serde(default = "default_max_segment_size")]
    pub max_segment_size: u64,

    /// Fraction of records recorded in the sparse index, `0 < density <= 1` (default: 0.01)
    #[serde(default = "default_index_density")]
    pub index_density: f64,

    /// Period of the background index timer in milliseconds, 0 disables it (default: 10s)
    #[serde(default = "default_index_interval_ms")]
    pub index_interval_ms: u64,

    /// How often a following read re-checks for new records (default: 100ms)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// TTL applied to following reads when the caller passes none (default: 30s)
    #[serde(default = "default_read_ttl_ms")]
    pub read_ttl_ms: u64,

    /// Soft cap on the payload bytes of one emitted batch (default: 4MB)
    #[serde(default = "default_batch_byte_cap")]
    pub batch_byte_cap: usize,

    /// fsync the head segment after every batch (default: false)
    #[serde(default)]
    pub sync_on_write: bool,

    /// Reject writes, topic creation and topic drops (default: false)
    #[serde(default)]
    pub read_only: bool,

    /// Number of decoded sealed-segment indexes kept in memory per topic (default: 64)
    #[serde(default = "default_index_cache_capacity")]
    pub index_cache_capacity: usize,
}

fn default_root_path() -> PathBuf {
    PathBuf::from("./data")
}

fn default_max_segment_size() -> u64 {
    100 * 1024 * 1024
}

fn default_index_density() -> f64 {
    0.01
}

fn default_index_interval_ms() -> u64 {
    10_000
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_read_ttl_ms() -> u64 {
    30_000
}

fn default_batch_byte_cap() -> usize {
    4 * 1024 * 1024
}

fn default_index_cache_capacity() -> usize {
    64
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            root_path: default_root_path(),
            max_segment_size: default_max_segment_size(),
            index_density: default_index_density(),
            index_interval_ms: default_index_interval_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            read_ttl_ms: default_read_ttl_ms(),
            batch_byte_cap: default_batch_byte_cap(),
            sync_on_write: false,
            read_only: false,
            index_cache_capacity: default_index_cache_capacity(),
        }
    }
}

impl EngineConfig {
    pub fn new(root_path: impl Into<PathBuf>) -> Self {
        Self {
            root_path: root_path.into(),
            ..Default::default()
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: EngineConfig =
            toml::from_str(raw).map_err(|e| LogError::Config(format!("failed to parse: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.index_density > 0.0 && self.index_density <= 1.0) {
            return Err(LogError::Config(format!(
                "index_density must be in (0, 1], got {}",
                self.index_density
            )));
        }
        if self.max_segment_size == 0 {
            return Err(LogError::Config(
                "max_segment_size must be greater than 0".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(LogError::Config(
                "poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Store one index entry for every this many records.
    pub fn one_in_every(&self) -> u64 {
        ((1.0 / self.index_density).floor() as u64).max(1)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn read_ttl(&self) -> Duration {
        Duration::from_millis(self.read_ttl_ms)
    }

    pub fn index_interval(&self) -> Option<Duration> {
        (self.index_interval_ms > 0).then(|| Duration::from_millis(self.index_interval_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            root_path = "/tmp/seglog"
            max_segment_size = 4096
            index_density = 0.1
            "#,
        )
        .unwrap();

        assert_eq!(config.root_path, PathBuf::from("/tmp/seglog"));
        assert_eq!(config.max_segment_size, 4096);
        assert_eq!(config.one_in_every(), 10);
        assert_eq!(config.poll_interval_ms, 100);
        assert!(!config.read_only);
    }

    #[test]
    fn test_density_is_validated() {
        let err = EngineConfig::from_toml_str("index_density = 0.0").unwrap_err();
        assert!(matches!(err, LogError::Config(_)));

        let err = EngineConfig::from_toml_str("index_density = 1.5").unwrap_err();
        assert!(matches!(err, LogError::Config(_)));

        let config = EngineConfig::from_toml_str("index_density = 1.0").unwrap();
        assert_eq!(config.one_in_every(), 1);
    }

    #[test]
    fn test_index_timer_can_be_disabled() {
        let config = EngineConfig::from_toml_str("index_interval_ms = 0").unwrap();
        assert_eq!(config.index_interval(), None);
        assert_eq!(
            EngineConfig::default().index_interval(),
            Some(Duration::from_secs(10))
        );
    }
}
