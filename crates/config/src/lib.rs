//! Engine configuration, validated at init and frozen to `config.json` on
//! first start.  Unknown keys are rejected so a typo'd override fails loudly
//! instead of silently falling back to a default.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct MindCacheConfig {
    /// Root directory for segments, index snapshots, and session sidecars.
    pub storage_path: PathBuf,
    /// Start the background decay scheduler on open.
    pub auto_decay_enabled: bool,
    /// Period between automatic decay sweeps.
    pub decay_interval_hours: u64,
    /// TTL applied to memories saved without an explicit expiry.
    pub default_memory_ttl_hours: u64,
    /// Compress record bodies at or above `compression_threshold` bytes.
    pub enable_compression: bool,
    /// Hard per-user record cap, enforced by eviction rather than rejection.
    pub max_memories_per_user: usize,
    /// Low-importance sweep cutoff.
    pub importance_threshold: f32,
    /// Active segment rolls once it reaches this many bytes.
    pub segment_roll_bytes: u64,
    /// Sealed segments are compacted when their live fraction drops below this.
    pub compaction_threshold: f64,
    /// Minimum record body size that triggers compression.
    pub compression_threshold: usize,
    /// Decay evictions in one sweep that force a compaction pass.
    pub compaction_min_evictions: usize,
    /// Seconds between periodic index snapshots.
    pub index_snapshot_interval_secs: u64,
    /// Seconds between flushes of batched access-metadata updates.
    pub access_flush_interval_secs: u64,
}

impl Default for MindCacheConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("./mindcache_data"),
            auto_decay_enabled: true,
            decay_interval_hours: 24,
            default_memory_ttl_hours: 720,
            enable_compression: true,
            max_memories_per_user: 10_000,
            importance_threshold: 0.3,
            segment_roll_bytes: 64 * 1024 * 1024,
            compaction_threshold: 0.5,
            compression_threshold: 1024,
            compaction_min_evictions: 1000,
            index_snapshot_interval_secs: 60,
            access_flush_interval_secs: 10,
        }
    }
}

impl MindCacheConfig {
    /// Parse a config from JSON, rejecting unknown keys.
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw).context("parsing config.json")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config at {}", path.display()))?;
        Self::from_json(&raw)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let rendered = serde_json::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage_path.as_os_str().is_empty() {
            bail!("storage_path must not be empty");
        }
        if self.decay_interval_hours == 0 {
            bail!("decay_interval_hours must be positive");
        }
        if self.default_memory_ttl_hours == 0 {
            bail!("default_memory_ttl_hours must be positive");
        }
        if self.max_memories_per_user == 0 {
            bail!("max_memories_per_user must be positive");
        }
        if !(0.0..=1.0).contains(&self.importance_threshold) {
            bail!(
                "importance_threshold must be within [0.0, 1.0], got {}",
                self.importance_threshold
            );
        }
        if self.segment_roll_bytes < 4096 {
            bail!("segment_roll_bytes must be at least 4096");
        }
        if !(0.0..=1.0).contains(&self.compaction_threshold) {
            bail!(
                "compaction_threshold must be within [0.0, 1.0], got {}",
                self.compaction_threshold
            );
        }
        if self.compression_threshold == 0 {
            bail!("compression_threshold must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::MindCacheConfig;

    #[test]
    fn defaults_match_documented_values() {
        let config = MindCacheConfig::default();
        assert_eq!(config.decay_interval_hours, 24);
        assert_eq!(config.default_memory_ttl_hours, 720);
        assert_eq!(config.max_memories_per_user, 10_000);
        assert_eq!(config.segment_roll_bytes, 67_108_864);
        assert!(config.enable_compression);
        config.validate().expect("defaults must validate");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let raw = r#"{ "storage_path": "./data", "max_memoriez": 5 }"#;
        assert!(MindCacheConfig::from_json(raw).is_err());
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        let raw = r#"{ "importance_threshold": 1.5 }"#;
        assert!(MindCacheConfig::from_json(raw).is_err());
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        let mut config = MindCacheConfig::default();
        config.max_memories_per_user = 3;
        config.save_to(&path).expect("save");

        let loaded = MindCacheConfig::load_from(&path).expect("load");
        assert_eq!(loaded, config);
    }
}
