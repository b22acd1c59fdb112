//! Runtime configuration for stores and caches

use crate::error::{Result, VdsError};
use serde::{Deserialize, Serialize};

/// Tunables shared by the block store and the region cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Worker threads used for block transforms.
    pub num_threads: usize,

    /// Memory budget for the region cache in megabytes.
    pub cache_size_mb: usize,

    /// Clamp reconstructed values to the recorded data range.
    pub clamp_to_range: bool,

    /// Pad partially covered blocks with the boundary extension instead of
    /// leaving stale or zero voxels in them.
    pub pad_boundaries: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            num_threads: num_cpus::get(),
            cache_size_mb: 256,
            clamp_to_range: true,
            pad_boundaries: true,
        }
    }
}

impl StoreConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unparsable values keep defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(val) = lookup("WAVEVDS_THREADS") {
            if let Ok(n) = val.parse() {
                config.num_threads = n;
            }
        }

        if let Some(val) = lookup("WAVEVDS_CACHE_MB") {
            if let Ok(size) = val.parse() {
                config.cache_size_mb = size;
            }
        }

        if let Some(val) = lookup("WAVEVDS_CLAMP") {
            config.clamp_to_range = parse_flag(&val);
        }

        if let Some(val) = lookup("WAVEVDS_PAD") {
            config.pad_boundaries = parse_flag(&val);
        }

        config
    }

    pub fn with_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    pub fn with_cache_size_mb(mut self, cache_size_mb: usize) -> Self {
        self.cache_size_mb = cache_size_mb;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.num_threads == 0 {
            return Err(VdsError::Configuration(
                "num_threads must be > 0".to_string(),
            ));
        }
        if self.cache_size_mb == 0 {
            return Err(VdsError::Configuration(
                "cache_size_mb must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Cache budget in bytes.
    pub fn cache_size_bytes(&self) -> usize {
        self.cache_size_mb * 1024 * 1024
    }
}

fn parse_flag(val: &str) -> bool {
    matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = StoreConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.clamp_to_range);
        assert_eq!(config.cache_size_bytes(), 256 * 1024 * 1024);
    }

    #[test]
    fn test_lookup_overrides() {
        let env: HashMap<&str, &str> = [
            ("WAVEVDS_THREADS", "3"),
            ("WAVEVDS_CACHE_MB", "oops"),
            ("WAVEVDS_CLAMP", "false"),
            ("WAVEVDS_PAD", "ON"),
        ]
        .into_iter()
        .collect();
        let config = StoreConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.num_threads, 3);
        assert_eq!(config.cache_size_mb, 256);
        assert!(!config.clamp_to_range);
        assert!(config.pad_boundaries);
    }

    #[test]
    fn test_validate_rejects_zero() {
        assert!(StoreConfig::default().with_threads(0).validate().is_err());
        assert!(StoreConfig::default().with_cache_size_mb(0).validate().is_err());
    }
}
