//! Configuration management
//!
//! Serde-backed configuration for the pool, the cache, and the engine,
//! with defaults suitable for a single-process deployment. Durations are
//! stored as integer milliseconds in serialized form.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Serde adapter storing a [`Duration`] as integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

/// Like [`duration_ms`], for optional durations.
pub(crate) mod duration_ms_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let ms = Option::<u64>::deserialize(deserializer)?;
        Ok(ms.map(Duration::from_millis))
    }
}

/// Like [`duration_ms`], for per-category duration maps.
pub(crate) mod duration_ms_map {
    use std::collections::HashMap;
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        value: &HashMap<String, Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let ms: HashMap<&str, u64> = value
            .iter()
            .map(|(category, ttl)| (category.as_str(), ttl.as_millis() as u64))
            .collect();
        ms.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<HashMap<String, Duration>, D::Error> {
        let ms = HashMap::<String, u64>::deserialize(deserializer)?;
        Ok(ms
            .into_iter()
            .map(|(category, ttl)| (category, Duration::from_millis(ttl)))
            .collect())
    }
}

/// Default worker count: `min(8, available parallelism)`.
#[must_use]
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism().map_or(4, |n| n.get().min(8))
}

/// Worker pool configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of workers created by `initialize`.
    pub num_workers: usize,
    /// Queue capacity; submissions beyond it are rejected.
    pub max_queue_size: usize,
    /// Delay before a crashed worker is recreated.
    #[serde(with = "duration_ms")]
    pub respawn_delay: Duration,
    /// Grace period for in-flight work at shutdown.
    #[serde(with = "duration_ms")]
    pub shutdown_timeout: Duration,
    /// Poll cadence used by `wait_for_completion`.
    #[serde(with = "duration_ms")]
    pub completion_poll_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_workers: default_worker_count(),
            max_queue_size: 1000,
            respawn_delay: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
            completion_poll_interval: Duration::from_millis(50),
        }
    }
}

impl PoolConfig {
    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.max_queue_size == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }
        Ok(())
    }
}

/// Result cache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries held.
    pub max_size: usize,
    /// TTL applied when the category has no specific policy.
    #[serde(with = "duration_ms")]
    pub default_ttl: Duration,
    /// TTL per category, in milliseconds.
    #[serde(with = "duration_ms_map")]
    pub ttl_by_category: HashMap<String, Duration>,
    /// Minimum similarity score treated as a hit.
    pub similarity_threshold: f64,
    /// Snapshot file location; persistence is disabled when unset.
    pub snapshot_path: Option<PathBuf>,
    /// Cadence of the background expiry sweep; `None` disables it.
    #[serde(with = "duration_ms_opt")]
    pub sweep_interval: Option<Duration>,
    /// Cadence of snapshot autosave; `None` disables it.
    #[serde(with = "duration_ms_opt")]
    pub autosave_interval: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let day = Duration::from_secs(24 * 60 * 60);
        Self {
            max_size: 1000,
            default_ttl: Duration::from_secs(60 * 60),
            ttl_by_category: HashMap::from([
                ("extraction".to_string(), day * 7),
                ("jurisprudence".to_string(), day * 30),
                ("analysis".to_string(), Duration::from_secs(6 * 60 * 60)),
                ("validation".to_string(), day),
            ]),
            similarity_threshold: 0.85,
            snapshot_path: None,
            sweep_interval: Some(Duration::from_secs(60)),
            autosave_interval: None,
        }
    }
}

impl CacheConfig {
    /// Resolves the TTL for a category.
    #[must_use]
    pub fn ttl_for(&self, category: &str) -> Duration {
        self.ttl_by_category
            .get(category)
            .copied()
            .unwrap_or(self.default_ttl)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size == 0 {
            return Err(ConfigError::ZeroCacheCapacity);
        }
        if !self.similarity_threshold.is_finite()
            || !(0.0..=1.0).contains(&self.similarity_threshold)
        {
            return Err(ConfigError::ThresholdOutOfRange {
                value: self.similarity_threshold,
            });
        }
        Ok(())
    }
}

/// Top-level configuration: one pool, one cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker pool settings.
    pub pool: PoolConfig,
    /// Result cache settings.
    pub cache: CacheConfig,
}

impl EngineConfig {
    /// Parses and validates a YAML document.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_yaml::from_str(text).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads, parses, and validates a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::Io(format!("{}: {err}", path.display())))?;
        Self::from_yaml_str(&text)
    }

    /// Checks both sections.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pool.validate()?;
        self.cache.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert!(config.num_workers >= 1 && config.num_workers <= 8);
        assert_eq!(config.max_queue_size, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cache_config_default() {
        let config = CacheConfig::default();
        assert_eq!(config.max_size, 1000);
        assert!((config.similarity_threshold - 0.85).abs() < f64::EPSILON);
        assert_eq!(
            config.ttl_for("validation"),
            Duration::from_secs(24 * 60 * 60)
        );
        assert_eq!(config.ttl_for("unknown-category"), config.default_ttl);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_capacities() {
        let config = PoolConfig {
            num_workers: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroWorkers));

        let config = CacheConfig {
            max_size: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroCacheCapacity));
    }

    #[test]
    fn test_validate_rejects_bad_threshold() {
        let config = CacheConfig {
            similarity_threshold: 1.5,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::ThresholdOutOfRange { value: 1.5 })
        );
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config = EngineConfig::from_yaml_str("pool:\n  num_workers: 2\n").unwrap();
        assert_eq!(config.pool.num_workers, 2);
        assert_eq!(config.pool.max_queue_size, 1000);
        assert_eq!(config.cache.max_size, 1000);
    }

    #[test]
    fn test_yaml_round_trip() {
        let mut config = EngineConfig::default();
        config.pool.num_workers = 3;
        config.cache.sweep_interval = None;
        config.cache.autosave_interval = Some(Duration::from_secs(120));
        config.cache.snapshot_path = Some(PathBuf::from("/tmp/cache.json"));

        let text = serde_yaml::to_string(&config).unwrap();
        let parsed = EngineConfig::from_yaml_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_invalid_yaml_is_a_parse_error() {
        let err = EngineConfig::from_yaml_str("pool: [not, a, map]").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
