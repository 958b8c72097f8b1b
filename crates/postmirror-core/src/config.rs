//! Runtime configuration shared by the sync engine and the hybrid reader.
//!
//! [`RuntimeConfig`] is hot-swappable: callers hold a [`SharedConfig`] and
//! apply [`RuntimeConfigPatch`] merges; readers take a snapshot per operation.

use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::classify::FallbackConditions;
use crate::error::Error;
use crate::models::ResolutionStrategy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Records per chunk
    pub batch_size: usize,
    /// Read attempts per origin; extra attempts per failed record write
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub cache_ttl_secs: u64,
    /// Simultaneous record operations within a chunk
    pub max_concurrency: usize,
    pub delay_between_batches_ms: u64,
    pub conflict_resolution: ResolutionStrategy,
    pub sync_interval_secs: u64,
    pub fallback_enabled: bool,
    pub fallback_conditions: FallbackConditions,
    pub health_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_retries: 3,
            retry_base_delay_ms: 1_000,
            max_retry_delay_ms: 30_000,
            cache_ttl_secs: 300,
            max_concurrency: 3,
            delay_between_batches_ms: 1_000,
            conflict_resolution: ResolutionStrategy::SourceWins,
            sync_interval_secs: 300,
            fallback_enabled: true,
            fallback_conditions: FallbackConditions::default(),
            health_timeout_ms: 5_000,
        }
    }
}

impl RuntimeConfig {
    pub const fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub const fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    pub const fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub const fn delay_between_batches(&self) -> Duration {
        Duration::from_millis(self.delay_between_batches_ms)
    }

    pub const fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub const fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    /// Merge every field set in `patch` into this config
    pub fn apply(&mut self, patch: &RuntimeConfigPatch) {
        if let Some(value) = patch.batch_size {
            self.batch_size = value;
        }
        if let Some(value) = patch.max_retries {
            self.max_retries = value;
        }
        if let Some(value) = patch.retry_base_delay_ms {
            self.retry_base_delay_ms = value;
        }
        if let Some(value) = patch.max_retry_delay_ms {
            self.max_retry_delay_ms = value;
        }
        if let Some(value) = patch.cache_ttl_secs {
            self.cache_ttl_secs = value;
        }
        if let Some(value) = patch.max_concurrency {
            self.max_concurrency = value;
        }
        if let Some(value) = patch.delay_between_batches_ms {
            self.delay_between_batches_ms = value;
        }
        if let Some(value) = patch.conflict_resolution {
            self.conflict_resolution = value;
        }
        if let Some(value) = patch.sync_interval_secs {
            self.sync_interval_secs = value;
        }
        if let Some(value) = patch.fallback_enabled {
            self.fallback_enabled = value;
        }
        if let Some(value) = patch.fallback_conditions {
            self.fallback_conditions = value;
        }
        if let Some(value) = patch.health_timeout_ms {
            self.health_timeout_ms = value;
        }
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidInput("batch_size must be >= 1".into()));
        }
        if self.max_concurrency == 0 {
            return Err(Error::InvalidInput("max_concurrency must be >= 1".into()));
        }
        if self.max_retry_delay_ms < self.retry_base_delay_ms {
            return Err(Error::InvalidInput(
                "max_retry_delay_ms must be >= retry_base_delay_ms".into(),
            ));
        }
        Ok(())
    }

    /// Read the tuning knobs from environment-style lookups.
    ///
    /// Unset variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            batch_size: parse_in_range(&lookup, "SYNC_BATCH_SIZE", defaults.batch_size, 1..=100)?,
            max_retries: parse_in_range(&lookup, "SYNC_MAX_RETRIES", defaults.max_retries, 0..=10)?,
            retry_base_delay_ms: parse_in_range(
                &lookup,
                "SYNC_RETRY_DELAY_MS",
                defaults.retry_base_delay_ms,
                100..=60_000,
            )?,
            max_retry_delay_ms: parse_in_range(
                &lookup,
                "SYNC_MAX_RETRY_DELAY_MS",
                defaults.max_retry_delay_ms,
                100..=300_000,
            )?,
            cache_ttl_secs: parse_in_range(
                &lookup,
                "CACHE_TTL_SECS",
                defaults.cache_ttl_secs,
                0..=86_400,
            )?,
            max_concurrency: parse_in_range(
                &lookup,
                "SYNC_MAX_CONCURRENCY",
                defaults.max_concurrency,
                1..=32,
            )?,
            delay_between_batches_ms: parse_in_range(
                &lookup,
                "SYNC_BATCH_DELAY_MS",
                defaults.delay_between_batches_ms,
                0..=60_000,
            )?,
            conflict_resolution: parse_value(
                &lookup,
                "SYNC_CONFLICT_RESOLUTION",
                defaults.conflict_resolution,
            )?,
            sync_interval_secs: defaults.sync_interval_secs,
            fallback_enabled: parse_value(&lookup, "FALLBACK_ENABLED", defaults.fallback_enabled)?,
            fallback_conditions: defaults.fallback_conditions,
            health_timeout_ms: parse_in_range(
                &lookup,
                "HEALTH_TIMEOUT_MS",
                defaults.health_timeout_ms,
                100..=60_000,
            )?,
        };
        if config.max_retry_delay_ms < config.retry_base_delay_ms {
            return Err(ConfigError::Invalid(
                "SYNC_MAX_RETRY_DELAY_MS must be >= SYNC_RETRY_DELAY_MS".to_string(),
            ));
        }
        Ok(config)
    }
}

/// Partial update; `None` fields are left untouched
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfigPatch {
    pub batch_size: Option<usize>,
    pub max_retries: Option<u32>,
    pub retry_base_delay_ms: Option<u64>,
    pub max_retry_delay_ms: Option<u64>,
    pub cache_ttl_secs: Option<u64>,
    pub max_concurrency: Option<usize>,
    pub delay_between_batches_ms: Option<u64>,
    pub conflict_resolution: Option<ResolutionStrategy>,
    pub sync_interval_secs: Option<u64>,
    pub fallback_enabled: Option<bool>,
    pub fallback_conditions: Option<FallbackConditions>,
    pub health_timeout_ms: Option<u64>,
}

/// Handle to the live configuration, cloned into every service
#[derive(Clone, Default)]
pub struct SharedConfig(Arc<RwLock<RuntimeConfig>>);

impl SharedConfig {
    pub fn new(config: RuntimeConfig) -> Self {
        Self(Arc::new(RwLock::new(config)))
    }

    /// Copy of the current values
    pub fn snapshot(&self) -> RuntimeConfig {
        self.0.read().clone()
    }

    /// Merge `patch`, rejecting it when the result would be invalid
    pub fn update(&self, patch: &RuntimeConfigPatch) -> crate::Result<RuntimeConfig> {
        let mut guard = self.0.write();
        let mut next = guard.clone();
        next.apply(patch);
        next.validate()?;
        *guard = next.clone();
        drop(guard);
        tracing::info!(?patch, "Runtime configuration updated");
        Ok(next)
    }
}

impl fmt::Debug for SharedConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_tuple("SharedConfig")
            .field(&*self.0.read())
            .finish()
    }
}

pub fn value_or_default(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: &str,
) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

pub fn required_trimmed(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    optional_trimmed(lookup, name).ok_or(ConfigError::MissingVar(name))
}

pub fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

/// Parse `name` with `FromStr`, keeping `default` when unset
pub fn parse_value<T>(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
{
    optional_trimmed(lookup, name).map_or(Ok(default), |raw| {
        raw.parse::<T>()
            .map_err(|_| ConfigError::Invalid(format!("{name} has an invalid value: {raw}")))
    })
}

/// Parse an integer knob and check it against `range`
pub fn parse_in_range<T>(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
    range: RangeInclusive<T>,
) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + fmt::Display + Copy,
{
    let invalid = || {
        ConfigError::Invalid(format!(
            "{name} must be an integer in [{}, {}]",
            range.start(),
            range.end()
        ))
    };
    let value = match optional_trimmed(lookup, name) {
        Some(raw) => raw.parse::<T>().map_err(|_| invalid())?,
        None => default,
    };
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(invalid())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = RuntimeConfig::default();
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.max_concurrency, 3);
        assert_eq!(config.cache_ttl(), Duration::from_secs(300));
        assert_eq!(config.conflict_resolution, ResolutionStrategy::SourceWins);
    }

    #[test]
    fn patch_merges_only_set_fields() {
        let shared = SharedConfig::default();
        let updated = shared
            .update(&RuntimeConfigPatch {
                batch_size: Some(25),
                conflict_resolution: Some(ResolutionStrategy::Merge),
                ..RuntimeConfigPatch::default()
            })
            .unwrap();

        assert_eq!(updated.batch_size, 25);
        assert_eq!(updated.conflict_resolution, ResolutionStrategy::Merge);
        assert_eq!(updated.max_concurrency, 3);
        assert_eq!(shared.snapshot(), updated);
    }

    #[test]
    fn invalid_patch_leaves_config_untouched() {
        let shared = SharedConfig::default();
        let result = shared.update(&RuntimeConfigPatch {
            max_concurrency: Some(0),
            ..RuntimeConfigPatch::default()
        });
        assert!(result.is_err());
        assert_eq!(shared.snapshot().max_concurrency, 3);
    }

    #[test]
    fn lookup_reads_and_validates_knobs() {
        let map = HashMap::from([
            ("SYNC_BATCH_SIZE", "20"),
            ("SYNC_CONFLICT_RESOLUTION", "merge"),
            ("CACHE_TTL_SECS", " 60 "),
        ]);
        let config =
            RuntimeConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
                .unwrap();
        assert_eq!(config.batch_size, 20);
        assert_eq!(config.conflict_resolution, ResolutionStrategy::Merge);
        assert_eq!(config.cache_ttl_secs, 60);
    }

    #[test]
    fn lookup_rejects_out_of_range_values() {
        let map = HashMap::from([("SYNC_MAX_CONCURRENCY", "64")]);
        let err =
            RuntimeConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
                .unwrap_err();
        assert!(err.to_string().contains("SYNC_MAX_CONCURRENCY"));

        let map = HashMap::from([("SYNC_CONFLICT_RESOLUTION", "notion-wins")]);
        assert!(
            RuntimeConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
                .is_err()
        );
    }
}
