//! Engine configuration.
//!
//! `EngineConfig` mirrors `config.toml` in the data directory. Every field
//! has a default so an empty or partial file is valid.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Retries allowed per step before a RETRYABLE failure becomes terminal.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Extra attempts allowed for VALIDATION_FAIL outcomes (quality retry loop).
    #[serde(default = "default_max_quality_retries")]
    pub max_quality_retries: u32,

    /// Times a stage may be sent back from a gate before the run fails.
    #[serde(default = "default_max_review_iterations")]
    pub max_review_iterations: u32,

    /// Timeout for stages with no entry in `stage_timeouts`.
    #[serde(default = "default_stage_timeout_secs")]
    pub default_stage_timeout_secs: u64,

    /// Per-stage timeout lookup table (stage name -> seconds).
    #[serde(default)]
    pub stage_timeouts: BTreeMap<String, u64>,

    /// Stages with a timeout above this emit liveness heartbeats.
    #[serde(default = "default_heartbeat_threshold_secs")]
    pub heartbeat_threshold_secs: u64,

    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// A running attempt whose last heartbeat is older than this is considered abandoned.
    #[serde(default = "default_stale_attempt_secs")]
    pub stale_attempt_secs: u64,

    /// Upper bound on concurrently executing branches of one parallel stage.
    #[serde(default = "default_max_parallel_branches")]
    pub max_parallel_branches: usize,

    #[serde(default)]
    pub backoff: BackoffConfig,

    #[serde(default)]
    pub tenant_cache: TenantCacheConfig,

    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_quality_retries() -> u32 {
    2
}

fn default_max_review_iterations() -> u32 {
    3
}

fn default_stage_timeout_secs() -> u64 {
    300
}

fn default_heartbeat_threshold_secs() -> u64 {
    120
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_stale_attempt_secs() -> u64 {
    600
}

fn default_max_parallel_branches() -> usize {
    8
}

fn default_event_bus_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            max_quality_retries: default_max_quality_retries(),
            max_review_iterations: default_max_review_iterations(),
            default_stage_timeout_secs: default_stage_timeout_secs(),
            stage_timeouts: BTreeMap::new(),
            heartbeat_threshold_secs: default_heartbeat_threshold_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            stale_attempt_secs: default_stale_attempt_secs(),
            max_parallel_branches: default_max_parallel_branches(),
            backoff: BackoffConfig::default(),
            tenant_cache: TenantCacheConfig::default(),
            event_bus_capacity: default_event_bus_capacity(),
        }
    }
}

impl EngineConfig {
    /// Resolve a stage timeout: explicit override, then lookup table, then default.
    pub fn stage_timeout_secs(&self, stage: &str, override_secs: Option<u64>) -> u64 {
        override_secs
            .or_else(|| self.stage_timeouts.get(stage).copied())
            .unwrap_or(self.default_stage_timeout_secs)
    }
}

/// Exponential backoff between RETRYABLE attempts. No jitter: retry timing is
/// part of the replayable history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_initial_ms")]
    pub initial_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
}

fn default_initial_ms() -> u64 {
    1_000
}

fn default_multiplier() -> u32 {
    2
}

fn default_max_ms() -> u64 {
    60_000
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_initial_ms(),
            multiplier: default_multiplier(),
            max_ms: default_max_ms(),
        }
    }
}

/// Bounds for per-tenant resource caches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantCacheConfig {
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_cache_capacity() -> usize {
    32
}

fn default_cache_ttl_secs() -> u64 {
    1_800
}

impl Default for TenantCacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.heartbeat_threshold_secs, 120);
        assert_eq!(config.default_stage_timeout_secs, 300);
        assert!(config.stage_timeouts.is_empty());
    }

    #[test]
    fn test_engine_config_deserialize_with_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.backoff.initial_ms, 1_000);
        assert_eq!(config.tenant_cache.capacity, 32);
    }

    #[test]
    fn test_engine_config_deserialize_with_values() {
        let toml_str = r#"
max_retries = 5
default_stage_timeout_secs = 60

[stage_timeouts]
research = 900
draft = 240

[backoff]
initial_ms = 10
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.stage_timeouts.get("research"), Some(&900));
        assert_eq!(config.backoff.initial_ms, 10);
        assert_eq!(config.backoff.multiplier, 2);
    }

    #[test]
    fn stage_timeout_resolution_order() {
        let mut config = EngineConfig::default();
        config.stage_timeouts.insert("research".into(), 900);
        assert_eq!(config.stage_timeout_secs("research", Some(10)), 10);
        assert_eq!(config.stage_timeout_secs("research", None), 900);
        assert_eq!(config.stage_timeout_secs("draft", None), 300);
    }
}
