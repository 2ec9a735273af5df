//! Engine tunables. Every field has a default so an empty `[engine]` table is valid.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub catalog: CatalogCallConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default = "default_high_threshold")]
    pub high_threshold: f64,
    #[serde(default = "default_medium_threshold")]
    pub medium_threshold: f64,
    #[serde(default = "default_low_threshold")]
    pub low_threshold: f64,
    /// Maximum contacts listed when a name matches several people.
    #[serde(default = "default_entity_lookup_limit")]
    pub entity_lookup_limit: usize,
}

fn default_high_threshold() -> f64 {
    0.85
}

fn default_medium_threshold() -> f64 {
    0.60
}

fn default_low_threshold() -> f64 {
    0.40
}

fn default_entity_lookup_limit() -> usize {
    10
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            high_threshold: default_high_threshold(),
            medium_threshold: default_medium_threshold(),
            low_threshold: default_low_threshold(),
            entity_lookup_limit: default_entity_lookup_limit(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Item count above which reversible and bulk operations need a yes/no.
    #[serde(default = "default_confirmation_above")]
    pub confirmation_above: usize,
    #[serde(default = "default_confirmation_timeout_secs")]
    pub confirmation_timeout_secs: u64,
    /// User turns a pending request survives without being resolved.
    #[serde(default = "default_confirmation_max_turns")]
    pub confirmation_max_turns: u32,
}

fn default_confirmation_above() -> usize {
    courier_catalog::DEFAULT_CONFIRMATION_ABOVE
}

fn default_confirmation_timeout_secs() -> u64 {
    60
}

fn default_confirmation_max_turns() -> u32 {
    3
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            confirmation_above: default_confirmation_above(),
            confirmation_timeout_secs: default_confirmation_timeout_secs(),
            confirmation_max_turns: default_confirmation_max_turns(),
        }
    }
}

impl SafetyConfig {
    pub fn confirmation_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.confirmation_timeout_secs).unwrap_or(i64::MAX))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogCallConfig {
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_rate_limit_per_second")]
    pub rate_limit_per_second: f64,
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_rate_limit_per_second() -> f64 {
    5.0
}

fn default_rate_limit_burst() -> u32 {
    10
}

impl Default for CatalogCallConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            rate_limit_per_second: default_rate_limit_per_second(),
            rate_limit_burst: default_rate_limit_burst(),
        }
    }
}

impl CatalogCallConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Suspended workflows untouched for this long are purged by the sweeper.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_retention_hours() -> u64 {
    24
}

fn default_sweep_interval_secs() -> u64 {
    300
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            retention_hours: default_retention_hours(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl SessionConfig {
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::try_from(self.retention_hours).unwrap_or(i64::MAX / 3_600))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), String> {
        let r = &self.routing;
        let ordered = 0.0 <= r.low_threshold
            && r.low_threshold <= r.medium_threshold
            && r.medium_threshold <= r.high_threshold
            && r.high_threshold <= 1.0;
        if !ordered {
            return Err(format!(
                "engine.routing thresholds must satisfy 0 <= low <= medium <= high <= 1 (got {}/{}/{})",
                r.low_threshold, r.medium_threshold, r.high_threshold
            ));
        }
        if self.safety.confirmation_timeout_secs == 0 {
            return Err("engine.safety.confirmation_timeout_secs must be > 0".to_string());
        }
        if self.safety.confirmation_max_turns == 0 {
            return Err("engine.safety.confirmation_max_turns must be > 0".to_string());
        }
        if self.catalog.request_timeout_secs == 0 {
            return Err("engine.catalog.request_timeout_secs must be > 0".to_string());
        }
        if self.catalog.rate_limit_per_second <= 0.0 {
            return Err("engine.catalog.rate_limit_per_second must be > 0".to_string());
        }
        Ok(())
    }
}
