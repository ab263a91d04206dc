//! # Node Configuration
//!
//! Router settings plus the node-level knobs: shard set, snapshot cadence,
//! simulated transport and synthetic load.
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `QC_SHARDS` | `0..8` | Shard ids, comma list (`0,1,5`) or range (`0..8`) |
//! | `QC_SNAPSHOT_INTERVAL_SECS` | `10` | Metrics snapshot log period (0 disables) |
//! | `QC_SIM_FAILURE_RATE` | `0.0` | Probability a delivery fails transiently |
//! | `QC_SIM_PERMANENT_RATE` | `0.0` | Probability a delivery is rejected outright |
//! | `QC_SIM_LATENCY_MS` | `2` | Mean simulated delivery latency |
//! | `QC_LOADGEN_RATE` | `0` | Synthetic messages per second (0 disables) |
//! | `QC_LOADGEN_KEYS` | `10000` | Distinct destination keys generated |

use std::env;
use std::str::FromStr;

use qc_18_cross_shard_router::{RouterConfig, ShardId};
use thiserror::Error;
use tracing::warn;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The router rejected its settings.
    #[error("router configuration: {0}")]
    Router(String),

    /// `QC_SHARDS` could not be parsed.
    #[error("invalid shard list {0:?}")]
    InvalidShards(String),

    /// A probability outside [0, 1].
    #[error("{name} must be in [0, 1], got {value}")]
    InvalidRate {
        /// Setting name
        name: &'static str,
        /// Rejected value
        value: f64,
    },
}

/// Simulated shard transport settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatorConfig {
    /// Probability of a transient failure per delivery.
    pub failure_rate: f64,
    /// Probability of a permanent failure per delivery.
    pub permanent_failure_rate: f64,
    /// Mean latency per delivery.
    pub latency_ms: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            failure_rate: 0.0,
            permanent_failure_rate: 0.0,
            latency_ms: 2,
        }
    }
}

/// Synthetic load settings.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadGenConfig {
    /// Messages per second; 0 disables the generator.
    pub rate_per_sec: u64,
    /// Distinct destination keys.
    pub key_space: u64,
}

impl Default for LoadGenConfig {
    fn default() -> Self {
        Self {
            rate_per_sec: 0,
            key_space: 10_000,
        }
    }
}

/// Complete node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Router configuration.
    pub router: RouterConfig,
    /// Shards in the initial topology.
    pub shards: Vec<ShardId>,
    /// Metrics snapshot period in seconds; 0 disables.
    pub snapshot_interval_secs: u64,
    /// Simulated transport.
    pub simulator: SimulatorConfig,
    /// Synthetic load.
    pub loadgen: LoadGenConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            router: RouterConfig::default(),
            shards: (0..8).collect(),
            snapshot_interval_secs: 10,
            simulator: SimulatorConfig::default(),
            loadgen: LoadGenConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load from the environment over the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        let shards = match env::var("QC_SHARDS") {
            Ok(raw) => parse_shards(&raw)?,
            Err(_) => d.shards,
        };

        Ok(Self {
            router: RouterConfig::from_env(),
            shards,
            snapshot_interval_secs: env_or("QC_SNAPSHOT_INTERVAL_SECS", d.snapshot_interval_secs),
            simulator: SimulatorConfig {
                failure_rate: env_or("QC_SIM_FAILURE_RATE", d.simulator.failure_rate),
                permanent_failure_rate: env_or(
                    "QC_SIM_PERMANENT_RATE",
                    d.simulator.permanent_failure_rate,
                ),
                latency_ms: env_or("QC_SIM_LATENCY_MS", d.simulator.latency_ms),
            },
            loadgen: LoadGenConfig {
                rate_per_sec: env_or("QC_LOADGEN_RATE", d.loadgen.rate_per_sec),
                key_space: env_or("QC_LOADGEN_KEYS", d.loadgen.key_space),
            },
        })
    }

    /// Reject inconsistent settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.router
            .validate()
            .map_err(|e| ConfigError::Router(e.to_string()))?;
        check_rate("QC_SIM_FAILURE_RATE", self.simulator.failure_rate)?;
        check_rate("QC_SIM_PERMANENT_RATE", self.simulator.permanent_failure_rate)?;
        if self.simulator.failure_rate + self.simulator.permanent_failure_rate > 1.0 {
            return Err(ConfigError::InvalidRate {
                name: "combined failure rate",
                value: self.simulator.failure_rate + self.simulator.permanent_failure_rate,
            });
        }
        Ok(())
    }
}

fn check_rate(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::InvalidRate { name, value })
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(variable = name, value = %raw, "Unparseable setting, using default");
            default
        }),
        Err(_) => default,
    }
}

/// Parse `"0,1,5"` or `"0..8"`. Duplicates are dropped; an empty list is
/// allowed (the router then rejects every submit).
pub fn parse_shards(raw: &str) -> Result<Vec<ShardId>, ConfigError> {
    let raw = raw.trim();
    let invalid = || ConfigError::InvalidShards(raw.to_string());

    let mut shards: Vec<ShardId> = if let Some((start, end)) = raw.split_once("..") {
        let start: ShardId = start.trim().parse().map_err(|_| invalid())?;
        let end: ShardId = end.trim().parse().map_err(|_| invalid())?;
        (start..end).collect()
    } else {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.parse().map_err(|_| invalid()))
            .collect::<Result<_, _>>()?
    };
    shards.sort_unstable();
    shards.dedup();
    Ok(shards)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_shard_list() {
        assert_eq!(parse_shards("3, 1,2,1").unwrap(), vec![1, 2, 3]);
        assert_eq!(parse_shards("").unwrap(), Vec::<ShardId>::new());
    }

    #[test]
    fn test_parse_shard_range() {
        assert_eq!(parse_shards("0..4").unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(parse_shards("5..5").unwrap(), Vec::<ShardId>::new());
    }

    #[test]
    fn test_parse_shards_rejects_garbage() {
        assert!(matches!(
            parse_shards("a,b"),
            Err(ConfigError::InvalidShards(_))
        ));
        assert!(parse_shards("0..x").is_err());
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = NodeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.shards.len(), 8);
    }

    #[test]
    fn test_validate_rejects_bad_rates() {
        let mut config = NodeConfig::default();
        config.simulator.failure_rate = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRate { .. })
        ));

        config.simulator.failure_rate = 0.6;
        config.simulator.permanent_failure_rate = 0.6;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_surfaces_router_errors() {
        let mut config = NodeConfig::default();
        config.router.worker_count = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Router(_))));
    }
}
