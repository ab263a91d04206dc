//! # Router Configuration
//!
//! Tunables for routing, scheduling, batching, circuit breaking, dedup and
//! the write-ahead log. Defaults are illustrative starting points, not
//! load-tested values.
//!
//! ## Environment Variables
//!
//! | Variable | Default |
//! |----------|---------|
//! | `QC_ROUTER_VIRTUAL_NODES` | 150 |
//! | `QC_ROUTER_WEIGHTS` | `8,4,2,1` |
//! | `QC_ROUTER_MIN_BATCH` / `QC_ROUTER_MAX_BATCH` | 64 / 1024 |
//! | `QC_ROUTER_BATCH_WAIT_MS` | 10 |
//! | `QC_ROUTER_CIRCUIT_FAILURES` | 5 |
//! | `QC_ROUTER_CIRCUIT_WINDOW_MS` | 10000 |
//! | `QC_ROUTER_CIRCUIT_COOLDOWN_MS` | 15000 |
//! | `QC_ROUTER_WAL_SYNC` | `per-batch` (or `group`) |
//! | `QC_ROUTER_WAL_GROUP_MS` | 100 |
//! | `QC_ROUTER_WAL_DIR` | `./data/wal` |
//! | `QC_ROUTER_DEDUP_FPR` | 0.001 |
//! | `QC_ROUTER_DEDUP_CAPACITY` | 1000000 |
//! | `QC_ROUTER_DEDUP_ROTATION_MS` | 60000 |
//! | `QC_ROUTER_DEDUP_GENERATIONS` | 3 |
//! | `QC_ROUTER_ROUTE_CAPACITY` | 100000 |
//! | `QC_ROUTER_HIGH_WATERMARK` | 0.85 |
//! | `QC_ROUTER_ADMIT_TIMEOUT_MS` | 50 |
//! | `QC_ROUTER_MESSAGE_TTL_MS` | 10000 |
//! | `QC_ROUTER_EWMA_ALPHA` | 0.2 |
//! | `QC_ROUTER_THROUGHPUT_THRESHOLD` | 5000 |
//! | `QC_ROUTER_LATENCY_WINDOW` | 10000 |
//! | `QC_ROUTER_WORKERS` | 4 |
//! | `QC_ROUTER_MAINTENANCE_MS` | 100 |
//! | `QC_ROUTER_RETRY_ATTEMPTS` | 5 |
//! | `QC_ROUTER_RETRY_BASE_MS` | 100 |
//! | `QC_ROUTER_RETRY_MAX_MS` | 5000 |

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::algorithms::RetryPolicy;
use crate::domain::{PriorityWeights, MAX_VIRTUAL_NODES};
use crate::error::{RouterError, RouterResult};

/// When WAL writes are fsynced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalSyncMode {
    /// fsync after every record.
    PerBatch,
    /// fsync on a timer, batching many records per sync.
    Group {
        /// Interval between syncs in milliseconds
        interval_ms: u64,
    },
}

/// Cross-Shard Router configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Ring positions per physical shard.
    pub virtual_nodes_per_shard: usize,
    /// WFQ weights.
    pub priority_weights: PriorityWeights,
    /// Smallest batch target.
    pub min_batch_size: usize,
    /// Largest batch.
    pub max_batch_size: usize,
    /// Longest a batcher waits to fill a batch.
    pub max_batch_wait_ms: u64,
    /// Failures inside the window that open a circuit.
    pub circuit_failure_threshold: u32,
    /// Rolling failure window.
    pub circuit_failure_window_ms: u64,
    /// Time an open circuit waits before probing.
    pub circuit_cooldown_ms: u64,
    /// WAL durability mode.
    pub wal_sync_mode: WalSyncMode,
    /// Directory holding one log per route.
    pub wal_dir: PathBuf,
    /// Target dedup false-positive rate.
    pub dedup_false_positive_rate: f64,
    /// Fingerprints per dedup generation.
    pub dedup_expected_insertions: usize,
    /// Age of a dedup generation before rotation.
    pub dedup_rotation_ms: u64,
    /// Dedup generations retained.
    pub dedup_generations: usize,
    /// Absolute per-route queue capacity (messages).
    pub route_capacity: usize,
    /// Fraction of capacity above which NORMAL/LOW are rejected.
    pub high_watermark: f64,
    /// Longest `submit` blocks on backpressure.
    pub admit_timeout_ms: u64,
    /// Message time-to-live; 0 disables expiry.
    pub message_ttl_ms: u64,
    /// EWMA smoothing factor.
    pub ewma_alpha: f64,
    /// Throughput (msg/s) above which batches grow.
    pub throughput_threshold: f64,
    /// Latency samples kept per route.
    pub latency_window: usize,
    /// Batcher tasks and transport tasks (each).
    pub worker_count: usize,
    /// Maintenance tick.
    pub maintenance_interval_ms: u64,
    /// Transport retry policy.
    pub retry: RetryPolicy,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            virtual_nodes_per_shard: 150,
            priority_weights: PriorityWeights::default(),
            min_batch_size: 64,
            max_batch_size: 1024,
            max_batch_wait_ms: 10,
            circuit_failure_threshold: 5,
            circuit_failure_window_ms: 10_000,
            circuit_cooldown_ms: 15_000,
            wal_sync_mode: WalSyncMode::PerBatch,
            wal_dir: PathBuf::from("./data/wal"),
            dedup_false_positive_rate: 0.001,
            dedup_expected_insertions: 1_000_000,
            dedup_rotation_ms: 60_000,
            dedup_generations: 3,
            route_capacity: 100_000,
            high_watermark: 0.85,
            admit_timeout_ms: 50,
            message_ttl_ms: 10_000,
            ewma_alpha: 0.2,
            throughput_threshold: 5_000.0,
            latency_window: 10_000,
            worker_count: 4,
            maintenance_interval_ms: 100,
            retry: RetryPolicy::default(),
        }
    }
}

impl RouterConfig {
    /// Small, fast configuration for tests.
    pub fn for_testing(wal_dir: impl Into<PathBuf>) -> Self {
        Self {
            virtual_nodes_per_shard: 64,
            min_batch_size: 4,
            max_batch_size: 32,
            max_batch_wait_ms: 5,
            circuit_failure_threshold: 3,
            circuit_failure_window_ms: 1_000,
            circuit_cooldown_ms: 200,
            wal_dir: wal_dir.into(),
            dedup_expected_insertions: 10_000,
            dedup_rotation_ms: 1_000,
            dedup_generations: 2,
            route_capacity: 256,
            admit_timeout_ms: 0,
            message_ttl_ms: 0,
            throughput_threshold: 100.0,
            latency_window: 1_000,
            worker_count: 2,
            maintenance_interval_ms: 20,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 1,
                multiplier: 2.0,
                max_delay_ms: 10,
                jitter: 0.0,
            },
            ..Self::default()
        }
    }

    /// Build from `QC_ROUTER_*` environment variables over the defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        let wal_sync_mode = match env::var("QC_ROUTER_WAL_SYNC").as_deref() {
            Ok("group") => WalSyncMode::Group {
                interval_ms: env_or("QC_ROUTER_WAL_GROUP_MS", 100),
            },
            Ok("per-batch") | Err(_) => WalSyncMode::PerBatch,
            Ok(other) => {
                warn!(value = other, "Unknown QC_ROUTER_WAL_SYNC, using per-batch");
                WalSyncMode::PerBatch
            }
        };

        Self {
            virtual_nodes_per_shard: env_or("QC_ROUTER_VIRTUAL_NODES", d.virtual_nodes_per_shard),
            priority_weights: env::var("QC_ROUTER_WEIGHTS")
                .ok()
                .and_then(|v| parse_weights(&v))
                .unwrap_or(d.priority_weights),
            min_batch_size: env_or("QC_ROUTER_MIN_BATCH", d.min_batch_size),
            max_batch_size: env_or("QC_ROUTER_MAX_BATCH", d.max_batch_size),
            max_batch_wait_ms: env_or("QC_ROUTER_BATCH_WAIT_MS", d.max_batch_wait_ms),
            circuit_failure_threshold: env_or(
                "QC_ROUTER_CIRCUIT_FAILURES",
                d.circuit_failure_threshold,
            ),
            circuit_failure_window_ms: env_or(
                "QC_ROUTER_CIRCUIT_WINDOW_MS",
                d.circuit_failure_window_ms,
            ),
            circuit_cooldown_ms: env_or("QC_ROUTER_CIRCUIT_COOLDOWN_MS", d.circuit_cooldown_ms),
            wal_sync_mode,
            wal_dir: env::var("QC_ROUTER_WAL_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.wal_dir),
            dedup_false_positive_rate: env_or(
                "QC_ROUTER_DEDUP_FPR",
                d.dedup_false_positive_rate,
            ),
            dedup_expected_insertions: env_or(
                "QC_ROUTER_DEDUP_CAPACITY",
                d.dedup_expected_insertions,
            ),
            dedup_rotation_ms: env_or("QC_ROUTER_DEDUP_ROTATION_MS", d.dedup_rotation_ms),
            dedup_generations: env_or("QC_ROUTER_DEDUP_GENERATIONS", d.dedup_generations),
            route_capacity: env_or("QC_ROUTER_ROUTE_CAPACITY", d.route_capacity),
            high_watermark: env_or("QC_ROUTER_HIGH_WATERMARK", d.high_watermark),
            admit_timeout_ms: env_or("QC_ROUTER_ADMIT_TIMEOUT_MS", d.admit_timeout_ms),
            message_ttl_ms: env_or("QC_ROUTER_MESSAGE_TTL_MS", d.message_ttl_ms),
            ewma_alpha: env_or("QC_ROUTER_EWMA_ALPHA", d.ewma_alpha),
            throughput_threshold: env_or(
                "QC_ROUTER_THROUGHPUT_THRESHOLD",
                d.throughput_threshold,
            ),
            latency_window: env_or("QC_ROUTER_LATENCY_WINDOW", d.latency_window),
            worker_count: env_or("QC_ROUTER_WORKERS", d.worker_count),
            maintenance_interval_ms: env_or(
                "QC_ROUTER_MAINTENANCE_MS",
                d.maintenance_interval_ms,
            ),
            retry: RetryPolicy {
                max_attempts: env_or("QC_ROUTER_RETRY_ATTEMPTS", d.retry.max_attempts),
                base_delay_ms: env_or("QC_ROUTER_RETRY_BASE_MS", d.retry.base_delay_ms),
                max_delay_ms: env_or("QC_ROUTER_RETRY_MAX_MS", d.retry.max_delay_ms),
                ..d.retry
            },
        }
    }

    /// Reject inconsistent settings.
    pub fn validate(&self) -> RouterResult<()> {
        let fail = |msg: String| Err(RouterError::Config(msg));

        if self.virtual_nodes_per_shard == 0 || self.virtual_nodes_per_shard > MAX_VIRTUAL_NODES
        {
            return fail(format!(
                "virtual_nodes_per_shard must be in 1..={}, got {}",
                MAX_VIRTUAL_NODES, self.virtual_nodes_per_shard
            ));
        }
        if self.min_batch_size == 0 || self.min_batch_size > self.max_batch_size {
            return fail(format!(
                "batch bounds invalid: min {} max {}",
                self.min_batch_size, self.max_batch_size
            ));
        }
        if self.circuit_failure_threshold == 0 {
            return fail("circuit_failure_threshold must be > 0".to_string());
        }
        if !(self.dedup_false_positive_rate > 0.0 && self.dedup_false_positive_rate < 1.0) {
            return fail(format!(
                "dedup_false_positive_rate must be in (0, 1), got {}",
                self.dedup_false_positive_rate
            ));
        }
        if self.dedup_generations == 0 || self.dedup_expected_insertions == 0 {
            return fail("dedup generations and capacity must be > 0".to_string());
        }
        if self.route_capacity == 0 {
            return fail("route_capacity must be > 0".to_string());
        }
        if !(self.high_watermark > 0.0 && self.high_watermark <= 1.0) {
            return fail(format!(
                "high_watermark must be in (0, 1], got {}",
                self.high_watermark
            ));
        }
        if !(self.ewma_alpha > 0.0 && self.ewma_alpha <= 1.0) {
            return fail(format!("ewma_alpha must be in (0, 1], got {}", self.ewma_alpha));
        }
        if self.worker_count == 0 {
            return fail("worker_count must be > 0".to_string());
        }
        if let WalSyncMode::Group { interval_ms: 0 } = self.wal_sync_mode {
            return fail("group commit interval must be > 0".to_string());
        }
        self.retry.validate().map_err(RouterError::Config)
    }

    /// Longest wait to fill a batch.
    pub fn max_batch_wait(&self) -> Duration {
        Duration::from_millis(self.max_batch_wait_ms)
    }

    /// Longest bounded wait in `submit`.
    pub fn admit_timeout(&self) -> Duration {
        Duration::from_millis(self.admit_timeout_ms)
    }

    /// Maintenance tick.
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms.max(1))
    }

    /// Queue depth at which NORMAL/LOW admissions stop.
    pub fn high_watermark_depth(&self) -> usize {
        ((self.route_capacity as f64) * self.high_watermark).floor() as usize
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(key, value = %raw, "Ignoring unparsable environment override");
                default
            }
        },
        Err(_) => default,
    }
}

fn parse_weights(raw: &str) -> Option<PriorityWeights> {
    let parts: Vec<u32> = raw
        .split(',')
        .map(|p| p.trim().parse().ok())
        .collect::<Option<Vec<_>>>()?;
    match parts.as_slice() {
        [critical, high, normal, low] => Some(PriorityWeights {
            critical: *critical,
            high: *high,
            normal: *normal,
            low: *low,
        }),
        _ => None,
    }
}
