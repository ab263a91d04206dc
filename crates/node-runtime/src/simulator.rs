//! # Simulated Shard Transport
//!
//! Stands in for the network hop to destination shards: random latency around
//! a mean, random transient and permanent failures, and per-shard outages
//! that can be toggled at runtime.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use qc_18_cross_shard_router::{Batch, DeliveryResult, ShardId, ShardTransport};
use rand::Rng;
use tracing::trace;

use crate::config::SimulatorConfig;

/// Delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimulatorStats {
    /// Batches acknowledged.
    pub delivered_batches: u64,
    /// Messages acknowledged.
    pub delivered_messages: u64,
    /// Transient failures returned.
    pub transient_failures: u64,
    /// Permanent failures returned.
    pub permanent_failures: u64,
}

/// Randomised transport.
pub struct SimulatedTransport {
    config: SimulatorConfig,
    down: RwLock<HashSet<ShardId>>,
    delivered_batches: AtomicU64,
    delivered_messages: AtomicU64,
    transient_failures: AtomicU64,
    permanent_failures: AtomicU64,
}

impl SimulatedTransport {
    /// Transport with the given behaviour.
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            config,
            down: RwLock::new(HashSet::new()),
            delivered_batches: AtomicU64::new(0),
            delivered_messages: AtomicU64::new(0),
            transient_failures: AtomicU64::new(0),
            permanent_failures: AtomicU64::new(0),
        }
    }

    /// Make every delivery to `shard` fail transiently until `restore`.
    pub fn take_down(&self, shard: ShardId) {
        self.down.write().insert(shard);
    }

    /// End an outage started by `take_down`.
    pub fn restore(&self, shard: ShardId) {
        self.down.write().remove(&shard);
    }

    /// Counters so far.
    pub fn stats(&self) -> SimulatorStats {
        SimulatorStats {
            delivered_batches: self.delivered_batches.load(Ordering::Relaxed),
            delivered_messages: self.delivered_messages.load(Ordering::Relaxed),
            transient_failures: self.transient_failures.load(Ordering::Relaxed),
            permanent_failures: self.permanent_failures.load(Ordering::Relaxed),
        }
    }

    fn is_down(&self, shard: ShardId) -> bool {
        self.down.read().contains(&shard)
    }

    // Latency uniform in [mean/2, 3*mean/2]; decided before awaiting so the
    // thread-local rng never crosses an await point.
    fn draw(&self) -> (Duration, f64) {
        let mut rng = rand::thread_rng();
        let mean = self.config.latency_ms as f64;
        let latency = if mean > 0.0 {
            rng.gen_range(mean * 0.5..=mean * 1.5)
        } else {
            0.0
        };
        (Duration::from_secs_f64(latency / 1_000.0), rng.gen::<f64>())
    }
}

#[async_trait]
impl ShardTransport for SimulatedTransport {
    async fn deliver(&self, route: ShardId, batch: &Batch) -> DeliveryResult {
        let (latency, roll) = self.draw();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if self.is_down(route) {
            self.transient_failures.fetch_add(1, Ordering::Relaxed);
            return DeliveryResult::TransientFailure(format!("shard {} unreachable", route));
        }
        if roll < self.config.permanent_failure_rate {
            self.permanent_failures.fetch_add(1, Ordering::Relaxed);
            return DeliveryResult::PermanentFailure("batch rejected by shard".to_string());
        }
        if roll < self.config.permanent_failure_rate + self.config.failure_rate {
            self.transient_failures.fetch_add(1, Ordering::Relaxed);
            return DeliveryResult::TransientFailure("simulated timeout".to_string());
        }

        self.delivered_batches.fetch_add(1, Ordering::Relaxed);
        self.delivered_messages
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        trace!(route, seq = batch.seq(), size = batch.len(), "Simulated delivery");
        DeliveryResult::Ok
    }
}
