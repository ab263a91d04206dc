//! Router counters and the read-only metrics snapshot.
//!
//! Counters are lock-free atomics bumped from producer, batcher and
//! transport tasks. Per-route gauges (queue depth, circuit state, batch
//! target, latency) live in each route's state and are collected by
//! [`ShardRouter::snapshot`](crate::service::ShardRouter::snapshot).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use crate::algorithms::{Ewma, LatencyPercentiles};
use crate::domain::{CircuitState, RouteHealth, ShardId};

/// Router-wide counters.
#[derive(Debug)]
pub struct RouterMetrics {
    /// `submit` calls
    pub submitted: AtomicU64,
    /// Messages enqueued
    pub accepted: AtomicU64,
    /// Dropped as duplicates
    pub duplicates: AtomicU64,
    /// Rejected for capacity
    pub backpressure: AtomicU64,
    /// Rejected by an open circuit or defunct route
    pub route_unavailable: AtomicU64,
    /// Discarded past their TTL
    pub expired: AtomicU64,
    /// Batches sealed and logged
    pub batches_sealed: AtomicU64,
    /// Batches acknowledged
    pub batches_delivered: AtomicU64,
    /// Messages acknowledged
    pub messages_delivered: AtomicU64,
    /// Failed delivery attempts
    pub transport_failures: AtomicU64,
    /// Delivery retries
    pub retries: AtomicU64,
    /// Messages dead-lettered
    pub dead_letters: AtomicU64,
    /// CLOSED/HALF_OPEN to OPEN transitions
    pub circuits_opened: AtomicU64,
    /// Batches recovered from the WAL
    pub replayed_batches: AtomicU64,
    /// WAL tails moved to quarantine
    pub quarantined_records: AtomicU64,
    throughput: Mutex<Ewma>,
}

impl RouterMetrics {
    /// Zeroed counters; `alpha` smooths the global throughput average.
    pub fn new(alpha: f64) -> Self {
        Self {
            submitted: AtomicU64::new(0),
            accepted: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            backpressure: AtomicU64::new(0),
            route_unavailable: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            batches_sealed: AtomicU64::new(0),
            batches_delivered: AtomicU64::new(0),
            messages_delivered: AtomicU64::new(0),
            transport_failures: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            dead_letters: AtomicU64::new(0),
            circuits_opened: AtomicU64::new(0),
            replayed_batches: AtomicU64::new(0),
            quarantined_records: AtomicU64::new(0),
            throughput: Mutex::new(Ewma::new(alpha)),
        }
    }

    /// Bump a counter by one.
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Bump a counter by `n`.
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Fold a router-wide throughput sample (msg/s).
    pub fn record_throughput(&self, sample: f64) -> f64 {
        self.throughput.lock().update(sample)
    }

    /// Smoothed router-wide throughput.
    pub fn throughput_ewma(&self) -> f64 {
        self.throughput.lock().value()
    }

    /// Counter values.
    pub fn counters(&self) -> CounterSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CounterSnapshot {
            submitted: load(&self.submitted),
            accepted: load(&self.accepted),
            duplicates: load(&self.duplicates),
            backpressure: load(&self.backpressure),
            route_unavailable: load(&self.route_unavailable),
            expired: load(&self.expired),
            batches_sealed: load(&self.batches_sealed),
            batches_delivered: load(&self.batches_delivered),
            messages_delivered: load(&self.messages_delivered),
            transport_failures: load(&self.transport_failures),
            retries: load(&self.retries),
            dead_letters: load(&self.dead_letters),
            circuits_opened: load(&self.circuits_opened),
            replayed_batches: load(&self.replayed_batches),
            quarantined_records: load(&self.quarantined_records),
        }
    }
}

impl Default for RouterMetrics {
    fn default() -> Self {
        Self::new(0.2)
    }
}

/// Point-in-time counter values.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[allow(missing_docs)]
pub struct CounterSnapshot {
    pub submitted: u64,
    pub accepted: u64,
    pub duplicates: u64,
    pub backpressure: u64,
    pub route_unavailable: u64,
    pub expired: u64,
    pub batches_sealed: u64,
    pub batches_delivered: u64,
    pub messages_delivered: u64,
    pub transport_failures: u64,
    pub retries: u64,
    pub dead_letters: u64,
    pub circuits_opened: u64,
    pub replayed_batches: u64,
    pub quarantined_records: u64,
}

/// Read-only view for monitoring.
#[derive(Clone, Debug, Default, Serialize)]
pub struct MetricsSnapshot {
    /// Messages queued per route.
    pub queue_depth_by_route: BTreeMap<ShardId, usize>,
    /// Circuit state per route.
    pub circuit_state_by_route: BTreeMap<ShardId, CircuitState>,
    /// Health per route.
    pub route_health: BTreeMap<ShardId, RouteHealth>,
    /// Current adaptive batch target per route.
    pub batch_target_by_route: BTreeMap<ShardId, usize>,
    /// Enqueue-to-ack latency over every route's window.
    pub latency: LatencyPercentiles,
    /// Smoothed router-wide throughput (msg/s).
    pub throughput_ewma: f64,
    /// Counters.
    pub counters: CounterSnapshot,
    /// Topology epoch.
    pub epoch: u64,
}

impl MetricsSnapshot {
    /// Messages queued across all routes.
    pub fn total_queue_depth(&self) -> usize {
        self.queue_depth_by_route.values().sum()
    }

    /// Routes not currently healthy.
    pub fn degraded_routes(&self) -> Vec<ShardId> {
        self.route_health
            .iter()
            .filter(|(_, h)| **h != RouteHealth::Healthy)
            .map(|(r, _)| *r)
            .collect()
    }
}
