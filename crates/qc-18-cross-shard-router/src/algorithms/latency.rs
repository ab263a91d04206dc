//! Windowed latency percentiles.

use std::collections::VecDeque;

use serde::Serialize;

/// p50/p95/p99 in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencyPercentiles {
    /// Median
    pub p50_us: u64,
    /// 95th percentile
    pub p95_us: u64,
    /// 99th percentile
    pub p99_us: u64,
    /// Samples considered
    pub samples: usize,
}

impl LatencyPercentiles {
    /// Nearest-rank percentiles over arbitrary samples.
    pub fn from_samples(mut samples: Vec<u64>) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        samples.sort_unstable();
        Self {
            p50_us: nearest_rank(&samples, 50.0),
            p95_us: nearest_rank(&samples, 95.0),
            p99_us: nearest_rank(&samples, 99.0),
            samples: samples.len(),
        }
    }
}

fn nearest_rank(sorted: &[u64], pct: f64) -> u64 {
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Keeps the most recent `capacity` samples.
#[derive(Debug, Clone)]
pub struct LatencyTracker {
    window: VecDeque<u64>,
    capacity: usize,
}

impl LatencyTracker {
    /// Tracker retaining `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    /// Add a sample, evicting the oldest when full.
    pub fn record(&mut self, latency_us: u64) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(latency_us);
    }

    /// Retained samples, oldest first.
    pub fn samples(&self) -> impl Iterator<Item = u64> + '_ {
        self.window.iter().copied()
    }

    /// Percentiles over the window.
    pub fn percentiles(&self) -> LatencyPercentiles {
        LatencyPercentiles::from_samples(self.window.iter().copied().collect())
    }

    /// Samples retained.
    pub fn len(&self) -> usize {
        self.window.len()
    }

    /// True before any sample.
    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }
}
