//! # Algorithms Module
//!
//! Pure data structures behind routing, scheduling and flow control.
//! Nothing here performs I/O or spawns tasks.

pub mod backoff;
pub mod circuit_breaker;
pub mod dedup;
pub mod ewma;
pub mod hash_ring;
pub mod hashing;
pub mod latency;
pub mod wfq;

pub use backoff::RetryPolicy;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitStats};
pub use dedup::{optimal_params, BloomParams, DedupFilter, StripedBloomFilter};
pub use ewma::{AdaptiveBatchSizer, Ewma};
pub use hash_ring::ConsistentHashRing;
pub use hashing::{keccak256, ring_position};
pub use latency::{LatencyPercentiles, LatencyTracker};
pub use wfq::{EnqueueRejection, PriorityQueueSet};
