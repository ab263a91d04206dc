//! # Value Objects
//!
//! Immutable value types shared by the router, scheduler and batch processor.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

/// Physical shard identifier (u16 supports up to 65536 shards).
pub type ShardId = u16;

/// Message fingerprint (keccak256 of the payload).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    /// Derive a fingerprint from message content.
    pub fn of(payload: &[u8]) -> Self {
        let digest = Keccak256::digest(payload);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Self(out)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint(")?;
        for b in &self.0[..6] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "..)")
    }
}

/// Priority class of a message.
///
/// Ordered from most to least urgent; the discriminant is the queue index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    /// Consensus-critical traffic.
    Critical = 0,
    /// Latency-sensitive traffic.
    High = 1,
    /// Default class.
    Normal = 2,
    /// Bulk traffic.
    Low = 3,
}

impl Priority {
    /// All classes in queue-index order.
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    /// Queue index for this class.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Whether the class keeps being admitted above the high watermark.
    pub fn bypasses_watermark(self) -> bool {
        matches!(self, Priority::Critical | Priority::High)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Critical => write!(f, "critical"),
            Priority::High => write!(f, "high"),
            Priority::Normal => write!(f, "normal"),
            Priority::Low => write!(f, "low"),
        }
    }
}

/// WFQ weight per priority class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityWeights {
    /// Weight of CRITICAL.
    pub critical: u32,
    /// Weight of HIGH.
    pub high: u32,
    /// Weight of NORMAL.
    pub normal: u32,
    /// Weight of LOW.
    pub low: u32,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            critical: 8,
            high: 4,
            normal: 2,
            low: 1,
        }
    }
}

impl PriorityWeights {
    /// Weight for a class (never zero).
    pub fn weight(&self, priority: Priority) -> u32 {
        let w = match priority {
            Priority::Critical => self.critical,
            Priority::High => self.high,
            Priority::Normal => self.normal,
            Priority::Low => self.low,
        };
        w.max(1)
    }
}

/// Route chosen for a destination key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RouteHandle {
    /// Physical shard.
    pub shard: ShardId,
    /// Ring position of the virtual node that owns the key.
    pub ring_position: u64,
    /// Topology epoch the decision was made in.
    pub epoch: u64,
}

/// Outcome of `submit`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SubmitResult {
    /// Enqueued on the route.
    Accepted {
        /// Route the message was queued on
        route: ShardId,
    },
    /// Fingerprint already seen (possibly a false positive).
    Duplicate,
    /// Route queue full; caller should retry later.
    Backpressure,
    /// Circuit open or route defunct.
    RouteUnavailable,
}

impl SubmitResult {
    /// True for `Accepted`.
    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmitResult::Accepted { .. })
    }
}

/// Outcome reported by the shard transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryResult {
    /// Shard acknowledged the batch.
    Ok,
    /// Worth retrying.
    TransientFailure(String),
    /// Retrying cannot help.
    PermanentFailure(String),
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Failing fast.
    Open,
    /// Probing with live traffic.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Health of a route as reported to monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RouteHealth {
    /// Circuit closed.
    Healthy,
    /// Circuit open or half-open.
    Degraded,
    /// Route shut down or removed from the topology.
    Defunct,
}

/// Batch processor lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProcessorState {
    /// Constructed, workers not spawned.
    Idle,
    /// Sealing and dispatching batches.
    Running,
    /// Not sealing new batches.
    Paused,
    /// Shutdown in progress.
    Draining,
    /// All workers joined.
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_content_derived() {
        assert_eq!(Fingerprint::of(b"transfer-1"), Fingerprint::of(b"transfer-1"));
        assert_ne!(Fingerprint::of(b"transfer-1"), Fingerprint::of(b"transfer-2"));
    }

    #[test]
    fn test_priority_index_order() {
        for (i, p) in Priority::ALL.iter().enumerate() {
            assert_eq!(p.index(), i);
        }
        assert!(Priority::High.bypasses_watermark());
        assert!(!Priority::Normal.bypasses_watermark());
    }

    #[test]
    fn test_zero_weight_clamped() {
        let weights = PriorityWeights {
            low: 0,
            ..Default::default()
        };
        assert_eq!(weights.weight(Priority::Low), 1);
        assert_eq!(weights.weight(Priority::Critical), 8);
    }

    #[test]
    fn test_circuit_state_display() {
        assert_eq!(CircuitState::HalfOpen.to_string(), "half-open");
    }
}
