//! # Outbound Ports
//!
//! Traits for collaborators outside the router: the shard transport, passive
//! status observers and the dead-letter store.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::domain::{Batch, CircuitState, DeadLetter, DeliveryResult, ShardId};

/// Shard transport - outbound port.
///
/// Delivers one sealed batch to its destination shard. Implementations
/// classify failures; the router only consumes the result.
#[async_trait]
pub trait ShardTransport: Send + Sync {
    /// Deliver `batch` to `route`.
    async fn deliver(&self, route: ShardId, batch: &Batch) -> DeliveryResult;
}

/// Passive status notifications.
///
/// Observers must not block and are never consulted for control flow.
pub trait RouterObserver: Send + Sync {
    /// A route's circuit changed state.
    fn on_circuit_transition(&self, _route: ShardId, _from: CircuitState, _to: CircuitState) {}

    /// A batch was acknowledged and committed.
    fn on_batch_committed(&self, _route: ShardId, _seq: u64, _size: usize) {}

    /// A message exhausted its retry budget.
    fn on_dead_letter(&self, _letter: &DeadLetter) {}
}

/// Storage for dead letters - outbound port.
pub trait DeadLetterSink: Send + Sync {
    /// Persist or forward a dead letter.
    fn store(&self, letter: DeadLetter);
}

// =============================================================================
// In-memory and Mock Implementations
// =============================================================================

/// Dead letters kept in memory.
#[derive(Default)]
pub struct InMemoryDeadLetterSink {
    letters: Mutex<Vec<DeadLetter>>,
}

impl InMemoryDeadLetterSink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything stored so far.
    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().clone()
    }

    /// Number stored.
    pub fn len(&self) -> usize {
        self.letters.lock().len()
    }

    /// True if nothing was dead-lettered.
    pub fn is_empty(&self) -> bool {
        self.letters.lock().is_empty()
    }
}

impl DeadLetterSink for InMemoryDeadLetterSink {
    fn store(&self, letter: DeadLetter) {
        self.letters.lock().push(letter);
    }
}

/// Record of one delivery attempt seen by [`MockTransport`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryAttempt {
    /// Destination route.
    pub route: ShardId,
    /// Batch sequence.
    pub seq: u64,
    /// Messages in the batch.
    pub size: usize,
    /// Payloads in delivery order.
    pub payloads: Vec<Vec<u8>>,
    /// Outcome returned.
    pub result: DeliveryResult,
}

/// Mock transport for testing.
///
/// Returns scripted outcomes per route, then `Ok`. Every attempt is recorded.
#[derive(Default)]
pub struct MockTransport {
    scripted: Mutex<HashMap<ShardId, VecDeque<DeliveryResult>>>,
    attempts: Mutex<Vec<DeliveryAttempt>>,
    delay: Option<Duration>,
}

impl MockTransport {
    /// Transport that acknowledges everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport that sleeps `delay` before answering.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Queue `result` for the next `n` deliveries to `route`.
    pub fn fail_next(&self, route: ShardId, n: usize, result: DeliveryResult) {
        let mut scripted = self.scripted.lock();
        let queue = scripted.entry(route).or_default();
        for _ in 0..n {
            queue.push_back(result.clone());
        }
    }

    /// Every attempt so far.
    pub fn attempts(&self) -> Vec<DeliveryAttempt> {
        self.attempts.lock().clone()
    }

    /// Successful deliveries so far.
    pub fn delivered(&self) -> Vec<DeliveryAttempt> {
        self.attempts
            .lock()
            .iter()
            .filter(|a| a.result == DeliveryResult::Ok)
            .cloned()
            .collect()
    }

    /// Messages acknowledged across all routes.
    pub fn delivered_messages(&self) -> usize {
        self.delivered().iter().map(|a| a.size).sum()
    }
}

#[async_trait]
impl ShardTransport for MockTransport {
    async fn deliver(&self, route: ShardId, batch: &Batch) -> DeliveryResult {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let result = self
            .scripted
            .lock()
            .get_mut(&route)
            .and_then(|q| q.pop_front())
            .unwrap_or(DeliveryResult::Ok);

        self.attempts.lock().push(DeliveryAttempt {
            route,
            seq: batch.seq(),
            size: batch.len(),
            payloads: batch.messages().iter().map(|m| m.payload().to_vec()).collect(),
            result: result.clone(),
        });
        result
    }
}

/// Observer that records every notification.
#[derive(Default)]
pub struct RecordingObserver {
    /// Circuit transitions seen.
    pub transitions: Mutex<Vec<(ShardId, CircuitState, CircuitState)>>,
    /// Commits seen as (route, seq, size).
    pub commits: Mutex<Vec<(ShardId, u64, usize)>>,
    /// Dead letters seen.
    pub dead_letters: Mutex<usize>,
}

impl RouterObserver for RecordingObserver {
    fn on_circuit_transition(&self, route: ShardId, from: CircuitState, to: CircuitState) {
        self.transitions.lock().push((route, from, to));
    }

    fn on_batch_committed(&self, route: ShardId, seq: u64, size: usize) {
        self.commits.lock().push((route, seq, size));
    }

    fn on_dead_letter(&self, _letter: &DeadLetter) {
        *self.dead_letters.lock() += 1;
    }
}
