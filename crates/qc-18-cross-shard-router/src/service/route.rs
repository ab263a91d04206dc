//! # Route
//!
//! Everything the router keeps per destination shard: the WFQ queue set,
//! circuit breaker, batch sizer, latency window and write-ahead log.
//!
//! Mutable state sits behind one short-held `parking_lot` mutex that is
//! never held across an `.await`. The async `dispatch` mutex is the
//! per-route permit: whoever holds it is the only party sealing or
//! delivering batches for the route, which keeps sequence numbers and
//! transport order monotonic.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, Notify, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::algorithms::{
    AdaptiveBatchSizer, CircuitBreaker, CircuitBreakerConfig, DedupFilter, LatencyTracker,
    PriorityQueueSet,
};
use crate::config::RouterConfig;
use crate::domain::{
    invariant_batch_bounds, now_micros, Batch, CircuitState, Message, RouteHealth, ShardId,
    SubmitResult,
};
use crate::error::WalError;
use crate::wal::WriteAheadLog;

/// Circuit state change observed on a route.
pub type Transition = (CircuitState, CircuitState);

/// Route state guarded by the route lock.
struct RouteState {
    queues: PriorityQueueSet,
    breaker: CircuitBreaker,
    reported: CircuitState,
    sizer: AdaptiveBatchSizer,
    latency: LatencyTracker,
    replay: VecDeque<Batch>,
    sampled_admitted: u64,
}

impl RouteState {
    fn take_transition(&mut self) -> Option<Transition> {
        let now = self.breaker.state();
        if now == self.reported {
            return None;
        }
        let from = std::mem::replace(&mut self.reported, now);
        Some((from, now))
    }
}

/// Per-shard route.
pub struct Route {
    shard: ShardId,
    state: Mutex<RouteState>,
    data: Notify,
    space: Notify,
    dispatch: Arc<AsyncMutex<()>>,
    wal: WriteAheadLog,
    defunct: AtomicBool,
    admitted: AtomicU64,
    max_batch_size: usize,
}

impl Route {
    /// Open the route for `shard`, loading its WAL from `config.wal_dir`.
    pub fn open(shard: ShardId, config: &RouterConfig) -> Result<Self, WalError> {
        let wal = WriteAheadLog::open(&config.wal_dir, shard, config.wal_sync_mode)?;
        let breaker = CircuitBreaker::new(
            shard,
            CircuitBreakerConfig {
                failure_threshold: config.circuit_failure_threshold,
                success_threshold: 1,
                cooldown: Duration::from_millis(config.circuit_cooldown_ms),
                failure_window: Duration::from_millis(config.circuit_failure_window_ms),
                enabled: true,
            },
        );

        Ok(Self {
            shard,
            state: Mutex::new(RouteState {
                queues: PriorityQueueSet::new(
                    config.priority_weights,
                    config.route_capacity,
                    config.high_watermark_depth(),
                ),
                breaker,
                reported: CircuitState::Closed,
                sizer: AdaptiveBatchSizer::new(
                    config.min_batch_size,
                    config.max_batch_size,
                    config.ewma_alpha,
                    config.throughput_threshold,
                ),
                latency: LatencyTracker::new(config.latency_window),
                replay: VecDeque::new(),
                sampled_admitted: 0,
            }),
            data: Notify::new(),
            space: Notify::new(),
            dispatch: Arc::new(AsyncMutex::new(())),
            wal,
            defunct: AtomicBool::new(false),
            admitted: AtomicU64::new(0),
            max_batch_size: config.max_batch_size,
        })
    }

    /// Destination shard.
    pub fn shard(&self) -> ShardId {
        self.shard
    }

    /// The route's write-ahead log.
    pub fn wal(&self) -> &WriteAheadLog {
        &self.wal
    }

    // -------------------------------------------------------------------------
    // Admission
    // -------------------------------------------------------------------------

    /// Admit a message, waiting up to `timeout` for queue space.
    ///
    /// The fingerprint is inserted into `dedup` only once the message is
    /// actually enqueued.
    pub async fn admit(
        &self,
        mut message: Message,
        dedup: &DedupFilter,
        timeout: Duration,
    ) -> SubmitResult {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let space = self.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            match self.try_admit(message, dedup) {
                Ok(result) => return result,
                Err(rejected) => message = rejected,
            }
            if tokio::time::timeout_at(deadline, space).await.is_err() {
                debug!(route = self.shard, "Admission timed out on backpressure");
                return SubmitResult::Backpressure;
            }
        }
    }

    fn try_admit(&self, message: Message, dedup: &DedupFilter) -> Result<SubmitResult, Message> {
        let mut state = self.state.lock();
        // Checked under the lock so a concurrent drain cannot strand the message
        if self.is_defunct() || !state.breaker.should_allow(Instant::now()) {
            return Ok(SubmitResult::RouteUnavailable);
        }
        if state.queues.check_room(message.priority()).is_err() {
            return Err(message);
        }
        if dedup.check_and_insert(&message.fingerprint()) {
            return Ok(SubmitResult::Duplicate);
        }
        state.queues.try_enqueue(message).map_err(|(m, _)| m)?;
        drop(state);

        self.admitted.fetch_add(1, Ordering::Relaxed);
        self.data.notify_one();
        Ok(SubmitResult::Accepted { route: self.shard })
    }

    /// Enqueue ignoring capacity (recovery and re-homing).
    pub fn restore(&self, messages: impl IntoIterator<Item = Message>) {
        let mut state = self.state.lock();
        for message in messages {
            state.queues.restore(message);
        }
        drop(state);
        self.data.notify_one();
    }

    /// Queue a recovered batch ahead of all new traffic.
    pub fn push_replay(&self, batch: Batch) {
        self.state.lock().replay.push_back(batch);
        self.data.notify_one();
    }

    // -------------------------------------------------------------------------
    // Batching (caller holds the dispatch permit)
    // -------------------------------------------------------------------------

    /// Acquire the dispatch permit, waiting for any in-flight batch.
    pub async fn acquire_dispatch(&self) -> OwnedMutexGuard<()> {
        self.dispatch.clone().lock_owned().await
    }

    /// Acquire the dispatch permit if no batch is in flight.
    pub fn try_acquire_dispatch(&self) -> Option<OwnedMutexGuard<()>> {
        self.dispatch.clone().try_lock_owned().ok()
    }

    /// Return an unacknowledged batch to the head of the replay queue; its
    /// sequence number is below anything still waiting there.
    pub fn defer(&self, batch: Batch) {
        self.state.lock().replay.push_front(batch);
        self.data.notify_one();
    }

    /// Next recovered batch, if any.
    pub fn take_replay(&self) -> Option<Batch> {
        self.state.lock().replay.pop_front()
    }

    /// Dequeue up to `max` live messages; returns them with the number of
    /// expired messages discarded on the way.
    pub fn collect(&self, max: usize, now_us: u64) -> (Vec<Message>, u64) {
        let mut state = self.state.lock();
        let mut out = Vec::with_capacity(max.min(state.queues.len()));
        let mut expired = 0;
        while out.len() < max {
            let Some(message) = state.queues.dequeue() else {
                break;
            };
            if message.is_expired(now_us) {
                expired += 1;
                continue;
            }
            out.push(message);
        }
        drop(state);
        self.space.notify_waiters();
        (out, expired)
    }

    /// Wait until a message is enqueued or `deadline` passes.
    pub async fn wait_for_data(&self, deadline: tokio::time::Instant) {
        let _ = tokio::time::timeout_at(deadline, self.data.notified()).await;
    }

    /// Seal messages into the next batch and append it to the WAL.
    ///
    /// On WAL failure the messages go back on the queue; the failed
    /// sequence number is never reused.
    pub fn seal(&self, messages: Vec<Message>) -> Result<Batch, WalError> {
        let batch = Batch::seal(self.wal.next_seq(), self.shard, messages);
        debug_assert!(invariant_batch_bounds(&batch, self.max_batch_size));

        if let Err(e) = self.wal.append(&batch) {
            warn!(route = self.shard, seq = batch.seq(), error = %e, "WAL append failed");
            self.restore(batch.into_messages());
            return Err(e);
        }
        debug!(route = self.shard, seq = batch.seq(), size = batch.len(), "Batch sealed");
        Ok(batch)
    }

    // -------------------------------------------------------------------------
    // Outcomes and maintenance
    // -------------------------------------------------------------------------

    /// Feed a delivery outcome to the breaker.
    pub fn record_delivery(&self, success: bool) -> Option<Transition> {
        let now = Instant::now();
        let mut state = self.state.lock();
        if success {
            state.breaker.record_success(now);
        } else {
            state.breaker.record_failure(now);
        }
        state.take_transition()
    }

    /// Record enqueue-to-ack latency for every message of a delivered batch.
    pub fn record_latency(&self, batch: &Batch) {
        let now = now_micros();
        let mut state = self.state.lock();
        for message in batch.messages() {
            state
                .latency
                .record(now.saturating_sub(message.enqueued_at_us()));
        }
    }

    /// Periodic upkeep: adapt the batch target from the admission rate over
    /// `elapsed` and advance breaker timers. Returns the admission rate.
    pub fn tick(&self, elapsed: Duration) -> (f64, Option<Transition>) {
        let admitted = self.admitted.load(Ordering::Relaxed);
        let mut state = self.state.lock();
        let delta = admitted.saturating_sub(state.sampled_admitted);
        state.sampled_admitted = admitted;

        let secs = elapsed.as_secs_f64();
        let rate = if secs > 0.0 { delta as f64 / secs } else { 0.0 };
        let depth = state.queues.len();
        state.sizer.adapt(rate, depth);
        state.breaker.poll(Instant::now());
        (rate, state.take_transition())
    }

    /// Advance breaker timers; OPEN means nothing may go to the transport.
    pub fn poll_circuit(&self) -> (CircuitState, Option<Transition>) {
        let mut state = self.state.lock();
        let circuit = state.breaker.poll(Instant::now());
        (circuit, state.take_transition())
    }

    /// Mark the route defunct: new admissions fail fast.
    pub fn mark_defunct(&self) {
        let _state = self.state.lock();
        self.defunct.store(true, Ordering::Release);
        self.space.notify_waiters();
    }

    /// Bring a defunct route back into service.
    pub fn revive(&self) {
        self.defunct.store(false, Ordering::Release);
    }

    /// Whether the route was shut down or removed.
    pub fn is_defunct(&self) -> bool {
        self.defunct.load(Ordering::Acquire)
    }

    /// Remove every queued message and recovered batch.
    pub fn drain_all(&self) -> (Vec<Message>, Vec<Batch>) {
        let mut state = self.state.lock();
        let messages = state.queues.drain();
        let replay = state.replay.drain(..).collect();
        drop(state);
        self.space.notify_waiters();
        (messages, replay)
    }

    // -------------------------------------------------------------------------
    // Read-only views
    // -------------------------------------------------------------------------

    /// Messages queued.
    pub fn depth(&self) -> usize {
        self.state.lock().queues.len()
    }

    /// Queued messages per priority class, CRITICAL first.
    pub fn depth_by_priority(&self) -> [usize; 4] {
        self.state.lock().queues.depth_by_priority()
    }

    /// Recovered batches still waiting.
    pub fn replay_len(&self) -> usize {
        self.state.lock().replay.len()
    }

    /// Whether anything is waiting to be batched.
    pub fn has_work(&self) -> bool {
        let state = self.state.lock();
        !state.queues.is_empty() || !state.replay.is_empty()
    }

    /// Current batch target.
    pub fn batch_target(&self) -> usize {
        self.state.lock().sizer.target()
    }

    /// Circuit state (timers not advanced).
    pub fn circuit_state(&self) -> CircuitState {
        self.state.lock().breaker.state()
    }

    /// Health for monitoring.
    pub fn health(&self) -> RouteHealth {
        if self.is_defunct() {
            return RouteHealth::Defunct;
        }
        match self.circuit_state() {
            CircuitState::Closed => RouteHealth::Healthy,
            CircuitState::Open | CircuitState::HalfOpen => RouteHealth::Degraded,
        }
    }

    /// Latency samples in the window.
    pub fn latency_samples(&self) -> Vec<u64> {
        self.state.lock().latency.samples().collect()
    }

    /// Largest batch this route seals.
    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Messages admitted since the route opened.
    pub fn admitted(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("shard", &self.shard)
            .field("defunct", &self.is_defunct())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Priority;

    fn setup() -> (tempfile::TempDir, RouterConfig, DedupFilter) {
        let dir = tempfile::tempdir().unwrap();
        let config = RouterConfig::for_testing(dir.path());
        let dedup = DedupFilter::new(1_000, 0.001, 2);
        (dir, config, dedup)
    }

    fn msg(n: u32, priority: Priority) -> Message {
        Message::new(0, b"key".to_vec(), priority, n.to_le_bytes().to_vec())
    }

    #[tokio::test]
    async fn test_admit_then_duplicate() {
        let (_dir, config, dedup) = setup();
        let route = Route::open(1, &config).unwrap();
        let timeout = Duration::ZERO;

        assert_eq!(
            route.admit(msg(1, Priority::Normal), &dedup, timeout).await,
            SubmitResult::Accepted { route: 1 }
        );
        assert_eq!(
            route.admit(msg(1, Priority::Normal), &dedup, timeout).await,
            SubmitResult::Duplicate
        );
        assert_eq!(route.depth(), 1);
        assert_eq!(route.admitted(), 1);
    }

    #[tokio::test]
    async fn test_backpressure_does_not_consume_fingerprint() {
        let (_dir, mut config, dedup) = setup();
        config.route_capacity = 2;
        config.high_watermark = 1.0;
        let route = Route::open(1, &config).unwrap();

        for i in 0..2 {
            assert!(route
                .admit(msg(i, Priority::Critical), &dedup, Duration::ZERO)
                .await
                .is_accepted());
        }
        assert_eq!(
            route.admit(msg(9, Priority::Critical), &dedup, Duration::ZERO).await,
            SubmitResult::Backpressure
        );

        route.collect(1, now_micros());
        assert!(route
            .admit(msg(9, Priority::Critical), &dedup, Duration::ZERO)
            .await
            .is_accepted());
    }

    #[tokio::test]
    async fn test_blocked_admit_wakes_on_dequeue() {
        let (_dir, mut config, dedup) = setup();
        config.route_capacity = 1;
        config.high_watermark = 1.0;
        let route = Arc::new(Route::open(1, &config).unwrap());
        let dedup = Arc::new(dedup);

        route
            .admit(msg(0, Priority::High), &dedup, Duration::ZERO)
            .await;

        let waiter = {
            let route = route.clone();
            let dedup = dedup.clone();
            tokio::spawn(async move {
                route
                    .admit(msg(1, Priority::High), &dedup, Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        route.collect(1, now_micros());

        assert!(waiter.await.unwrap().is_accepted());
    }

    #[tokio::test]
    async fn test_pending_admit_is_woken_by_collect() {
        let (_dir, mut config, dedup) = setup();
        config.route_capacity = 1;
        config.high_watermark = 1.0;
        let route = Route::open(1, &config).unwrap();
        route
            .admit(msg(0, Priority::Low), &dedup, Duration::ZERO)
            .await;

        let mut admit = tokio_test::task::spawn(route.admit(
            msg(1, Priority::Low),
            &dedup,
            Duration::from_secs(5),
        ));
        tokio_test::assert_pending!(admit.poll());

        route.collect(1, now_micros());
        assert!(admit.is_woken());
        tokio_test::assert_ready_eq!(admit.poll(), SubmitResult::Accepted { route: 1 });
    }

    #[tokio::test]
    async fn test_defunct_route_rejects() {
        let (_dir, config, dedup) = setup();
        let route = Route::open(1, &config).unwrap();
        route.mark_defunct();
        assert_eq!(
            route.admit(msg(0, Priority::Critical), &dedup, Duration::ZERO).await,
            SubmitResult::RouteUnavailable
        );
        assert_eq!(route.health(), RouteHealth::Defunct);
        route.revive();
        assert_eq!(route.health(), RouteHealth::Healthy);
    }

    #[test]
    fn test_collect_discards_expired() {
        let (_dir, config, _) = setup();
        let route = Route::open(1, &config).unwrap();
        let stale = msg(0, Priority::Normal).with_enqueued_at(1).with_ttl_ms(1);
        let fresh = msg(1, Priority::Normal);
        route.restore([stale, fresh]);

        let (messages, expired) = route.collect(10, now_micros());
        assert_eq!(messages.len(), 1);
        assert_eq!(expired, 1);
    }

    #[test]
    fn test_seal_assigns_increasing_sequences() {
        let (_dir, config, _) = setup();
        let route = Route::open(4, &config).unwrap();
        let a = route.seal(vec![msg(0, Priority::Normal)]).unwrap();
        let b = route.seal(vec![msg(1, Priority::Normal)]).unwrap();
        assert_eq!(a.seq() + 1, b.seq());
        assert_eq!(route.wal().pending_count(), 2);
    }

    #[test]
    fn test_breaker_transitions_reported_once() {
        let (_dir, config, _) = setup();
        let route = Route::open(1, &config).unwrap();
        assert_eq!(route.record_delivery(false), None);
        assert_eq!(route.record_delivery(false), None);
        assert_eq!(
            route.record_delivery(false),
            Some((CircuitState::Closed, CircuitState::Open))
        );
        assert_eq!(route.record_delivery(false), None);
        assert_eq!(route.health(), RouteHealth::Degraded);
    }

    #[test]
    fn test_tick_grows_target_under_load() {
        let (_dir, config, _) = setup();
        let route = Route::open(1, &config).unwrap();
        let messages: Vec<Message> = (0..200).map(|i| msg(i, Priority::Normal)).collect();
        route.restore(messages);
        let before = route.batch_target();
        route.tick(Duration::from_millis(100));
        assert!(route.batch_target() > before);
    }
}
