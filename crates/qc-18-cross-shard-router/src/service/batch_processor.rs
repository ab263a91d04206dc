//! # Batch Processor
//!
//! Two task families joined by a bounded channel:
//!
//! ```text
//!  batchers (N) ──InFlightBatch──▶ [mpsc, 2N] ──▶ transport workers (N)
//!     │ try_lock route permit                         │ deliver / retry
//!     │ collect → seal → WAL append                   │ commit or dead-letter
//!     └────────────── permit travels with the batch ──┘ released after outcome
//! ```
//!
//! A route's dispatch permit is taken before a batch is sealed and dropped
//! only once that batch is committed, dead-lettered or abandoned, so each
//! route has at most one batch outstanding and its sequence numbers reach
//! the transport in order.
//!
//! ## Lifecycle
//!
//! `Idle → Running ⇄ Paused → Draining → Stopped`. Shutdown stops the
//! batchers, lets transport workers finish what is already in flight
//! without further retries, then drains every route into final batches
//! that get one delivery attempt each. Anything not acknowledged stays
//! uncommitted in the WAL for replay.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::domain::{
    now_micros, Batch, CircuitState, DeadLetter, DeliveryResult, ProcessorState, ShardId,
};
use crate::error::{RouterError, RouterResult};
use crate::metrics::RouterMetrics;
use crate::ports::{DeadLetterSink, ShardTransport};
use crate::service::route::Route;
use crate::service::router::ShardRouter;

/// Sealed batch travelling from a batcher to a transport worker.
///
/// Holds the route's dispatch permit until dropped.
pub struct InFlightBatch {
    batch: Batch,
    route: Arc<Route>,
    permit: OwnedMutexGuard<()>,
}

impl InFlightBatch {
    /// The sealed batch.
    pub fn batch(&self) -> &Batch {
        &self.batch
    }

    /// Destination route.
    pub fn route(&self) -> ShardId {
        self.route.shard()
    }
}

impl std::fmt::Debug for InFlightBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlightBatch")
            .field("route", &self.route.shard())
            .field("seq", &self.batch.seq())
            .field("size", &self.batch.len())
            .finish()
    }
}

/// How a batch left the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Acknowledged and committed.
    Delivered {
        /// Attempts used
        attempts: u32,
    },
    /// Dead-lettered and committed.
    DeadLettered {
        /// Attempts used
        attempts: u32,
    },
    /// Left uncommitted for replay (shutdown).
    Abandoned {
        /// Attempts used
        attempts: u32,
    },
    /// Put back on the route's replay queue, uncommitted, because the
    /// circuit is open. Sent again once it half-opens.
    Deferred {
        /// Attempts used
        attempts: u32,
    },
}

/// Totals from draining routes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Final batches sealed or taken from replay.
    pub batches: usize,
    /// Batches acknowledged.
    pub delivered: usize,
    /// Batches dead-lettered.
    pub dead_lettered: usize,
    /// Batches left for replay.
    pub left_for_replay: usize,
}

impl DrainReport {
    fn absorb(&mut self, other: DrainReport) {
        self.batches += other.batches;
        self.delivered += other.delivered;
        self.dead_lettered += other.dead_lettered;
        self.left_for_replay += other.left_for_replay;
    }
}

/// Drains route queues into batches and delivers them.
pub struct BatchProcessor {
    router: Arc<ShardRouter>,
    transport: Arc<dyn ShardTransport>,
    dead_letters: Arc<dyn DeadLetterSink>,
    state: watch::Sender<ProcessorState>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    batch_tx: Mutex<Option<mpsc::Sender<InFlightBatch>>>,
}

impl BatchProcessor {
    /// Idle processor over `router`.
    pub fn new(
        router: Arc<ShardRouter>,
        transport: Arc<dyn ShardTransport>,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Self {
        let (state, _) = watch::channel(ProcessorState::Idle);
        Self {
            router,
            transport,
            dead_letters,
            state,
            handles: Mutex::new(Vec::new()),
            batch_tx: Mutex::new(None),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ProcessorState {
        *self.state.borrow()
    }

    /// Watch lifecycle changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ProcessorState> {
        self.state.subscribe()
    }

    fn is_stopping(&self) -> bool {
        matches!(
            self.state(),
            ProcessorState::Draining | ProcessorState::Stopped
        )
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Spawn batcher and transport tasks.
    pub fn start(self: &Arc<Self>) -> RouterResult<()> {
        match self.state() {
            ProcessorState::Idle => {}
            ProcessorState::Running | ProcessorState::Paused => return Ok(()),
            ProcessorState::Draining | ProcessorState::Stopped => {
                return Err(RouterError::Shutdown)
            }
        }

        let workers = self.router.config().worker_count;
        let (tx, rx) = mpsc::channel(workers * 2);
        let rx = Arc::new(AsyncMutex::new(rx));

        let mut handles = self.handles.lock();
        for id in 0..workers {
            handles.push(tokio::spawn(self.clone().run_batcher(id, tx.clone())));
            handles.push(tokio::spawn(self.clone().run_transport(id, rx.clone())));
        }
        *self.batch_tx.lock() = Some(tx);
        self.state.send_replace(ProcessorState::Running);

        info!(workers, "[qc-18] Batch processor started");
        Ok(())
    }

    /// Stop sealing new batches; admission continues until backpressure.
    pub fn pause(&self) {
        let changed = self.state.send_if_modified(|state| {
            if *state == ProcessorState::Running {
                *state = ProcessorState::Paused;
                true
            } else {
                false
            }
        });
        if changed {
            info!("[qc-18] Batch processor paused");
        }
    }

    /// Resume sealing after `pause`.
    pub fn resume(&self) {
        let changed = self.state.send_if_modified(|state| {
            if *state == ProcessorState::Paused {
                *state = ProcessorState::Running;
                true
            } else {
                false
            }
        });
        if changed {
            info!("[qc-18] Batch processor resumed");
            self.router.work().notify_waiters();
        }
    }

    /// Stop all tasks, drain every route and sync every WAL.
    pub async fn shutdown(&self) -> RouterResult<DrainReport> {
        if self.state() == ProcessorState::Stopped {
            return Ok(DrainReport::default());
        }
        info!("[qc-18] Batch processor draining");
        self.state.send_replace(ProcessorState::Draining);
        self.batch_tx.lock().take();
        self.router.work().notify_waiters();

        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "[qc-18] Worker task ended abnormally");
            }
        }

        let mut report = DrainReport::default();
        let mut first_error = None;
        for route in self.router.routes() {
            match self.drain_route(&route).await {
                Ok(drained) => report.absorb(drained),
                Err(e) => {
                    error!(route = route.shard(), error = %e, "[qc-18] Route drain failed");
                    first_error.get_or_insert(e);
                }
            }
            if let Err(e) = route.wal().sync() {
                error!(route = route.shard(), error = %e, "[qc-18] WAL sync failed");
                first_error.get_or_insert(e.into());
            }
        }

        self.state.send_replace(ProcessorState::Stopped);
        info!(
            batches = report.batches,
            delivered = report.delivered,
            left_for_replay = report.left_for_replay,
            "[qc-18] Batch processor stopped"
        );
        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    // =========================================================================
    // Batching
    // =========================================================================

    /// Next batch for `route`, waiting for the route's permit and up to
    /// `max_batch_wait` for messages.
    pub async fn next_batch(&self, route: &Arc<Route>) -> RouterResult<Option<InFlightBatch>> {
        let permit = route.acquire_dispatch().await;
        self.fill(route, permit, true).await
    }

    async fn fill(
        &self,
        route: &Arc<Route>,
        permit: OwnedMutexGuard<()>,
        wait_for_first: bool,
    ) -> RouterResult<Option<InFlightBatch>> {
        if let Some(batch) = route.take_replay() {
            debug!(route = route.shard(), seq = batch.seq(), "[qc-18] Replaying recovered batch");
            return Ok(Some(InFlightBatch {
                batch,
                route: route.clone(),
                permit,
            }));
        }

        let config = self.router.config();
        let deadline = tokio::time::Instant::now() + config.max_batch_wait();
        let mut messages = Vec::new();
        loop {
            let target = route.batch_target();
            let (mut collected, expired) =
                route.collect(target.saturating_sub(messages.len()), now_micros());
            if expired > 0 {
                RouterMetrics::add(&self.router.metrics().expired, expired);
                debug!(route = route.shard(), expired, "[qc-18] Discarded expired messages");
            }
            messages.append(&mut collected);

            // A short collect means the queue is empty
            if messages.len() >= target || messages.len() >= config.min_batch_size {
                break;
            }
            if messages.is_empty() && !wait_for_first {
                return Ok(None);
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            route.wait_for_data(deadline).await;
        }

        if messages.is_empty() {
            return Ok(None);
        }
        let batch = route.seal(messages)?;
        RouterMetrics::incr(&self.router.metrics().batches_sealed);
        Ok(Some(InFlightBatch {
            batch,
            route: route.clone(),
            permit,
        }))
    }

    async fn run_batcher(self: Arc<Self>, id: usize, tx: mpsc::Sender<InFlightBatch>) {
        let mut state_rx = self.state.subscribe();
        let idle_wait = self.router.config().max_batch_wait();
        loop {
            let state = *state_rx.borrow_and_update();
            match state {
                ProcessorState::Running => {}
                ProcessorState::Idle | ProcessorState::Paused => {
                    if state_rx.changed().await.is_err() {
                        return;
                    }
                    continue;
                }
                ProcessorState::Draining | ProcessorState::Stopped => break,
            }

            let routes = self.router.routes();
            let mut sealed = 0usize;
            for step in 0..routes.len() {
                // Stagger start points so batchers spread across routes
                let route = &routes[(id + step) % routes.len()];
                if route.is_defunct() || !route.has_work() || !self.circuit_allows(route) {
                    continue;
                }
                let Some(permit) = route.try_acquire_dispatch() else {
                    continue;
                };
                match self.fill(route, permit, false).await {
                    Ok(Some(inflight)) => {
                        if tx.send(inflight).await.is_err() {
                            return;
                        }
                        sealed += 1;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!(route = route.shard(), error = %e, "[qc-18] Failed to seal batch");
                    }
                }
            }

            if sealed == 0 {
                tokio::select! {
                    _ = self.router.work().notified() => {}
                    _ = tokio::time::sleep(idle_wait) => {}
                    _ = state_rx.changed() => {}
                }
            }
        }
        debug!(batcher = id, "[qc-18] Batcher stopped");
    }

    async fn run_transport(
        self: Arc<Self>,
        id: usize,
        rx: Arc<AsyncMutex<mpsc::Receiver<InFlightBatch>>>,
    ) {
        loop {
            let next = rx.lock().await.recv().await;
            let Some(inflight) = next else {
                break;
            };
            if let Err(e) = self.dispatch(inflight).await {
                error!(error = %e, "[qc-18] Dispatch failed");
            }
        }
        debug!(worker = id, "[qc-18] Transport worker stopped");
    }

    // =========================================================================
    // Delivery
    // =========================================================================

    fn circuit_allows(&self, route: &Route) -> bool {
        let (circuit, transition) = route.poll_circuit();
        if let Some(transition) = transition {
            self.router.notify_transition(route.shard(), transition);
        }
        circuit != CircuitState::Open
    }

    /// Deliver an in-flight batch with retries, then release its permit.
    ///
    /// Retries stop as soon as the route's circuit opens; the batch then
    /// waits on the replay queue instead of being dead-lettered.
    pub async fn dispatch(&self, inflight: InFlightBatch) -> RouterResult<DispatchOutcome> {
        let InFlightBatch {
            batch,
            route,
            permit,
        } = inflight;
        let outcome = self.deliver(&route, batch, true).await;
        drop(permit);
        self.router.work().notify_one();
        outcome
    }

    async fn deliver(
        &self,
        route: &Arc<Route>,
        batch: Batch,
        allow_retry: bool,
    ) -> RouterResult<DispatchOutcome> {
        let shard = route.shard();
        let retry = &self.router.config().retry;
        let metrics = self.router.metrics();
        let mut attempts = 0u32;

        let failure = loop {
            if !self.circuit_allows(route) {
                debug!(route = shard, seq = batch.seq(), attempts,
                    "[qc-18] Circuit open, holding batch back");
                if !allow_retry {
                    return Ok(DispatchOutcome::Abandoned { attempts });
                }
                route.defer(batch);
                return Ok(DispatchOutcome::Deferred { attempts });
            }
            attempts += 1;
            let result = self.transport.deliver(shard, &batch).await;
            if let Some(transition) = route.record_delivery(result == DeliveryResult::Ok) {
                self.router.notify_transition(shard, transition);
            }

            match result {
                DeliveryResult::Ok => break None,
                DeliveryResult::TransientFailure(reason) => {
                    RouterMetrics::incr(&metrics.transport_failures);
                    let stopping = !allow_retry || self.is_stopping();
                    if stopping {
                        warn!(route = shard, seq = batch.seq(), reason = %reason,
                            "[qc-18] Delivery failed during drain, leaving for replay");
                        return Ok(DispatchOutcome::Abandoned { attempts });
                    }
                    if !retry.should_retry(attempts) {
                        break Some(reason);
                    }
                    let delay = retry.delay_for(attempts);
                    RouterMetrics::incr(&metrics.retries);
                    warn!(
                        route = shard,
                        seq = batch.seq(),
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "[qc-18] Transient delivery failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                DeliveryResult::PermanentFailure(reason) => {
                    RouterMetrics::incr(&metrics.transport_failures);
                    break Some(reason);
                }
            }
        };

        let seq = batch.seq();
        match failure {
            None => {
                route.record_latency(&batch);
                route.wal().mark_committed(seq)?;
                RouterMetrics::incr(&metrics.batches_delivered);
                RouterMetrics::add(&metrics.messages_delivered, batch.len() as u64);
                self.router.notify_committed(shard, seq, batch.len());
                debug!(route = shard, seq, size = batch.len(), attempts, "[qc-18] Batch delivered");
                Ok(DispatchOutcome::Delivered { attempts })
            }
            Some(reason) => {
                let letters = DeadLetter::from_batch(&batch, attempts, &reason);
                RouterMetrics::add(&metrics.dead_letters, letters.len() as u64);
                warn!(
                    route = shard,
                    seq,
                    attempts,
                    messages = letters.len(),
                    reason = %reason,
                    "[qc-18] Batch dead-lettered"
                );
                for letter in letters {
                    self.router.notify_dead_letter(&letter);
                    self.dead_letters.store(letter);
                }
                route.wal().mark_committed(seq)?;
                Ok(DispatchOutcome::DeadLettered { attempts })
            }
        }
    }

    /// Mark `route` defunct and flush it: recovered batches, then the queue
    /// in final batches of at most `max_batch_size`, one attempt each.
    pub async fn drain_route(&self, route: &Arc<Route>) -> RouterResult<DrainReport> {
        route.mark_defunct();
        let _permit = route.acquire_dispatch().await;

        let mut batches = Vec::new();
        while let Some(batch) = route.take_replay() {
            batches.push(batch);
        }
        loop {
            let (messages, expired) = route.collect(route.max_batch_size(), now_micros());
            RouterMetrics::add(&self.router.metrics().expired, expired);
            if messages.is_empty() {
                break;
            }
            batches.push(route.seal(messages)?);
            RouterMetrics::incr(&self.router.metrics().batches_sealed);
        }

        let mut report = DrainReport {
            batches: batches.len(),
            ..Default::default()
        };
        for batch in batches {
            match self.deliver(route, batch, false).await? {
                DispatchOutcome::Delivered { .. } => report.delivered += 1,
                DispatchOutcome::DeadLettered { .. } => report.dead_lettered += 1,
                DispatchOutcome::Abandoned { .. } | DispatchOutcome::Deferred { .. } => {
                    report.left_for_replay += 1
                }
            }
        }
        if report.batches > 0 {
            info!(
                route = route.shard(),
                batches = report.batches,
                delivered = report.delivered,
                "[qc-18] Route drained"
            );
        }
        Ok(report)
    }
}
