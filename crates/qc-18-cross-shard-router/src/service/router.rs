//! # Shard Router
//!
//! Entry point for producers. `admit` checks the dedup filter, hashes the
//! destination key onto the ring and hands the message to its route.
//!
//! The ring is swapped whole on topology change (new `Arc`, epoch + 1).
//! Routes are created lazily on the first message for a shard and are never
//! dropped while the process runs: a shard that leaves the topology keeps
//! its route marked defunct, and its queued messages move to their new
//! owners. Moved messages are sealed into the new owner's WAL before the old
//! batch is committed, so a crash in between can only duplicate them.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::algorithms::{ring_position, ConsistentHashRing, DedupFilter, LatencyPercentiles};
use crate::config::RouterConfig;
use crate::domain::{
    CircuitState, DeadLetter, Message, RouteHandle, ShardId, SubmitResult,
};
use crate::error::{RouterError, RouterResult};
use crate::metrics::{MetricsSnapshot, RouterMetrics};
use crate::ports::{CrossShardRouterApi, RouterObserver};
use crate::service::route::{Route, Transition};
use crate::wal::{QuarantineReport, WriteAheadLog};

/// Outcome of [`ShardRouter::recover`].
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// Logs found in the WAL directory.
    pub routes: usize,
    /// Uncommitted batches queued for redelivery.
    pub batches: usize,
    /// Messages in those batches.
    pub messages: usize,
    /// Messages of departed shards moved to current owners.
    pub rehomed_messages: usize,
    /// Corrupt log tails moved aside.
    pub quarantined: Vec<QuarantineReport>,
}

#[derive(Clone)]
struct Topology {
    ring: Arc<ConsistentHashRing>,
    epoch: u64,
}

/// Cross-shard message router.
pub struct ShardRouter {
    config: RouterConfig,
    topology: RwLock<Topology>,
    routes: RwLock<HashMap<ShardId, Arc<Route>>>,
    dedup: DedupFilter,
    metrics: RouterMetrics,
    observers: RwLock<Vec<Arc<dyn RouterObserver>>>,
    work: Notify,
    recovered: AtomicBool,
}

impl ShardRouter {
    /// Router over `shards` with a validated configuration.
    pub fn new(config: RouterConfig, shards: &[ShardId]) -> RouterResult<Self> {
        config.validate()?;
        let ring = ConsistentHashRing::build(shards, config.virtual_nodes_per_shard);
        info!(
            shards = ring.shard_count(),
            virtual_nodes = ring.len(),
            wal_dir = %config.wal_dir.display(),
            "[qc-18] Cross-shard router initialised"
        );

        Ok(Self {
            dedup: DedupFilter::new(
                config.dedup_expected_insertions,
                config.dedup_false_positive_rate,
                config.dedup_generations,
            ),
            metrics: RouterMetrics::new(config.ewma_alpha),
            topology: RwLock::new(Topology {
                ring: Arc::new(ring),
                epoch: 0,
            }),
            routes: RwLock::new(HashMap::new()),
            observers: RwLock::new(Vec::new()),
            work: Notify::new(),
            recovered: AtomicBool::new(false),
            config,
        })
    }

    // =========================================================================
    // Routing
    // =========================================================================

    /// Route `key` under the current topology.
    pub fn route(&self, key: &[u8]) -> RouterResult<RouteHandle> {
        let topology = self.topology.read().clone();
        let (shard, ring_position) = topology.ring.locate(key).ok_or(RouterError::NoShards)?;
        Ok(RouteHandle {
            shard,
            ring_position,
            epoch: topology.epoch,
        })
    }

    /// First shard clockwise from `key` whose circuit is not open.
    ///
    /// Read-only; `admit` never fails over on its own. The handle carries the
    /// key's own ring position.
    pub fn failover_route(&self, key: &[u8]) -> RouterResult<RouteHandle> {
        let topology = self.topology.read().clone();
        if topology.ring.is_empty() {
            return Err(RouterError::NoShards);
        }
        let unhealthy: Vec<ShardId> = self
            .routes
            .read()
            .values()
            .filter(|r| r.is_defunct() || r.circuit_state() == CircuitState::Open)
            .map(|r| r.shard())
            .collect();

        match topology.ring.next_shard(key, &unhealthy) {
            Some(shard) => Ok(RouteHandle {
                shard,
                ring_position: ring_position(key),
                epoch: topology.epoch,
            }),
            None => {
                let primary = topology.ring.route(key).ok_or(RouterError::NoShards)?;
                Err(RouterError::RouteUnavailable(primary))
            }
        }
    }

    /// Admit a message: dedup check, route, enqueue.
    pub async fn admit(&self, message: Message) -> SubmitResult {
        RouterMetrics::incr(&self.metrics.submitted);

        if self.dedup.contains(&message.fingerprint()) {
            RouterMetrics::incr(&self.metrics.duplicates);
            return SubmitResult::Duplicate;
        }

        let message = match (self.config.message_ttl_ms, message.expires_at_us()) {
            (ttl, None) if ttl > 0 => message.with_ttl_ms(ttl),
            _ => message,
        };

        let route = match self.route(message.destination_key()) {
            Ok(handle) => match self.route_for(handle.shard) {
                Ok(route) => route,
                Err(e) => {
                    error!(route = handle.shard, error = %e, "[qc-18] Failed to open route");
                    RouterMetrics::incr(&self.metrics.route_unavailable);
                    return SubmitResult::RouteUnavailable;
                }
            },
            Err(_) => {
                RouterMetrics::incr(&self.metrics.route_unavailable);
                return SubmitResult::RouteUnavailable;
            }
        };

        let result = route
            .admit(message, &self.dedup, self.config.admit_timeout())
            .await;
        match result {
            SubmitResult::Accepted { .. } => {
                RouterMetrics::incr(&self.metrics.accepted);
                self.work.notify_one();
            }
            SubmitResult::Duplicate => RouterMetrics::incr(&self.metrics.duplicates),
            SubmitResult::Backpressure => RouterMetrics::incr(&self.metrics.backpressure),
            SubmitResult::RouteUnavailable => {
                RouterMetrics::incr(&self.metrics.route_unavailable)
            }
        }
        result
    }

    /// Existing route for `shard`, opening it (and its WAL) if needed.
    pub fn route_for(&self, shard: ShardId) -> RouterResult<Arc<Route>> {
        if let Some(route) = self.routes.read().get(&shard) {
            return Ok(route.clone());
        }
        let mut routes = self.routes.write();
        if let Some(route) = routes.get(&shard) {
            return Ok(route.clone());
        }
        let route = Arc::new(Route::open(shard, &self.config)?);
        debug!(route = shard, "[qc-18] Route opened");
        routes.insert(shard, route.clone());
        Ok(route)
    }

    /// Every route opened so far, by shard id.
    pub fn routes(&self) -> Vec<Arc<Route>> {
        let mut routes: Vec<Arc<Route>> = self.routes.read().values().cloned().collect();
        routes.sort_by_key(|r| r.shard());
        routes
    }

    // =========================================================================
    // Topology
    // =========================================================================

    /// Replace the shard table. Returns the new epoch.
    pub async fn set_topology(&self, shards: &[ShardId]) -> RouterResult<u64> {
        let ring = ConsistentHashRing::build(shards, self.config.virtual_nodes_per_shard);
        Ok(self.swap_ring(ring).await)
    }

    /// Add one shard. Returns the epoch (unchanged if already present).
    pub async fn add_shard(&self, shard: ShardId) -> RouterResult<u64> {
        let current = self.topology.read().clone();
        if current.ring.contains(shard) {
            return Ok(current.epoch);
        }
        Ok(self.swap_ring(current.ring.with_shard(shard)).await)
    }

    /// Remove one shard; its queued messages move to their new owners.
    pub async fn remove_shard(&self, shard: ShardId) -> RouterResult<u64> {
        let current = self.topology.read().clone();
        if !current.ring.contains(shard) {
            return Err(RouterError::UnknownShard(shard));
        }
        Ok(self.swap_ring(current.ring.without_shard(shard)).await)
    }

    async fn swap_ring(&self, ring: ConsistentHashRing) -> u64 {
        let ring = Arc::new(ring);
        let epoch = {
            let mut topology = self.topology.write();
            topology.ring = ring.clone();
            topology.epoch += 1;
            topology.epoch
        };
        info!(
            epoch,
            shards = ?ring.shards(),
            "[qc-18] Topology changed"
        );

        for route in self.routes() {
            if ring.contains(route.shard()) {
                if route.is_defunct() {
                    route.revive();
                    info!(route = route.shard(), "[qc-18] Route revived");
                }
            } else if !route.is_defunct() {
                self.retire(&route, &ring).await;
            }
        }
        self.work.notify_waiters();
        epoch
    }

    async fn retire(&self, route: &Arc<Route>, ring: &ConsistentHashRing) {
        route.mark_defunct();
        if ring.is_empty() {
            warn!(
                route = route.shard(),
                "[qc-18] No shards left; queued messages stay on the defunct route"
            );
            return;
        }

        let _permit = route.acquire_dispatch().await;
        let (mut messages, replay) = route.drain_all();
        let mut committed = Vec::new();
        for batch in replay {
            committed.push(batch.seq());
            messages.extend(batch.into_messages());
        }
        let (moved, durable) = self.rehome(messages, ring).await;

        if !durable {
            warn!(
                route = route.shard(),
                pending = committed.len(),
                "[qc-18] Re-homed messages not all durable; old batches stay uncommitted"
            );
        } else {
            for seq in committed {
                if let Err(e) = route.wal().mark_committed(seq) {
                    error!(route = route.shard(), seq, error = %e, "[qc-18] WAL commit failed");
                }
            }
        }
        info!(route = route.shard(), moved, "[qc-18] Route retired");
    }

    /// Hand `messages` to their owners under `ring`. Each owner seals its
    /// share into its own WAL and queues the batches for replay.
    ///
    /// Returns the number moved and whether every one of them reached an
    /// owner's WAL. Only then may the source batches be committed.
    async fn rehome(&self, messages: Vec<Message>, ring: &ConsistentHashRing) -> (usize, bool) {
        let mut by_route: BTreeMap<ShardId, Vec<Message>> = BTreeMap::new();
        for message in messages {
            if let Some(shard) = ring.route(message.destination_key()) {
                by_route.entry(shard).or_default().push(message);
            }
        }

        let mut moved = 0;
        let mut durable = true;
        for (shard, mut messages) in by_route {
            let route = match self.route_for(shard) {
                Ok(route) => route,
                Err(e) => {
                    error!(route = shard, error = %e, stranded = messages.len(),
                        "[qc-18] Failed to open route while re-homing");
                    durable = false;
                    continue;
                }
            };

            // Sealing takes the next sequence; nothing else may seal meanwhile
            let _permit = route.acquire_dispatch().await;
            while !messages.is_empty() {
                let take = messages.len().min(route.max_batch_size());
                let rest = messages.split_off(take);
                let count = messages.len();
                moved += count;
                match route.seal(messages) {
                    Ok(batch) => route.push_replay(batch),
                    Err(e) => {
                        // seal() put them back on the in-memory queue
                        error!(route = shard, error = %e, count,
                            "[qc-18] Re-homed batch not written to WAL");
                        durable = false;
                    }
                }
                messages = rest;
            }
        }
        (moved, durable)
    }

    /// Current topology epoch.
    pub fn epoch(&self) -> u64 {
        self.topology.read().epoch
    }

    /// Shards in the current ring.
    pub fn shards(&self) -> Vec<ShardId> {
        self.topology.read().ring.shards().to_vec()
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Replay every WAL under `wal_dir` and queue uncommitted batches ahead
    /// of new traffic. Call before the first `submit`.
    ///
    /// Runs once per router; later calls return an empty report, since the
    /// batches are already queued.
    pub async fn recover(&self) -> RouterResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        if self.recovered.swap(true, Ordering::SeqCst) {
            warn!("[qc-18] Recovery already ran; ignoring repeat call");
            return Ok(report);
        }
        let dir = &self.config.wal_dir;
        if !dir.exists() {
            return Ok(report);
        }

        let mut partitions: Vec<ShardId> = fs::read_dir(dir)
            .map_err(crate::error::WalError::from)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| WriteAheadLog::parse_file_name(&entry.file_name().to_string_lossy()))
            .collect();
        let ring = self.topology.read().ring.clone();
        // Live shards first, so batches re-homed onto them are not replayed twice
        partitions.sort_unstable_by_key(|shard| (!ring.contains(*shard), *shard));

        for shard in partitions {
            report.routes += 1;
            if ring.contains(shard) {
                let route = self.route_for(shard)?;
                let replay = route.wal().replay()?;
                for batch in replay.uncommitted() {
                    for message in batch.messages() {
                        self.dedup.check_and_insert(&message.fingerprint());
                    }
                    report.batches += 1;
                    report.messages += batch.len();
                    route.push_replay(batch.clone());
                }
                report.quarantined.extend(replay.quarantine);
            } else {
                let wal = WriteAheadLog::open(dir, shard, self.config.wal_sync_mode)?;
                let replay = wal.replay()?;
                if !ring.is_empty() {
                    for batch in replay.uncommitted() {
                        for message in batch.messages() {
                            self.dedup.check_and_insert(&message.fingerprint());
                        }
                        report.batches += 1;
                        report.messages += batch.len();
                        let (moved, durable) = self.rehome(batch.messages().to_vec(), &ring).await;
                        report.rehomed_messages += moved;
                        if durable {
                            wal.mark_committed(batch.seq())?;
                        } else {
                            warn!(route = shard, seq = batch.seq(),
                                "[qc-18] Re-homed batch not durable; left uncommitted");
                        }
                    }
                } else if replay.uncommitted().next().is_some() {
                    warn!(route = shard, "[qc-18] Uncommitted batches for a shard outside an empty ring");
                }
                report.quarantined.extend(replay.quarantine);
            }
        }

        RouterMetrics::add(&self.metrics.replayed_batches, report.batches as u64);
        RouterMetrics::add(
            &self.metrics.quarantined_records,
            report.quarantined.len() as u64,
        );
        if !report.quarantined.is_empty() {
            error!(
                quarantined = report.quarantined.len(),
                "[qc-18] Recovery quarantined corrupt WAL data"
            );
        }
        info!(
            routes = report.routes,
            batches = report.batches,
            messages = report.messages,
            rehomed = report.rehomed_messages,
            "[qc-18] Recovery complete"
        );
        self.work.notify_waiters();
        Ok(report)
    }

    // =========================================================================
    // Observation
    // =========================================================================

    /// Register a passive observer.
    pub fn register_observer(&self, observer: Arc<dyn RouterObserver>) {
        self.observers.write().push(observer);
    }

    pub(crate) fn notify_transition(&self, route: ShardId, (from, to): Transition) {
        if to == CircuitState::Open {
            RouterMetrics::incr(&self.metrics.circuits_opened);
            warn!(route, from = %from, to = %to, "[qc-18] Circuit opened");
        } else {
            info!(route, from = %from, to = %to, "[qc-18] Circuit transition");
        }
        for observer in self.observers.read().iter() {
            observer.on_circuit_transition(route, from, to);
        }
    }

    pub(crate) fn notify_committed(&self, route: ShardId, seq: u64, size: usize) {
        for observer in self.observers.read().iter() {
            observer.on_batch_committed(route, seq, size);
        }
    }

    pub(crate) fn notify_dead_letter(&self, letter: &DeadLetter) {
        for observer in self.observers.read().iter() {
            observer.on_dead_letter(letter);
        }
    }

    /// Read-only metrics view.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut snapshot = MetricsSnapshot {
            throughput_ewma: self.metrics.throughput_ewma(),
            counters: self.metrics.counters(),
            epoch: self.epoch(),
            ..Default::default()
        };
        let mut samples = Vec::new();
        for route in self.routes() {
            let shard = route.shard();
            snapshot.queue_depth_by_route.insert(shard, route.depth());
            snapshot
                .circuit_state_by_route
                .insert(shard, route.circuit_state());
            snapshot.route_health.insert(shard, route.health());
            snapshot
                .batch_target_by_route
                .insert(shard, route.batch_target());
            samples.extend(route.latency_samples());
        }
        snapshot.latency = LatencyPercentiles::from_samples(samples);
        snapshot
    }

    /// Configuration in use.
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Router-wide counters.
    pub fn metrics(&self) -> &RouterMetrics {
        &self.metrics
    }

    /// The dedup filter.
    pub fn dedup(&self) -> &DedupFilter {
        &self.dedup
    }

    /// Signalled whenever new work is queued.
    pub fn work(&self) -> &Notify {
        &self.work
    }
}

#[async_trait]
impl CrossShardRouterApi for ShardRouter {
    async fn submit(&self, message: Message) -> SubmitResult {
        self.admit(message).await
    }

    fn route(&self, destination_key: &[u8]) -> RouterResult<RouteHandle> {
        ShardRouter::route(self, destination_key)
    }

    fn snapshot(&self) -> MetricsSnapshot {
        ShardRouter::snapshot(self)
    }
}
