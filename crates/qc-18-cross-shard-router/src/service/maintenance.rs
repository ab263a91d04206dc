//! Background upkeep: batch-size adaptation, breaker timers, dedup rotation
//! and group-commit syncs.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::WalSyncMode;
use crate::service::router::ShardRouter;

/// Periodic maintenance for one router.
pub struct Maintenance {
    router: Arc<ShardRouter>,
    last_tick: Instant,
    last_rotation: Instant,
    last_sync: Instant,
}

impl Maintenance {
    /// Maintenance starting now.
    pub fn new(router: Arc<ShardRouter>) -> Self {
        let now = Instant::now();
        Self {
            router,
            last_tick: now,
            last_rotation: now,
            last_sync: now,
        }
    }

    /// Run one cycle as of `now`; returns the router-wide admission rate.
    pub fn tick(&mut self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_tick);
        self.last_tick = now;
        let config = self.router.config();

        let mut total_rate = 0.0;
        for route in self.router.routes() {
            let (rate, transition) = route.tick(elapsed);
            total_rate += rate;
            if let Some(transition) = transition {
                self.router.notify_transition(route.shard(), transition);
            }
        }
        let smoothed = self.router.metrics().record_throughput(total_rate);

        let rotation = Duration::from_millis(config.dedup_rotation_ms);
        if now.saturating_duration_since(self.last_rotation) >= rotation {
            self.router.dedup().rotate();
            self.last_rotation = now;
            debug!(
                generations = self.router.dedup().generation_count(),
                "[qc-18] Dedup generation rotated"
            );
        }

        if let WalSyncMode::Group { interval_ms } = config.wal_sync_mode {
            if now.saturating_duration_since(self.last_sync) >= Duration::from_millis(interval_ms) {
                self.last_sync = now;
                for route in self.router.routes() {
                    if let Err(e) = route.wal().sync() {
                        error!(route = route.shard(), error = %e, "[qc-18] Group commit sync failed");
                    }
                }
            }
        }
        smoothed
    }

    /// Run until `shutdown` flips to true.
    pub fn spawn(mut self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let period = self.router.config().maintenance_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(period_ms = period.as_millis() as u64, "[qc-18] Maintenance task started");
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.tick(Instant::now());
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("[qc-18] Maintenance task stopped");
        })
    }
}
