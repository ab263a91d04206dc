//! # Synthetic Load Generator
//!
//! Submits random cross-shard messages at a fixed rate so a node can be
//! exercised without external producers. Priority mix: 5% CRITICAL,
//! 15% HIGH, 60% NORMAL, 20% LOW.

use std::sync::Arc;
use std::time::Duration;

use qc_18_cross_shard_router::{
    CrossShardRouterApi, Message, Priority, ShardId, SubmitResult,
};
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::LoadGenConfig;

/// Ticks per second; each tick submits `rate / TICKS_PER_SEC` messages.
const TICKS_PER_SEC: u64 = 20;

/// Submission outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadStats {
    /// Messages submitted.
    pub submitted: u64,
    /// `Accepted`
    pub accepted: u64,
    /// `Duplicate`
    pub duplicates: u64,
    /// `Backpressure`
    pub backpressure: u64,
    /// `RouteUnavailable`
    pub unavailable: u64,
}

impl LoadStats {
    fn record(&mut self, result: SubmitResult) {
        self.submitted += 1;
        match result {
            SubmitResult::Accepted { .. } => self.accepted += 1,
            SubmitResult::Duplicate => self.duplicates += 1,
            SubmitResult::Backpressure => self.backpressure += 1,
            SubmitResult::RouteUnavailable => self.unavailable += 1,
        }
    }
}

/// Random message source.
pub struct LoadGenerator {
    router: Arc<dyn CrossShardRouterApi>,
    config: LoadGenConfig,
    source_shard: ShardId,
    sequence: u64,
}

impl LoadGenerator {
    /// Generator submitting to `router`.
    pub fn new(router: Arc<dyn CrossShardRouterApi>, config: LoadGenConfig) -> Self {
        Self {
            router,
            config,
            source_shard: 0,
            sequence: 0,
        }
    }

    /// Next synthetic message. Payloads embed a sequence number, so they are
    /// unique for the life of the generator.
    pub fn next_message(&mut self) -> Message {
        let mut rng = rand::thread_rng();
        let key = rng.gen_range(0..self.config.key_space.max(1));
        let priority = match rng.gen_range(0..100u8) {
            0..=4 => Priority::Critical,
            5..=19 => Priority::High,
            20..=79 => Priority::Normal,
            _ => Priority::Low,
        };
        let nonce: u64 = rng.gen();
        self.sequence += 1;

        let mut payload = Vec::with_capacity(48);
        payload.extend_from_slice(&self.sequence.to_le_bytes());
        payload.extend_from_slice(&nonce.to_le_bytes());
        payload.extend_from_slice(format!("transfer:{}", key).as_bytes());

        Message::new(
            self.source_shard,
            format!("account-{}", key).into_bytes(),
            priority,
            payload,
        )
    }

    /// Submit `count` messages.
    pub async fn burst(&mut self, count: u64, stats: &mut LoadStats) {
        for _ in 0..count {
            let message = self.next_message();
            let result = self.router.submit(message).await;
            stats.record(result);
        }
    }

    /// Run until `shutdown` flips to true; returns the totals.
    pub fn spawn(mut self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<LoadStats> {
        tokio::spawn(async move {
            let mut stats = LoadStats::default();
            let per_tick = (self.config.rate_per_sec / TICKS_PER_SEC).max(1);
            let mut interval = tokio::time::interval(Duration::from_millis(1_000 / TICKS_PER_SEC));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(
                rate = self.config.rate_per_sec,
                keys = self.config.key_space,
                "Load generator started"
            );

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.burst(per_tick, &mut stats).await;
                        debug!(submitted = stats.submitted, accepted = stats.accepted, "Load tick");
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!(
                submitted = stats.submitted,
                accepted = stats.accepted,
                backpressure = stats.backpressure,
                unavailable = stats.unavailable,
                "Load generator stopped"
            );
            stats
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qc_18_cross_shard_router::{RouterConfig, ShardRouter};

    fn router(dir: &tempfile::TempDir) -> Arc<ShardRouter> {
        Arc::new(ShardRouter::new(RouterConfig::for_testing(dir.path()), &[0, 1, 2]).unwrap())
    }

    #[test]
    fn test_payloads_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let mut generator = LoadGenerator::new(router(&dir), LoadGenConfig::default());
        let a = generator.next_message();
        let b = generator.next_message();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_keys_stay_in_key_space() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoadGenConfig {
            rate_per_sec: 0,
            key_space: 3,
        };
        let mut generator = LoadGenerator::new(router(&dir), config);
        for _ in 0..50 {
            let m = generator.next_message();
            let key = String::from_utf8(m.destination_key().to_vec()).unwrap();
            assert!(["account-0", "account-1", "account-2"].contains(&key.as_str()));
        }
    }

    #[tokio::test]
    async fn test_burst_submits_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let router = router(&dir);
        let mut generator = LoadGenerator::new(router.clone(), LoadGenConfig::default());
        let mut stats = LoadStats::default();

        generator.burst(30, &mut stats).await;
        assert_eq!(stats.submitted, 30);
        assert_eq!(
            stats.accepted + stats.duplicates + stats.backpressure + stats.unavailable,
            30
        );
        assert_eq!(router.snapshot().counters.submitted, 30);
    }

    #[tokio::test]
    async fn test_spawned_generator_stops() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoadGenConfig {
            rate_per_sec: 200,
            key_space: 100,
        };
        let (tx, rx) = watch::channel(false);
        let handle = LoadGenerator::new(router(&dir), config).spawn(rx);
        tokio::time::sleep(Duration::from_millis(120)).await;
        tx.send(true).unwrap();

        let stats = handle.await.unwrap();
        assert!(stats.submitted >= 10);
    }
}
