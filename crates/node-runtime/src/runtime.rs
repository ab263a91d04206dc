//! # Node Runtime
//!
//! Wires the router, batch processor, maintenance task, snapshot logger and
//! optional load generator, and tears them down in order.
//!
//! ## Startup Sequence
//!
//! 1. Build the router over the configured shards
//! 2. Recover uncommitted batches from the WAL directory
//! 3. Start the batch processor
//! 4. Spawn maintenance, snapshot logging and the load generator
//!
//! ## Shutdown Sequence
//!
//! 1. Signal every background task through the watch channel
//! 2. Join them (the load generator stops submitting first)
//! 3. Drain the processor: queued messages are delivered or left in the WAL

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use qc_18_cross_shard_router::{
    BatchProcessor, DeadLetter, DeadLetterSink, DrainReport, Maintenance, RecoveryReport,
    ShardRouter, ShardTransport,
};
use quantum_telemetry::{log_event, log_route_event};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::NodeConfig;
use crate::loadgen::{LoadGenerator, LoadStats};
use crate::simulator::SimulatedTransport;

const SUBSYSTEM: &str = "qc-18";

/// Dead letters written to the log and counted.
#[derive(Default)]
pub struct LoggingDeadLetterSink {
    stored: AtomicU64,
}

impl LoggingDeadLetterSink {
    /// Dead letters seen so far.
    pub fn count(&self) -> u64 {
        self.stored.load(Ordering::Relaxed)
    }
}

impl DeadLetterSink for LoggingDeadLetterSink {
    fn store(&self, letter: DeadLetter) {
        self.stored.fetch_add(1, Ordering::Relaxed);
        log_route_event!(
            warn,
            SUBSYSTEM,
            "Dead letter",
            letter.route,
            id = %letter.id,
            batch_seq = letter.batch_seq,
            attempts = letter.attempts,
            reason = %letter.reason
        );
    }
}

/// The node runtime.
pub struct NodeRuntime {
    config: NodeConfig,
    router: Arc<ShardRouter>,
    transport: Arc<SimulatedTransport>,
    dead_letters: Arc<LoggingDeadLetterSink>,
    processor: Arc<BatchProcessor>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    loadgen: Mutex<Option<JoinHandle<LoadStats>>>,
}

impl NodeRuntime {
    /// Validate the configuration and build every component.
    pub fn new(config: NodeConfig) -> Result<Self> {
        config.validate().context("Invalid node configuration")?;

        let router = Arc::new(
            ShardRouter::new(config.router.clone(), &config.shards)
                .context("Failed to create router")?,
        );
        let transport = Arc::new(SimulatedTransport::new(config.simulator.clone()));
        let dead_letters = Arc::new(LoggingDeadLetterSink::default());
        let processor = Arc::new(BatchProcessor::new(
            router.clone(),
            transport.clone() as Arc<dyn ShardTransport>,
            dead_letters.clone() as Arc<dyn DeadLetterSink>,
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config,
            router,
            transport,
            dead_letters,
            processor,
            shutdown_tx,
            shutdown_rx,
            tasks: Mutex::new(Vec::new()),
            loadgen: Mutex::new(None),
        })
    }

    /// Recover, start the processor and spawn background tasks.
    pub async fn start(&self) -> Result<RecoveryReport> {
        info!("===========================================");
        info!("  Quantum-Chain Cross-Shard Router v{}", qc_18_cross_shard_router::VERSION);
        info!("===========================================");

        let recovery = self.router.recover().await.context("WAL recovery failed")?;
        for quarantine in &recovery.quarantined {
            log_event!(
                error,
                SUBSYSTEM,
                "Corrupt WAL tail quarantined",
                path = %quarantine.path.display(),
                bytes = quarantine.bytes
            );
        }

        self.processor
            .start()
            .context("Failed to start batch processor")?;

        let mut tasks = self.tasks.lock();
        tasks.push(Maintenance::new(self.router.clone()).spawn(self.shutdown_rx.clone()));
        if self.config.snapshot_interval_secs > 0 {
            tasks.push(self.spawn_snapshot_logger());
        }
        drop(tasks);

        if self.config.loadgen.rate_per_sec > 0 {
            let generator = LoadGenerator::new(self.router.clone(), self.config.loadgen.clone());
            *self.loadgen.lock() = Some(generator.spawn(self.shutdown_rx.clone()));
        }

        log_event!(
            info,
            SUBSYSTEM,
            "Node started",
            shards = ?self.router.shards(),
            wal_dir = %self.config.router.wal_dir.display(),
            recovered_batches = recovery.batches,
            loadgen_rate = self.config.loadgen.rate_per_sec
        );
        Ok(recovery)
    }

    fn spawn_snapshot_logger(&self) -> JoinHandle<()> {
        let router = self.router.clone();
        let period = Duration::from_secs(self.config.snapshot_interval_secs);
        let mut shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => log_snapshot(&router),
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Stop background tasks and drain the processor.
    pub async fn shutdown(&self) -> Result<DrainReport> {
        info!("Initiating graceful shutdown...");
        if let Err(e) = self.shutdown_tx.send(true) {
            error!("Failed to send shutdown signal: {}", e);
        }

        let loadgen = self.loadgen.lock().take();
        if let Some(handle) = loadgen {
            match handle.await {
                Ok(stats) => log_event!(
                    info,
                    SUBSYSTEM,
                    "Load generator totals",
                    submitted = stats.submitted,
                    accepted = stats.accepted
                ),
                Err(e) => error!("Load generator task failed: {}", e),
            }
        }

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                error!("Background task failed: {}", e);
            }
        }

        let report = self
            .processor
            .shutdown()
            .await
            .context("Processor drain failed")?;
        log_snapshot(&self.router);
        log_event!(
            info,
            SUBSYSTEM,
            "Shutdown complete",
            drained_batches = report.batches,
            left_for_replay = report.left_for_replay,
            dead_letters = self.dead_letters.count()
        );
        Ok(report)
    }

    /// The router.
    pub fn router(&self) -> Arc<ShardRouter> {
        Arc::clone(&self.router)
    }

    /// The simulated transport.
    pub fn transport(&self) -> Arc<SimulatedTransport> {
        Arc::clone(&self.transport)
    }

    /// The batch processor.
    pub fn processor(&self) -> Arc<BatchProcessor> {
        Arc::clone(&self.processor)
    }
}

fn log_snapshot(router: &ShardRouter) {
    let snapshot = router.snapshot();
    match serde_json::to_string(&snapshot) {
        Ok(json) => log_event!(
            info,
            SUBSYSTEM,
            "Metrics snapshot",
            queued = snapshot.total_queue_depth(),
            degraded = ?snapshot.degraded_routes(),
            snapshot = %json
        ),
        Err(e) => error!("Failed to encode metrics snapshot: {}", e),
    }
}
