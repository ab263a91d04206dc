//! # Quantum-Chain Cross-Shard Router Node
//!
//! Runs the cross-shard router against a simulated shard transport.
//!
//! ## Startup Sequence
//!
//! 1. Initialize telemetry (tracing subscriber)
//! 2. Load and validate configuration from the environment
//! 3. Recover uncommitted batches from the WAL
//! 4. Start the batch processor and background tasks
//! 5. Run until Ctrl+C, then drain and exit

use anyhow::{Context, Result};
use tracing::info;

use node_runtime::{NodeConfig, NodeRuntime};
use quantum_telemetry::{init_telemetry, TelemetryConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry = init_telemetry(TelemetryConfig::for_subsystem("18", "cross-shard-router"))
        .context("Failed to initialize telemetry")?;

    let config = NodeConfig::from_env().context("Failed to load configuration")?;

    let runtime = NodeRuntime::new(config)?;
    runtime.start().await?;

    // Keep the node running
    info!("Node is running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;

    // Graceful shutdown
    let report = runtime.shutdown().await?;
    info!(
        delivered = report.delivered,
        left_for_replay = report.left_for_replay,
        "Node stopped"
    );
    Ok(())
}
