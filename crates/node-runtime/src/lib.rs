//! # Node Runtime Library
//!
//! This library exposes the internal modules of the node runtime for testing.
//! The main entry point is the `main.rs` binary.
//!
//! ## Modules
//!
//! - `config` - Node configuration from the environment
//! - `simulator` - Randomised shard transport
//! - `loadgen` - Synthetic message producer
//! - `runtime` - Component wiring, startup and shutdown

#![warn(missing_docs)]

pub mod config;
pub mod loadgen;
pub mod runtime;
pub mod simulator;

pub use config::{ConfigError, LoadGenConfig, NodeConfig, SimulatorConfig};
pub use loadgen::{LoadGenerator, LoadStats};
pub use runtime::{LoggingDeadLetterSink, NodeRuntime};
pub use simulator::{SimulatedTransport, SimulatorStats};
