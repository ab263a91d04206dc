//! # Service Layer
//!
//! Stateful components: routes, the router, the batch processor and the
//! maintenance task.

pub mod batch_processor;
pub mod maintenance;
pub mod route;
pub mod router;

pub use batch_processor::{BatchProcessor, DispatchOutcome, DrainReport, InFlightBatch};
pub use maintenance::Maintenance;
pub use route::{Route, Transition};
pub use router::{RecoveryReport, ShardRouter};
