//! # Ports
//!
//! Hexagonal boundaries of the router.

pub mod inbound;
pub mod outbound;

pub use inbound::CrossShardRouterApi;
pub use outbound::{
    DeadLetterSink, DeliveryAttempt, InMemoryDeadLetterSink, MockTransport, RecordingObserver,
    RouterObserver, ShardTransport,
};
