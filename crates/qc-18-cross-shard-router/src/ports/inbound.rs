//! # Inbound Ports
//!
//! API trait defining what the Cross-Shard Router offers producers and
//! monitoring.

use async_trait::async_trait;

use crate::domain::{Message, RouteHandle, SubmitResult};
use crate::error::RouterResult;
use crate::metrics::MetricsSnapshot;

/// Cross-Shard Router API - inbound port.
#[async_trait]
pub trait CrossShardRouterApi: Send + Sync {
    /// Admit a message. Waits at most the configured admit timeout.
    async fn submit(&self, message: Message) -> SubmitResult;

    /// Route a destination key under the current topology.
    fn route(&self, destination_key: &[u8]) -> RouterResult<RouteHandle>;

    /// Read-only metrics view.
    fn snapshot(&self) -> MetricsSnapshot;
}
