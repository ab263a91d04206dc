//! # Router Errors
//!
//! Error types for the Cross-Shard Router subsystem.
//!
//! Producer-facing outcomes (`Duplicate`, `Backpressure`, `RouteUnavailable`)
//! are returned as [`SubmitResult`](crate::domain::SubmitResult) values, not
//! as errors. The variants below cover failures the caller cannot ignore.

use std::path::PathBuf;

use thiserror::Error;

use crate::domain::ShardId;

/// Crate-wide result alias.
pub type RouterResult<T> = Result<T, RouterError>;

/// Cross-Shard Router error types.
#[derive(Debug, Error)]
pub enum RouterError {
    /// The hash ring has no shards.
    #[error("No shards in topology")]
    NoShards,

    /// Shard is not part of the current topology.
    #[error("Unknown shard: {0}")]
    UnknownShard(ShardId),

    /// Route queue is above its watermark.
    #[error("Backpressure on route {route}: {depth}/{capacity} queued")]
    Backpressure {
        /// Route that rejected the message
        route: ShardId,
        /// Current queue depth
        depth: usize,
        /// Configured capacity
        capacity: usize,
    },

    /// Route circuit is open or the route was shut down.
    #[error("Route unavailable: {0}")]
    RouteUnavailable(ShardId),

    /// Delivery failed after exhausting the retry budget.
    #[error("Transport failure on route {route} after {attempts} attempts: {reason}")]
    TransportFailure {
        /// Destination route
        route: ShardId,
        /// Attempts made
        attempts: u32,
        /// Last failure reason
        reason: String,
    },

    /// Write-ahead log failure.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Batch processor is not accepting work.
    #[error("Processor is shutting down")]
    Shutdown,
}

/// Write-ahead log errors.
#[derive(Debug, Error)]
pub enum WalError {
    /// Underlying file I/O failed.
    #[error("WAL I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload could not be encoded or decoded.
    #[error("WAL codec error: {0}")]
    Codec(String),

    /// A record failed validation.
    #[error("WAL corruption in {path:?} at offset {offset}: {reason}")]
    Corruption {
        /// Log file
        path: PathBuf,
        /// Byte offset of the first bad record
        offset: u64,
        /// What failed
        reason: String,
    },

    /// Append with a sequence number not above the last one written.
    #[error("WAL sequence out of order: last {last}, got {got}")]
    OutOfOrder {
        /// Last sequence appended
        last: u64,
        /// Rejected sequence
        got: u64,
    },
}

impl From<bincode::Error> for WalError {
    fn from(err: bincode::Error) -> Self {
        WalError::Codec(err.to_string())
    }
}
