//! Structured logging helpers.
//!
//! Every event carries a fixed `subsystem` field so log shippers can split
//! streams per subsystem:
//! - `subsystem`: Subsystem identifier (router, runtime, etc.)
//! - `route`: Destination shard, for route-scoped events
//! - Additional context fields

/// Helper to create structured log entries with consistent formatting.
#[macro_export]
macro_rules! log_event {
    // Info level with subsystem
    (info, $subsystem:expr, $msg:expr $(, $($field:tt)*)?) => {
        tracing::info!(
            subsystem = $subsystem,
            $($($field)*,)?
            $msg
        )
    };

    // Warn level with subsystem
    (warn, $subsystem:expr, $msg:expr $(, $($field:tt)*)?) => {
        tracing::warn!(
            subsystem = $subsystem,
            $($($field)*,)?
            $msg
        )
    };

    // Error level with subsystem
    (error, $subsystem:expr, $msg:expr $(, $($field:tt)*)?) => {
        tracing::error!(
            subsystem = $subsystem,
            $($($field)*,)?
            $msg
        )
    };

    // Debug level with subsystem
    (debug, $subsystem:expr, $msg:expr $(, $($field:tt)*)?) => {
        tracing::debug!(
            subsystem = $subsystem,
            $($($field)*,)?
            $msg
        )
    };
}

/// Log a route-scoped event with standard fields.
#[macro_export]
macro_rules! log_route_event {
    ($level:ident, $subsystem:expr, $msg:expr, $route:expr $(, $($field:tt)*)?) => {
        tracing::$level!(
            subsystem = $subsystem,
            route = $route,
            $($($field)*,)?
            $msg
        )
    };
}
