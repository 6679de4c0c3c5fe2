//! Network interface metrics collection.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::error::NetworkError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
/// Snapshot of interface metrics at a point in time.
pub struct MetricsSnapshot {
    /// Commands accepted by `start_command`.
    pub commands_started: u64,
    /// Commands completed with a reply.
    pub commands_succeeded: u64,
    /// Commands completed with an error other than the ones below.
    pub commands_failed: u64,
    /// Commands completed as canceled.
    pub commands_canceled: u64,
    /// Commands completed as timed out.
    pub commands_timed_out: u64,
    /// Commands rejected or aborted because of shutdown.
    pub commands_shutdown: u64,
    /// Fresh connections handed to operations.
    pub connections_opened: u64,
    /// Pooled connections handed to operations.
    pub connections_reused: u64,
    /// Connections discarded after use.
    pub connections_dropped: u64,
    /// Connections returned to their pool.
    pub connections_returned: u64,
    /// Total bytes written to connections.
    pub bytes_sent: u64,
    /// Total bytes read from connections.
    pub bytes_received: u64,
}

/// Thread-safe interface metrics collector.
pub struct NetworkMetrics {
    commands_started: AtomicU64,
    commands_succeeded: AtomicU64,
    commands_failed: AtomicU64,
    commands_canceled: AtomicU64,
    commands_timed_out: AtomicU64,
    commands_shutdown: AtomicU64,
    connections_opened: AtomicU64,
    connections_reused: AtomicU64,
    connections_dropped: AtomicU64,
    connections_returned: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl Default for NetworkMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NetworkMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl NetworkMetrics {
    /// Creates a collector with all counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            commands_started: AtomicU64::new(0),
            commands_succeeded: AtomicU64::new(0),
            commands_failed: AtomicU64::new(0),
            commands_canceled: AtomicU64::new(0),
            commands_timed_out: AtomicU64::new(0),
            commands_shutdown: AtomicU64::new(0),
            connections_opened: AtomicU64::new(0),
            connections_reused: AtomicU64::new(0),
            connections_dropped: AtomicU64::new(0),
            connections_returned: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }

    /// Increments the commands started counter.
    pub fn inc_commands_started(&self) {
        self.commands_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a command completion under the bucket its outcome falls in.
    pub fn record_completion<T>(&self, outcome: &Result<T, NetworkError>) {
        let counter = match outcome {
            Ok(_) => &self.commands_succeeded,
            Err(NetworkError::CallbackCanceled) => &self.commands_canceled,
            Err(NetworkError::ExceededTimeLimit { .. }) => &self.commands_timed_out,
            Err(NetworkError::ShutdownInProgress) => &self.commands_shutdown,
            Err(_) => &self.commands_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a connection handed to an operation.
    pub fn connection_leased(&self, reused: bool) {
        if reused {
            self.connections_reused.fetch_add(1, Ordering::Relaxed);
        } else {
            self.connections_opened.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Counts a connection given back after use.
    pub fn connection_released(&self, dropped: bool) {
        if dropped {
            self.connections_dropped.fetch_add(1, Ordering::Relaxed);
        } else {
            self.connections_returned.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Adds to the bytes sent counter.
    pub fn add_bytes_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Adds to the bytes received counter.
    pub fn add_bytes_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Takes a snapshot of all current metric values.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            commands_started: self.commands_started.load(Ordering::Relaxed),
            commands_succeeded: self.commands_succeeded.load(Ordering::Relaxed),
            commands_failed: self.commands_failed.load(Ordering::Relaxed),
            commands_canceled: self.commands_canceled.load(Ordering::Relaxed),
            commands_timed_out: self.commands_timed_out.load(Ordering::Relaxed),
            commands_shutdown: self.commands_shutdown.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_reused: self.connections_reused.load(Ordering::Relaxed),
            connections_dropped: self.connections_dropped.load(Ordering::Relaxed),
            connections_returned: self.connections_returned.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_metrics_zero() {
        assert_eq!(NetworkMetrics::new().snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_completion_buckets() {
        let metrics = NetworkMetrics::new();
        metrics.record_completion::<()>(&Ok(()));
        metrics.record_completion::<()>(&Err(NetworkError::CallbackCanceled));
        metrics.record_completion::<()>(&Err(NetworkError::ExceededTimeLimit { timeout_ms: 5 }));
        metrics.record_completion::<()>(&Err(NetworkError::ShutdownInProgress));
        metrics.record_completion::<()>(&Err(NetworkError::InternalError("x".into())));
        let snap = metrics.snapshot();
        assert_eq!(snap.commands_succeeded, 1);
        assert_eq!(snap.commands_canceled, 1);
        assert_eq!(snap.commands_timed_out, 1);
        assert_eq!(snap.commands_shutdown, 1);
        assert_eq!(snap.commands_failed, 1);
    }

    #[test]
    fn test_connection_counters() {
        let metrics = NetworkMetrics::new();
        metrics.connection_leased(false);
        metrics.connection_leased(true);
        metrics.connection_leased(true);
        metrics.connection_released(true);
        metrics.connection_released(false);
        let snap = metrics.snapshot();
        assert_eq!(snap.connections_opened, 1);
        assert_eq!(snap.connections_reused, 2);
        assert_eq!(snap.connections_dropped, 1);
        assert_eq!(snap.connections_returned, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = NetworkMetrics::new();
        metrics.inc_commands_started();
        metrics.add_bytes_sent(64);
        metrics.add_bytes_received(32);
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["commands_started"], 1);
        assert_eq!(json["bytes_sent"], 64);
        assert_eq!(json["bytes_received"], 32);
    }
}
