//! Prometheus metrics for the node plugin
//!
//! Provides metrics for monitoring volume lifecycle operations, fabric
//! client invocations and per-volume lock contention.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Metric names
pub mod names {
    /// Counter: Total number of node operations by type and status
    pub const CSI_NODE_OPERATIONS_TOTAL: &str = "csi_node_operations_total";
    /// Histogram: Duration of node operations in seconds
    pub const CSI_NODE_OPERATION_DURATION_SECONDS: &str = "csi_node_operation_duration_seconds";
    /// Counter: Fabric client invocations by command and outcome
    pub const CSI_FABRIC_COMMANDS_TOTAL: &str = "csi_fabric_commands_total";
    /// Histogram: Time spent waiting for a per-volume lock
    pub const CSI_VOLUME_LOCK_WAIT_SECONDS: &str = "csi_volume_lock_wait_seconds";
}

/// Initialize the Prometheus metrics exporter
///
/// Starts an HTTP server on the specified address that serves metrics
/// at the `/metrics` endpoint.
pub fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on http://{}/metrics", addr);
    Ok(())
}

/// Record a node operation with its result
pub fn record_operation(operation: &str, status: &str, duration_secs: f64) {
    counter!(names::CSI_NODE_OPERATIONS_TOTAL, "operation" => operation.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!(names::CSI_NODE_OPERATION_DURATION_SECONDS, "operation" => operation.to_string())
        .record(duration_secs);
}

/// Record a fabric client invocation (connect-all, disconnect)
pub fn record_fabric_command(command: &str, outcome: &str) {
    counter!(names::CSI_FABRIC_COMMANDS_TOTAL, "command" => command.to_string(), "outcome" => outcome.to_string())
        .increment(1);
}

/// Record how long a caller waited for a volume lock
pub fn record_lock_wait(waited: Duration) {
    histogram!(names::CSI_VOLUME_LOCK_WAIT_SECONDS).record(waited.as_secs_f64());
}

/// Helper for timing operations
pub struct OperationTimer {
    operation: &'static str,
    start: Instant,
}

impl OperationTimer {
    /// Start timing an operation
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }

    /// Complete the operation with success
    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(self.operation, "success", duration);
    }

    /// Complete the operation with failure
    pub fn failure(self, error_code: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(self.operation, error_code, duration);
    }
}
