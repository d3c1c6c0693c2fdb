//! Metrics collection for LLM Ops
//!
//! This module provides Prometheus metrics for observability.
//! Updates are plain atomic operations so they stay off the request hot path.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for LLM Ops
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub worker: WorkerMetrics,
    pub heartbeat: HeartbeatMetrics,
    pub controller: ControllerMetrics,
}

/// Request lifecycle metrics
#[derive(Debug, Clone)]
pub struct WorkerMetrics {
    /// Requests that obtained an admission slot
    pub requests_total: IntCounter,

    /// Requests that reached COMPLETED
    pub requests_completed: IntCounter,

    /// Requests that reached FAILED
    pub requests_failed: IntCounter,

    /// Requests that reached ABORTED
    pub requests_aborted: IntCounter,

    /// Requests rejected before admission
    pub requests_rejected: IntCounter,

    /// Partial outputs consumed from the engine
    pub partial_outputs_total: IntCounter,

    /// Request duration from admission to terminal state
    pub request_duration: Histogram,

    /// Time spent waiting for an admission slot
    pub admission_wait: Histogram,

    /// Requests currently holding a slot
    pub current_load: IntGauge,

    /// Requests currently waiting for a slot
    pub waiting_requests: IntGauge,
}

/// Registration and heartbeat metrics
#[derive(Debug, Clone)]
pub struct HeartbeatMetrics {
    pub heartbeats_sent: IntCounter,
    pub heartbeat_failures: IntCounter,
    pub registrations: IntCounter,
    pub registration_failures: IntCounter,
}

/// Controller-specific metrics
#[derive(Debug, Clone)]
pub struct ControllerMetrics {
    /// Workers currently registered
    pub registered_workers: IntGauge,

    /// Heartbeats received
    pub heartbeats_received: IntCounter,

    /// Workers removed for missing heartbeats
    pub expired_workers: IntCounter,

    /// Worker addresses handed out
    pub dispatches: IntCounter,

    /// Address lookups with no matching worker
    pub no_worker_available: IntCounter,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("valid counter definition");
    registry
        .register(Box::new(counter.clone()))
        .expect("counter registered once");
    counter
}

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("valid gauge definition");
    registry
        .register(Box::new(gauge.clone()))
        .expect("gauge registered once");
    gauge
}

fn histogram(registry: &Registry, name: &str, help: &str, buckets: Vec<f64>) -> Histogram {
    let histogram = Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets))
        .expect("valid histogram definition");
    registry
        .register(Box::new(histogram.clone()))
        .expect("histogram registered once");
    histogram
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());
        let r = registry.as_ref();

        let worker = WorkerMetrics {
            requests_total: counter(r, "worker_requests_total", "Requests admitted"),
            requests_completed: counter(
                r,
                "worker_requests_completed_total",
                "Requests that completed normally",
            ),
            requests_failed: counter(
                r,
                "worker_requests_failed_total",
                "Requests that failed in the engine",
            ),
            requests_aborted: counter(r, "worker_requests_aborted_total", "Requests aborted"),
            requests_rejected: counter(
                r,
                "worker_requests_rejected_total",
                "Requests rejected by validation",
            ),
            partial_outputs_total: counter(
                r,
                "worker_partial_outputs_total",
                "Partial outputs consumed from the engine",
            ),
            request_duration: histogram(
                r,
                "worker_request_duration_seconds",
                "Request duration from admission to terminal state",
                vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0],
            ),
            admission_wait: histogram(
                r,
                "worker_admission_wait_seconds",
                "Time spent waiting for an admission slot",
                vec![0.0001, 0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 30.0],
            ),
            current_load: gauge(r, "worker_current_load", "Requests holding an admission slot"),
            waiting_requests: gauge(
                r,
                "worker_waiting_requests",
                "Requests waiting for an admission slot",
            ),
        };

        let heartbeat = HeartbeatMetrics {
            heartbeats_sent: counter(r, "worker_heartbeats_sent_total", "Heartbeats acknowledged"),
            heartbeat_failures: counter(
                r,
                "worker_heartbeat_failures_total",
                "Heartbeats that failed to reach the controller",
            ),
            registrations: counter(r, "worker_registrations_total", "Successful registrations"),
            registration_failures: counter(
                r,
                "worker_registration_failures_total",
                "Failed registration attempts",
            ),
        };

        let controller = ControllerMetrics {
            registered_workers: gauge(
                r,
                "controller_registered_workers",
                "Workers currently registered",
            ),
            heartbeats_received: counter(
                r,
                "controller_heartbeats_received_total",
                "Heartbeats received from workers",
            ),
            expired_workers: counter(
                r,
                "controller_expired_workers_total",
                "Workers removed after missing heartbeats",
            ),
            dispatches: counter(
                r,
                "controller_dispatches_total",
                "Worker addresses handed out",
            ),
            no_worker_available: counter(
                r,
                "controller_no_worker_available_total",
                "Address lookups with no serving worker",
            ),
        };

        MetricsRegistry {
            registry,
            worker,
            heartbeat,
            controller,
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry() {
        let metrics = MetricsRegistry::new();

        // Record some metrics
        metrics.worker.requests_total.inc();
        metrics.worker.current_load.inc();
        metrics.controller.registered_workers.set(3);

        // Gather metrics
        let output = metrics.gather();
        assert!(output.contains("worker_requests_total"));
        assert!(output.contains("controller_registered_workers 3"));
    }
}
