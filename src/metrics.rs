//! Provisioner Metrics
//!
//! Prometheus metrics kept in a registry owned by the process rather than
//! the global default registry.

use crate::error::{Error, Result};
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};

/// Metric name prefix
pub const NAMESPACE: &str = "smcli_provisioner";

/// Command durations range from a quick query to a multi-minute create
const COMMAND_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0];

/// All provisioner metrics
pub struct ProvisionerMetrics {
    registry: Registry,
    /// Provision and delete operations by result
    pub operations: IntCounterVec,
    /// SMcli run time by statement kind
    pub command_duration: HistogramVec,
    /// Defragmentation runs by result
    pub defrag_runs: IntCounterVec,
}

impl ProvisionerMetrics {
    /// Create and register all metrics in a fresh registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let operations = IntCounterVec::new(
            Opts::new("operations_total", "Provision and delete operations").namespace(NAMESPACE),
            &["operation", "result"],
        )
        .map_err(metric_error("operations_total"))?;

        let command_duration = HistogramVec::new(
            HistogramOpts::new("command_duration_seconds", "SMcli command duration in seconds")
                .namespace(NAMESPACE)
                .buckets(COMMAND_BUCKETS.to_vec()),
            &["statement"],
        )
        .map_err(metric_error("command_duration_seconds"))?;

        let defrag_runs = IntCounterVec::new(
            Opts::new("defrag_runs_total", "Disk group defragmentation runs").namespace(NAMESPACE),
            &["result"],
        )
        .map_err(metric_error("defrag_runs_total"))?;

        registry
            .register(Box::new(operations.clone()))
            .map_err(metric_error("operations_total"))?;
        registry
            .register(Box::new(command_duration.clone()))
            .map_err(metric_error("command_duration_seconds"))?;
        registry
            .register(Box::new(defrag_runs.clone()))
            .map_err(metric_error("defrag_runs_total"))?;

        Ok(Self {
            registry,
            operations,
            command_duration,
            defrag_runs,
        })
    }

    pub fn record_operation(&self, operation: &str, result: &str) {
        self.operations.with_label_values(&[operation, result]).inc();
    }

    pub fn observe_command(&self, statement: &str, seconds: f64) {
        self.command_duration
            .with_label_values(&[statement])
            .observe(seconds);
    }

    pub fn record_defrag(&self, result: &str) {
        self.defrag_runs.with_label_values(&[result]).inc();
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render the registry in the Prometheus text format
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::Internal(format!("Failed to encode metrics: {}", e)))?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

fn metric_error(name: &'static str) -> impl Fn(prometheus::Error) -> Error {
    move |e| Error::Internal(format!("Failed to set up metric {}: {}", name, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_exported_with_prefix() {
        let metrics = ProvisionerMetrics::new().unwrap();
        metrics.record_operation("provision", "success");
        metrics.observe_command("create_disk", 1.5);
        metrics.record_defrag("failed");

        let (content_type, body) = metrics.encode().unwrap();
        let text = String::from_utf8(body).unwrap();

        assert!(content_type.starts_with("text/plain"));
        assert!(text.contains(r#"smcli_provisioner_operations_total{operation="provision",result="success"} 1"#));
        assert!(text.contains(r#"smcli_provisioner_command_duration_seconds_count{statement="create_disk"} 1"#));
        assert!(text.contains(r#"smcli_provisioner_defrag_runs_total{result="failed"} 1"#));
    }

    #[test]
    fn test_registries_are_independent() {
        let first = ProvisionerMetrics::new().unwrap();
        let second = ProvisionerMetrics::new().unwrap();
        first.record_defrag("started");

        assert_eq!(first.defrag_runs.with_label_values(&["started"]).get(), 1);
        assert_eq!(second.defrag_runs.with_label_values(&["started"]).get(), 0);
    }
}
