//! Sink Phase Metrics
//!
//! Write latency and failures of the terminal storage side effects, labelled
//! by `storage_type` (`durable` or `aggregator`).

use super::core::{time_operation_with_labels, TimingGuard};
use super::{phase_metric, MetricDoc, MetricType, PhaseMetrics};

pub const WRITE_DURATION: &str = phase_metric!(histogram, "sink", "write_duration_seconds");
pub const WRITE_ERRORS: &str = phase_metric!(counter, "sink", "write_errors");

pub struct SinkMetrics;

impl SinkMetrics {
    /// Time one sink write; recorded when the guard drops.
    pub fn time_write(storage_type: &'static str) -> TimingGuard {
        time_operation_with_labels(WRITE_DURATION, vec![("storage_type", storage_type.to_string())])
    }

    pub fn record_write_error(storage_type: &'static str) {
        ::metrics::counter!(WRITE_ERRORS, "storage_type" => storage_type).increment(1);
    }
}

impl PhaseMetrics for SinkMetrics {
    fn register_metrics() {
        ::metrics::describe_histogram!(
            WRITE_DURATION,
            ::metrics::Unit::Seconds,
            "Duration of storage sink writes"
        );
        ::metrics::describe_counter!(WRITE_ERRORS, "Total number of failed storage sink writes");
    }

    fn phase_name() -> &'static str {
        "sink"
    }

    fn metrics_documentation() -> Vec<MetricDoc> {
        vec![
            MetricDoc {
                name: WRITE_DURATION,
                metric_type: MetricType::Histogram,
                help: "Duration of storage sink writes",
                labels: vec!["storage_type"],
            },
            MetricDoc {
                name: WRITE_ERRORS,
                metric_type: MetricType::Counter,
                help: "Total number of failed storage sink writes",
                labels: vec!["storage_type"],
            },
        ]
    }
}
