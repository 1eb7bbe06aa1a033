//! Consumer Phase Metrics
//!
//! The worker's message loop: processed messages, skips and failures,
//! latency, and processed volume per game mode.

use super::{phase_metric, MetricDoc, MetricType, PhaseMetrics};

pub const PROCESSED: &str = phase_metric!(counter, "consumer", "messages_processed");
pub const PROCESSING_ERRORS: &str = phase_metric!(counter, "consumer", "processing_errors");
pub const READ_ERRORS: &str = phase_metric!(counter, "consumer", "read_errors");
pub const PROCESSING_DURATION: &str =
    phase_metric!(histogram, "consumer", "processing_duration_seconds");
pub const GAME_MODE: &str = phase_metric!(counter, "consumer", "game_mode");

pub struct ConsumerMetrics;

impl ConsumerMetrics {
    pub fn record_processed(game_mode: &str, duration_secs: f64) {
        ::metrics::counter!(PROCESSED).increment(1);
        ::metrics::counter!(GAME_MODE, "game_mode" => game_mode.to_string()).increment(1);
        ::metrics::histogram!(PROCESSING_DURATION).record(duration_secs);
    }

    /// Malformed message or failed sink write; `reason` labels which.
    pub fn record_processing_error(reason: &'static str, duration_secs: f64) {
        ::metrics::counter!(PROCESSING_ERRORS, "reason" => reason).increment(1);
        ::metrics::histogram!(PROCESSING_DURATION).record(duration_secs);
    }

    /// Non-transient broker read failure.
    pub fn record_read_error() {
        ::metrics::counter!(READ_ERRORS).increment(1);
    }
}

impl PhaseMetrics for ConsumerMetrics {
    fn register_metrics() {
        use metrics::{describe_counter, describe_histogram, Unit};

        describe_counter!(PROCESSED, "Total number of messages applied to the sink");
        describe_counter!(PROCESSING_ERRORS, "Total number of messages skipped or failed");
        describe_counter!(READ_ERRORS, "Total number of non-transient broker read errors");
        describe_histogram!(PROCESSING_DURATION, Unit::Seconds, "Duration of message processing");
        describe_counter!(GAME_MODE, "Total number of processed games by mode");
    }

    fn phase_name() -> &'static str {
        "consumer"
    }

    fn metrics_documentation() -> Vec<MetricDoc> {
        vec![
            MetricDoc {
                name: PROCESSED,
                metric_type: MetricType::Counter,
                help: "Total number of messages applied to the sink",
                labels: vec![],
            },
            MetricDoc {
                name: PROCESSING_ERRORS,
                metric_type: MetricType::Counter,
                help: "Total number of messages skipped or failed",
                labels: vec!["reason"],
            },
            MetricDoc {
                name: READ_ERRORS,
                metric_type: MetricType::Counter,
                help: "Total number of non-transient broker read errors",
                labels: vec![],
            },
            MetricDoc {
                name: PROCESSING_DURATION,
                metric_type: MetricType::Histogram,
                help: "Duration of message processing",
                labels: vec![],
            },
            MetricDoc {
                name: GAME_MODE,
                metric_type: MetricType::Counter,
                help: "Total number of processed games by mode",
                labels: vec!["game_mode"],
            },
        ]
    }
}
