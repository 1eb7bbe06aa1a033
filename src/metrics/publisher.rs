//! Publisher Phase Metrics
//!
//! The bounded publish queue and the background delivery loop: enqueues,
//! load-shedding drops, retries, and the per-envelope outcome of delivery.

use super::{phase_metric, MetricDoc, MetricType, PhaseMetrics};

pub const ENQUEUED: &str = phase_metric!(counter, "publisher", "enqueued");
pub const DROPPED: &str = phase_metric!(counter, "publisher", "dropped");
pub const RETRIES: &str = phase_metric!(counter, "publisher", "retries");
pub const DELIVERED: &str = phase_metric!(counter, "publisher", "delivered");
pub const WRITE_ERRORS: &str = phase_metric!(counter, "publisher", "write_errors");
pub const WRITE_DURATION: &str = phase_metric!(histogram, "publisher", "write_duration_seconds");
pub const QUEUE_DEPTH: &str = phase_metric!(gauge, "publisher", "queue_depth");

pub struct PublisherMetrics;

impl PublisherMetrics {
    pub fn record_enqueued(depth: usize) {
        ::metrics::counter!(ENQUEUED).increment(1);
        ::metrics::gauge!(QUEUE_DEPTH).set(depth as f64);
    }

    /// Envelope shed because the queue was full.
    pub fn record_dropped() {
        ::metrics::counter!(DROPPED).increment(1);
    }

    pub fn record_retry() {
        ::metrics::counter!(RETRIES).increment(1);
    }

    /// One observation per attempt sequence, whatever its outcome.
    pub fn record_write_duration(duration_secs: f64) {
        ::metrics::histogram!(WRITE_DURATION).record(duration_secs);
    }

    pub fn record_delivered() {
        ::metrics::counter!(DELIVERED).increment(1);
    }

    /// Envelope lost after exhausting its attempts.
    pub fn record_write_error() {
        ::metrics::counter!(WRITE_ERRORS).increment(1);
    }
}

impl PhaseMetrics for PublisherMetrics {
    fn register_metrics() {
        use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

        describe_counter!(ENQUEUED, "Total number of envelopes accepted onto the publish queue");
        describe_counter!(DROPPED, "Total number of envelopes dropped because the publish queue was full");
        describe_counter!(RETRIES, "Total number of broker write retries");
        describe_counter!(DELIVERED, "Total number of envelopes written to the broker");
        describe_counter!(WRITE_ERRORS, "Total number of envelopes lost after exhausting broker write attempts");
        describe_histogram!(WRITE_DURATION, Unit::Seconds, "Duration of broker write attempt sequences");
        describe_gauge!(QUEUE_DEPTH, "Envelopes waiting in the publish queue");
    }

    fn phase_name() -> &'static str {
        "publisher"
    }

    fn metrics_documentation() -> Vec<MetricDoc> {
        vec![
            MetricDoc {
                name: ENQUEUED,
                metric_type: MetricType::Counter,
                help: "Total number of envelopes accepted onto the publish queue",
                labels: vec![],
            },
            MetricDoc {
                name: DROPPED,
                metric_type: MetricType::Counter,
                help: "Total number of envelopes dropped because the publish queue was full",
                labels: vec![],
            },
            MetricDoc {
                name: RETRIES,
                metric_type: MetricType::Counter,
                help: "Total number of broker write retries",
                labels: vec![],
            },
            MetricDoc {
                name: DELIVERED,
                metric_type: MetricType::Counter,
                help: "Total number of envelopes written to the broker",
                labels: vec![],
            },
            MetricDoc {
                name: WRITE_ERRORS,
                metric_type: MetricType::Counter,
                help: "Total number of envelopes lost after exhausting broker write attempts",
                labels: vec![],
            },
            MetricDoc {
                name: WRITE_DURATION,
                metric_type: MetricType::Histogram,
                help: "Duration of broker write attempt sequences",
                labels: vec![],
            },
            MetricDoc {
                name: QUEUE_DEPTH,
                metric_type: MetricType::Gauge,
                help: "Envelopes waiting in the publish queue",
                labels: vec![],
            },
        ]
    }
}
