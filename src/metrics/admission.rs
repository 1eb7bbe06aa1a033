//! Admission Phase Metrics
//!
//! Requests reaching the ingestion edge and how they were decided:
//! throttled, rejected by validation, or admitted (by game mode).

use super::{phase_metric, MetricDoc, MetricType, PhaseMetrics};

pub const REQUESTS: &str = phase_metric!(counter, "admission", "requests");
pub const THROTTLED: &str = phase_metric!(counter, "admission", "throttled");
pub const REJECTED: &str = phase_metric!(counter, "admission", "rejected");
pub const GAME_MODE: &str = phase_metric!(counter, "admission", "game_mode");
pub const TRACKED_PRINCIPALS: &str = phase_metric!(gauge, "admission", "tracked_principals");

pub struct AdmissionMetrics;

impl AdmissionMetrics {
    pub fn record_request() {
        ::metrics::counter!(REQUESTS).increment(1);
    }

    pub fn record_throttled() {
        ::metrics::counter!(THROTTLED).increment(1);
    }

    pub fn record_rejected() {
        ::metrics::counter!(REJECTED).increment(1);
    }

    pub fn record_admitted(game_mode: &str) {
        ::metrics::counter!(GAME_MODE, "game_mode" => game_mode.to_string()).increment(1);
    }

    /// Rate-limiter buckets currently held (never shrinks).
    pub fn record_tracked_principals(count: usize) {
        ::metrics::gauge!(TRACKED_PRINCIPALS).set(count as f64);
    }
}

impl PhaseMetrics for AdmissionMetrics {
    fn register_metrics() {
        for doc in Self::metrics_documentation() {
            match doc.metric_type {
                MetricType::Counter => ::metrics::describe_counter!(doc.name, doc.help),
                MetricType::Gauge => ::metrics::describe_gauge!(doc.name, doc.help),
                MetricType::Histogram => ::metrics::describe_histogram!(doc.name, doc.help),
            }
        }
    }

    fn phase_name() -> &'static str {
        "admission"
    }

    fn metrics_documentation() -> Vec<MetricDoc> {
        vec![
            MetricDoc {
                name: REQUESTS,
                metric_type: MetricType::Counter,
                help: "Total number of score submissions received",
                labels: vec![],
            },
            MetricDoc {
                name: THROTTLED,
                metric_type: MetricType::Counter,
                help: "Total number of submissions denied by the rate limiter",
                labels: vec![],
            },
            MetricDoc {
                name: REJECTED,
                metric_type: MetricType::Counter,
                help: "Total number of submissions failing validation",
                labels: vec![],
            },
            MetricDoc {
                name: GAME_MODE,
                metric_type: MetricType::Counter,
                help: "Total number of admitted scores by game mode",
                labels: vec!["game_mode"],
            },
            MetricDoc {
                name: TRACKED_PRINCIPALS,
                metric_type: MetricType::Gauge,
                help: "Number of principals holding a rate-limit bucket",
                labels: vec![],
            },
        ]
    }
}
