//! Registers every phase's metrics and detects naming conflicts early.

use super::{AdmissionMetrics, ConsumerMetrics, MetricDoc, PhaseMetrics, PublisherMetrics, SinkMetrics};
use std::collections::HashMap;
use tracing::{info, warn};

pub fn register_all_metrics() {
    let mut all_metrics = HashMap::new();

    register_phase_metrics::<AdmissionMetrics>(&mut all_metrics);
    register_phase_metrics::<PublisherMetrics>(&mut all_metrics);
    register_phase_metrics::<ConsumerMetrics>(&mut all_metrics);
    register_phase_metrics::<SinkMetrics>(&mut all_metrics);

    info!(
        "Registered {} total metrics across all phases",
        all_metrics.len()
    );

    if std::env::var("LB_METRICS_DEBUG").is_ok() {
        log_metrics_summary(&all_metrics);
    }
}

/// Register metrics for a phase, returning the names that collided.
fn register_phase_metrics<T: PhaseMetrics>(
    all_metrics: &mut HashMap<&'static str, (&'static str, MetricDoc)>,
) -> Vec<&'static str> {
    T::register_metrics();
    let phase_name = T::phase_name();
    let mut conflicts = Vec::new();

    for doc in T::metrics_documentation() {
        if let Some((owner, _)) = all_metrics.get(doc.name) {
            warn!(
                "Metric name conflict detected: '{}' is defined in both '{}' and '{}'",
                doc.name, owner, phase_name
            );
            conflicts.push(doc.name);
        } else {
            all_metrics.insert(doc.name, (phase_name, doc));
        }
    }
    conflicts
}

fn log_metrics_summary(all_metrics: &HashMap<&'static str, (&'static str, MetricDoc)>) {
    info!("=== Metrics Registry Summary ===");
    let mut by_phase: HashMap<&str, Vec<&MetricDoc>> = HashMap::new();
    for (phase, doc) in all_metrics.values() {
        by_phase.entry(*phase).or_default().push(doc);
    }
    for (phase, metrics) in by_phase {
        info!("Phase '{}': {} metrics", phase, metrics.len());
        for metric in metrics {
            info!("  - {} ({:?}): {}", metric.name, metric.metric_type, metric.help);
        }
    }
    info!("=== End Metrics Summary ===");
}

/// Extract the phase from a metric name (e.g. "lb_publisher_dropped_total" -> "publisher")
pub fn extract_phase_from_metric_name(metric_name: &str) -> &str {
    if let Some(stripped) = metric_name.strip_prefix("lb_") {
        if let Some(next_underscore) = stripped.find('_') {
            return &stripped[..next_underscore];
        }
    }
    "unknown"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_phase_from_metric_name() {
        assert_eq!(extract_phase_from_metric_name("lb_publisher_dropped_total"), "publisher");
        assert_eq!(
            extract_phase_from_metric_name("lb_consumer_processing_duration_seconds"),
            "consumer"
        );
        assert_eq!(extract_phase_from_metric_name("invalid_metric_name"), "unknown");
    }

    #[test]
    fn phase_catalogs_do_not_collide() {
        let mut all = HashMap::new();
        assert!(register_phase_metrics::<AdmissionMetrics>(&mut all).is_empty());
        assert!(register_phase_metrics::<PublisherMetrics>(&mut all).is_empty());
        assert!(register_phase_metrics::<ConsumerMetrics>(&mut all).is_empty());
        assert!(register_phase_metrics::<SinkMetrics>(&mut all).is_empty());
        // registering a phase twice is a conflict for every one of its names
        assert_eq!(
            register_phase_metrics::<SinkMetrics>(&mut all).len(),
            SinkMetrics::metrics_documentation().len()
        );
    }

    #[test]
    fn every_metric_is_named_after_its_phase() {
        fn check<T: PhaseMetrics>() {
            for doc in T::metrics_documentation() {
                assert_eq!(extract_phase_from_metric_name(doc.name), T::phase_name(), "{}", doc.name);
            }
        }
        check::<AdmissionMetrics>();
        check::<PublisherMetrics>();
        check::<ConsumerMetrics>();
        check::<SinkMetrics>();
    }
}
