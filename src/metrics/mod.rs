//! Centralized metrics for the score pipeline
//!
//! Each pipeline phase (admission, publisher, consumer, sink) defines its own
//! metrics in a dedicated submodule, so every metric has one owner and names
//! cannot collide silently.

pub mod admission;
pub mod consumer;
pub mod core;
pub mod publisher;
pub mod registry;
pub mod sink;

pub use admission::AdmissionMetrics;
pub use consumer::ConsumerMetrics;
pub use publisher::PublisherMetrics;
pub use sink::SinkMetrics;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::{Once, OnceLock};
use tracing::{info, warn};

static INIT: Once = Once::new();
static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder and register every phase's metrics.
///
/// Idempotent. When `listen_addr` parses and a tokio runtime is running, an
/// HTTP exporter serves `/metrics` there. If that address cannot be bound, or
/// no exporter is requested, only the in-process handle is available.
pub fn init_metrics(listen_addr: Option<&str>) {
    INIT.call_once(|| {
        let addr = match listen_addr.map(str::parse::<SocketAddr>) {
            Some(Ok(addr)) if tokio::runtime::Handle::try_current().is_ok() => Some(addr),
            Some(Ok(addr)) => {
                warn!("No runtime for metrics exporter at {}; exporter disabled", addr);
                None
            }
            Some(Err(e)) => {
                warn!("Invalid metrics addr: {}; exporter disabled", e);
                None
            }
            None => None,
        };

        let handle = match addr {
            Some(addr) => match install_http_exporter(addr) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    warn!("Prometheus exporter at {} unavailable ({}); recording in-process only", addr, e);
                    install_in_process()
                }
            },
            None => install_in_process(),
        };

        if let Some(handle) = handle {
            if HANDLE.set(handle).is_err() {
                warn!("Prometheus handle already set");
            }
            registry::register_all_metrics();
            info!("All pipeline metrics registered");
        }
    });
}

fn install_http_exporter(addr: SocketAddr) -> anyhow::Result<PrometheusHandle> {
    let (recorder, exporter) = PrometheusBuilder::new().with_http_listener(addr).build()?;
    let handle = recorder.handle();
    ::metrics::set_global_recorder(recorder).map_err(|e| anyhow::anyhow!("{}", e))?;
    tokio::spawn(async move {
        // ExporterError implements neither Debug nor Display in this exporter version.
        if exporter.await.is_err() {
            warn!("Prometheus exporter stopped with an error");
        }
    });
    info!("Prometheus HTTP exporter at http://{}/metrics", addr);
    Ok(handle)
}

fn install_in_process() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("Failed to install Prometheus recorder: {}", e);
            None
        }
    }
}

/// Current metrics in Prometheus text format, if the recorder is installed.
pub fn render() -> Option<String> {
    HANDLE.get().map(|h| h.render())
}

/// Trait for phase-specific metrics collections
///
/// Each phase provides registration at startup, a phase name used as the
/// metric prefix, and documentation for each metric it owns.
pub trait PhaseMetrics {
    fn register_metrics();

    fn phase_name() -> &'static str;

    fn metrics_documentation() -> Vec<MetricDoc>;
}

/// Documentation for a single metric
#[derive(Debug, Clone)]
pub struct MetricDoc {
    pub name: &'static str,
    pub metric_type: MetricType,
    pub help: &'static str,
    pub labels: Vec<&'static str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Histogram,
    Gauge,
}

/// Build a metric name following `lb_{phase}_{metric_name}[_total]`.
macro_rules! phase_metric {
    (counter, $phase:literal, $name:literal) => {
        concat!("lb_", $phase, "_", $name, "_total")
    };
    (histogram, $phase:literal, $name:literal) => {
        concat!("lb_", $phase, "_", $name)
    };
    (gauge, $phase:literal, $name:literal) => {
        concat!("lb_", $phase, "_", $name)
    };
}

pub(crate) use phase_metric;
