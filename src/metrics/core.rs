//! Timing helpers shared by the phase modules.

use std::time::{Duration, Instant};

/// Records elapsed time into a histogram when dropped.
///
/// Recording on drop means early returns and `?` still produce exactly one
/// observation per guard.
pub struct TimingGuard {
    start: Instant,
    histogram_name: &'static str,
    labels: Vec<(&'static str, String)>,
}

impl TimingGuard {
    pub fn new(histogram_name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            histogram_name,
            labels: Vec::new(),
        }
    }

    pub fn with_label(mut self, key: &'static str, value: String) -> Self {
        self.labels.push((key, value));
        self
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Record now instead of at scope end.
    pub fn finish(self) {}
}

impl Drop for TimingGuard {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        let labels: Vec<::metrics::Label> = self
            .labels
            .iter()
            .map(|(k, v)| ::metrics::Label::new(*k, v.clone()))
            .collect();
        ::metrics::histogram!(self.histogram_name, labels).record(duration);
    }
}

pub fn time_operation(histogram_name: &'static str) -> TimingGuard {
    TimingGuard::new(histogram_name)
}

pub fn time_operation_with_labels(
    histogram_name: &'static str,
    labels: Vec<(&'static str, String)>,
) -> TimingGuard {
    labels
        .into_iter()
        .fold(TimingGuard::new(histogram_name), |guard, (key, value)| {
            guard.with_label(key, value)
        })
}
