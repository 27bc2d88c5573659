use kube::ResourceExt;
use prometheus::{histogram_opts, opts, HistogramVec, IntCounter, IntCounterVec, Registry};
use tokio::time::Instant;
use tracing::warn;

use crate::api::v1alpha1::contour::Contour;
use crate::util::errors::Error;

#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounter,
    pub failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "contour_operator_reconcile_duration_seconds",
                "The duration of reconcile to complete in seconds",
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
            &["instance"],
        )?;
        let failures = IntCounterVec::new(
            opts!(
                "contour_operator_reconciliation_errors_total",
                "reconciliation errors",
            ),
            &["instance", "error"],
        )?;
        let reconciliations = IntCounter::new("contour_operator_reconciliations_total", "reconciliations")?;
        Ok(Metrics {
            reconciliations,
            failures,
            reconcile_duration,
        })
    }

    /// Register API metrics to start tracking them.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.reconciliations.clone()))?;
        Ok(self)
    }

    pub fn reconcile_failure(&self, contour: &Contour, e: &Error) {
        let instance = contour.name_any();
        let label = e.metric_label();
        warn!(instance = %instance, error = %label, "Contour reconciliation failed: {}", e);
        self.failures.with_label_values(&[instance.as_str(), label.as_str()]).inc()
    }

    pub fn count_and_measure(&self, instance: &str) -> ReconcileMeasurer {
        self.reconciliations.inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.reconcile_duration.clone(),
            instance: instance.to_string(),
        }
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer {
    start: Instant,
    metric: HistogramVec,
    instance: String,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric.with_label_values(&[self.instance.as_str()]).observe(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::test_support::contour;

    #[test]
    fn failures_are_counted_per_instance_and_error() {
        let metrics = Metrics::new().unwrap().register(&Registry::new()).unwrap();
        let c = contour("demo", "ns1");

        metrics.reconcile_failure(&c, &Error::invalid_spec("bad ports"));
        metrics.reconcile_failure(&c, &Error::invalid_spec("bad ports"));

        let count = metrics.failures.with_label_values(&["demo", "invalid_spec"]).get();
        assert_eq!(count, 2);
    }

    #[test]
    fn measurer_observes_on_drop() {
        let metrics = Metrics::new().unwrap();
        {
            let _timer = metrics.count_and_measure("demo");
        }
        assert_eq!(metrics.reconciliations.get(), 1);
        assert_eq!(metrics.reconcile_duration.with_label_values(&["demo"]).get_sample_count(), 1);
    }
}
