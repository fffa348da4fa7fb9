use kube::ResourceExt;
use prometheus::{histogram_opts, opts, HistogramVec, IntCounter, IntCounterVec, Registry};
use tokio::time::Instant;

use crate::{resources::Source, store::ActionTaken, Error};

#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounter,
    pub failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
    pub dependent_actions: IntCounterVec,
}

impl Default for Metrics {
    fn default() -> Self {
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "source_controller_reconcile_duration_seconds",
                "The duration of reconcile to complete in seconds"
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
            &[],
        )
        .expect("static histogram options are valid");
        let failures = IntCounterVec::new(
            opts!(
                "source_controller_reconciliation_errors_total",
                "reconciliation errors",
            ),
            &["instance", "error"],
        )
        .expect("static counter options are valid");
        let reconciliations = IntCounter::new(
            "source_controller_reconciliations_total",
            "reconciliations",
        )
        .expect("static counter options are valid");
        let dependent_actions = IntCounterVec::new(
            opts!(
                "source_controller_dependent_actions_total",
                "writes to volumes and claims by outcome",
            ),
            &["kind", "action"],
        )
        .expect("static counter options are valid");
        Metrics {
            reconciliations,
            failures,
            reconcile_duration,
            dependent_actions,
        }
    }
}

impl Metrics {
    /// Register API metrics to start tracking them.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.reconciliations.clone()))?;
        registry.register(Box::new(self.dependent_actions.clone()))?;
        Ok(self)
    }

    pub fn reconcile_failure(&self, source: &Source, e: &Error) {
        self.failures
            .with_label_values(&[source.name_any().as_ref(), e.metric_label().as_ref()])
            .inc()
    }

    pub fn dependent_action(&self, kind: &str, action: ActionTaken) {
        self.dependent_actions
            .with_label_values(&[kind, action.as_ref()])
            .inc()
    }

    pub fn count_and_measure(&self) -> ReconcileMeasurer {
        self.reconciliations.inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.reconcile_duration.clone(),
        }
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer {
    start: Instant,
    metric: HistogramVec,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric.with_label_values(&[]).observe(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_and_counts_failures() {
        let registry = Registry::new();
        let metrics = Metrics::default().register(&registry).unwrap();

        let source = Source::new("data", Default::default());
        metrics.reconcile_failure(&source, &Error::Cancelled);
        metrics.dependent_action("PersistentVolume", ActionTaken::Created);
        drop(metrics.count_and_measure());

        assert_eq!(
            metrics
                .failures
                .with_label_values(&["data", "cancelled"])
                .get(),
            1
        );
        assert_eq!(metrics.reconciliations.get(), 1);
        assert_eq!(registry.gather().len(), 4);
    }

    #[test]
    fn double_registration_fails() {
        let registry = Registry::new();
        Metrics::default().register(&registry).unwrap();
        assert!(Metrics::default().register(&registry).is_err());
    }
}
