use crate::Error;
use common::LedgerNode;
use kube::ResourceExt;
use opentelemetry::trace::TraceId;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, exemplar::HistogramWithExemplars, family::Family},
    registry::{Registry, Unit},
};
use std::sync::Arc;
use tokio::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    pub reconcile: ReconcileMetrics,
    pub lifecycle: LifecycleMetrics,
    pub registry: Arc<Registry>,
}

impl Default for Metrics {
    fn default() -> Self {
        let mut registry = Registry::with_prefix("ledgernode");
        let reconcile = ReconcileMetrics::default().register(registry.sub_registry_with_prefix("reconcile"));
        let lifecycle = LifecycleMetrics::default().register(&mut registry);
        Self {
            registry: Arc::new(registry),
            reconcile,
            lifecycle,
        }
    }
}

impl Metrics {
    /// Text exposition of every metric
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if let Err(e) = prometheus_client::encoding::text::encode(&mut buffer, &self.registry) {
            tracing::warn!("Failed to encode metrics: {e}");
        }
        buffer
    }
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug, Default)]
pub struct TraceLabel {
    pub trace_id: String,
}
impl TryFrom<&TraceId> for TraceLabel {
    type Error = Error;

    fn try_from(id: &TraceId) -> Result<TraceLabel, Error> {
        if std::matches!(id, &TraceId::INVALID) {
            Err(Error::Other("Invalid trace ID".to_string()))
        } else {
            let trace_id = id.to_string();
            Ok(Self { trace_id })
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub instance: String,
    pub error: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct KindLabels {
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub outcome: String,
}

#[derive(Clone)]
pub struct ReconcileMetrics {
    pub runs: Counter,
    pub failures: Family<ErrorLabels, Counter>,
    pub duration: HistogramWithExemplars<TraceLabel>,
}

impl Default for ReconcileMetrics {
    fn default() -> Self {
        Self {
            runs: Counter::default(),
            failures: Family::<ErrorLabels, Counter>::default(),
            duration: HistogramWithExemplars::new([0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.].into_iter()),
        }
    }
}

impl ReconcileMetrics {
    /// Register API metrics to start tracking them.
    pub fn register(self, r: &mut Registry) -> Self {
        r.register_with_unit(
            "duration",
            "reconcile duration",
            Unit::Seconds,
            self.duration.clone(),
        );
        r.register("failures", "reconciliation errors", self.failures.clone());
        r.register("runs", "reconciliations", self.runs.clone());
        self
    }

    pub fn reconcile_failure(&self, node: &LedgerNode, e: &Error) {
        self.failures
            .get_or_create(&ErrorLabels {
                instance: node.name_any(),
                error: e.metric_label(),
            })
            .inc();
    }

    pub fn count_and_measure(&self, trace_id: &TraceId) -> ReconcileMeasurer {
        self.runs.inc();
        ReconcileMeasurer {
            start: Instant::now(),
            labels: trace_id.try_into().ok(),
            metric: self.duration.clone(),
        }
    }
}

/// Counters of what the reconcile passes did to the instances
#[derive(Clone, Default)]
pub struct LifecycleMetrics {
    pub drift_restorations: Family<KindLabels, Counter>,
    pub restarts: Counter,
    pub migrations: Family<OutcomeLabels, Counter>,
    pub renewals: Counter,
}

impl LifecycleMetrics {
    pub fn register(self, r: &mut Registry) -> Self {
        r.register(
            "drift_restorations",
            "objects restored after drift",
            self.drift_restorations.clone(),
        );
        r.register("restarts", "coalesced workload restarts", self.restarts.clone());
        r.register("migrations", "migration job polls by outcome", self.migrations.clone());
        r.register("renewals", "certificate renewals scheduled", self.renewals.clone());
        self
    }

    pub fn drift_restored(&self, kind: &str) {
        self.drift_restorations
            .get_or_create(&KindLabels { kind: kind.to_string() })
            .inc();
    }

    pub fn migration(&self, outcome: &str) {
        self.migrations
            .get_or_create(&OutcomeLabels {
                outcome: outcome.to_string(),
            })
            .inc();
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer {
    start: Instant,
    labels: Option<TraceLabel>,
    metric: HistogramWithExemplars<TraceLabel>,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        let labels = self.labels.take();
        self.metric.observe(duration, labels);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoded_metrics_carry_prefix() {
        let m = Metrics::default();
        m.reconcile.runs.inc();
        m.lifecycle.drift_restored("Deployment");
        m.lifecycle.migration("completed");
        let text = m.encode();
        assert!(text.contains("ledgernode_reconcile_runs_total 1"));
        assert!(text.contains("ledgernode_drift_restorations_total{kind=\"Deployment\"} 1"));
        assert!(text.contains("ledgernode_migrations_total{outcome=\"completed\"} 1"));
    }

    #[test]
    fn test_invalid_trace_id_has_no_exemplar() {
        assert!(TraceLabel::try_from(&TraceId::INVALID).is_err());
    }
}
