//! Control plane metrics
//!
//! Counters are kept in a per-instance Prometheus registry so every
//! orchestrator (and every test) owns its own set. [`MetricsSnapshot`] is
//! the structured view served by the REST API.

use crate::controlplane::discovery::DiscoveryStats;
use crate::controlplane::resilience::{CircuitSnapshot, CircuitState};
use crate::domain::Backend;
use crate::error::{Error, Result};
use prometheus::core::Collector;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

const NAMESPACE: &str = "unified_replication";

/// Operation counters for the orchestrator
pub struct OrchestratorMetrics {
    registry: Registry,
    operations: IntCounterVec,
    errors: IntCounterVec,
    duration: HistogramVec,
    cache_hits: IntGauge,
    cache_misses: IntGauge,
    crd_queries: IntGauge,
    retries: IntGauge,
    retries_exhausted: IntGauge,
    circuit_open: IntGaugeVec,
}

fn metric_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics registration failed: {}", e))
}

impl OrchestratorMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some(NAMESPACE.to_string()), None).map_err(metric_error)?;

        let operations = IntCounterVec::new(
            Opts::new("operations_total", "Replication operations by backend, kind and result"),
            &["backend", "operation", "result"],
        )
        .map_err(metric_error)?;
        let errors = IntCounterVec::new(
            Opts::new("errors_total", "Failed operations by reason code"),
            &["reason"],
        )
        .map_err(metric_error)?;
        let duration = HistogramVec::new(
            HistogramOpts::new("operation_duration_seconds", "Duration of replication operations"),
            &["backend", "operation"],
        )
        .map_err(metric_error)?;
        let cache_hits = IntGauge::new("discovery_cache_hits", "Discovery cache hits").map_err(metric_error)?;
        let cache_misses =
            IntGauge::new("discovery_cache_misses", "Discovery cache misses").map_err(metric_error)?;
        let crd_queries =
            IntGauge::new("discovery_crd_queries", "CRD existence queries issued").map_err(metric_error)?;
        let retries = IntGauge::new("retries", "Retry attempts after a transient error").map_err(metric_error)?;
        let retries_exhausted =
            IntGauge::new("retries_exhausted", "Operations that ran out of attempts").map_err(metric_error)?;
        let circuit_open = IntGaugeVec::new(
            Opts::new("circuit_open", "1 while a backend circuit is not closed"),
            &["backend"],
        )
        .map_err(metric_error)?;

        registry.register(Box::new(operations.clone())).map_err(metric_error)?;
        registry.register(Box::new(errors.clone())).map_err(metric_error)?;
        registry.register(Box::new(duration.clone())).map_err(metric_error)?;
        registry.register(Box::new(cache_hits.clone())).map_err(metric_error)?;
        registry.register(Box::new(cache_misses.clone())).map_err(metric_error)?;
        registry.register(Box::new(crd_queries.clone())).map_err(metric_error)?;
        registry.register(Box::new(retries.clone())).map_err(metric_error)?;
        registry.register(Box::new(retries_exhausted.clone())).map_err(metric_error)?;
        registry.register(Box::new(circuit_open.clone())).map_err(metric_error)?;

        Ok(Self {
            registry,
            operations,
            errors,
            duration,
            cache_hits,
            cache_misses,
            crd_queries,
            retries,
            retries_exhausted,
            circuit_open,
        })
    }

    /// Record one finished operation. `backend` is `None` when resolution failed.
    pub fn record(&self, backend: Option<Backend>, operation: &str, error: Option<&Error>, elapsed: Duration) {
        let backend = backend.map(|b| b.as_str()).unwrap_or("none");
        let result = if error.is_some() { "error" } else { "ok" };
        self.operations
            .with_label_values(&[backend, operation, result])
            .inc();
        self.duration
            .with_label_values(&[backend, operation])
            .observe(elapsed.as_secs_f64());
        if let Some(e) = error {
            self.errors.with_label_values(&[e.reason()]).inc();
        }
    }

    pub fn operations(&self, backend: Option<Backend>, operation: &str, result: &str) -> u64 {
        let backend = backend.map(|b| b.as_str()).unwrap_or("none");
        self.operations
            .with_label_values(&[backend, operation, result])
            .get()
    }

    pub fn errors_by_reason(&self, reason: &str) -> u64 {
        self.errors.with_label_values(&[reason]).get()
    }

    /// Totals by backend label and by result
    fn totals(&self) -> (BTreeMap<String, u64>, u64, u64) {
        let mut by_backend = BTreeMap::new();
        let (mut ok, mut failed) = (0, 0);
        for family in self.operations.collect() {
            for metric in family.get_metric() {
                let value = metric.get_counter().get_value() as u64;
                let mut backend = String::new();
                let mut is_error = false;
                for label in metric.get_label() {
                    match label.get_name() {
                        "backend" => backend = label.get_value().to_string(),
                        "result" => is_error = label.get_value() == "error",
                        _ => {}
                    }
                }
                *by_backend.entry(backend).or_insert(0) += value;
                if is_error {
                    failed += value;
                } else {
                    ok += value;
                }
            }
        }
        (by_backend, ok, failed)
    }

    /// Structured snapshot combining operation counters with engine stats
    pub fn snapshot(
        &self,
        discovery: DiscoveryStats,
        retries: u64,
        retries_exhausted: u64,
        circuits: BTreeMap<Backend, CircuitSnapshot>,
    ) -> MetricsSnapshot {
        let (operations_by_backend, succeeded, failed) = self.totals();
        MetricsSnapshot {
            operations_total: succeeded + failed,
            operations_failed: failed,
            operations_by_backend,
            cache_hits: discovery.cache_hits,
            cache_misses: discovery.cache_misses,
            crd_queries: discovery.crd_queries,
            retries,
            retries_exhausted,
            circuit_rejections: circuits.values().map(|c| c.rejected).sum(),
            circuits,
        }
    }

    /// Prometheus text exposition; gauges are refreshed from `snapshot`
    pub fn render(&self, snapshot: &MetricsSnapshot) -> Result<String> {
        self.cache_hits.set(snapshot.cache_hits as i64);
        self.cache_misses.set(snapshot.cache_misses as i64);
        self.crd_queries.set(snapshot.crd_queries as i64);
        self.retries.set(snapshot.retries as i64);
        self.retries_exhausted.set(snapshot.retries_exhausted as i64);
        for (backend, circuit) in &snapshot.circuits {
            let open = circuit.state != CircuitState::Closed;
            self.circuit_open
                .with_label_values(&[backend.as_str()])
                .set(i64::from(open));
        }

        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::Internal(format!("metrics encoding failed: {}", e)))?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("metrics encoding failed: {}", e)))
    }
}

/// Point-in-time metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub operations_total: u64,
    pub operations_failed: u64,
    pub operations_by_backend: BTreeMap<String, u64>,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub crd_queries: u64,
    pub retries: u64,
    pub retries_exhausted: u64,
    pub circuit_rejections: u64,
    pub circuits: BTreeMap<Backend, CircuitSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let metrics = OrchestratorMetrics::new().unwrap();
        metrics.record(Some(Backend::Ceph), "create", None, Duration::from_millis(5));
        metrics.record(Some(Backend::Ceph), "update", None, Duration::from_millis(5));
        let err = Error::NoBackendAvailable;
        metrics.record(None, "create", Some(&err), Duration::from_millis(1));

        assert_eq!(metrics.operations(Some(Backend::Ceph), "create", "ok"), 1);
        assert_eq!(metrics.errors_by_reason("NoBackendAvailable"), 1);

        let snapshot = metrics.snapshot(DiscoveryStats::default(), 0, 0, BTreeMap::new());
        assert_eq!(snapshot.operations_total, 3);
        assert_eq!(snapshot.operations_failed, 1);
        assert_eq!(snapshot.operations_by_backend["ceph"], 2);
        assert_eq!(snapshot.operations_by_backend["none"], 1);
    }

    #[test]
    fn test_render_exposition() {
        let metrics = OrchestratorMetrics::new().unwrap();
        metrics.record(Some(Backend::Trident), "create", None, Duration::from_millis(2));
        let snapshot = metrics.snapshot(
            DiscoveryStats {
                cache_hits: 4,
                cache_misses: 1,
                crd_queries: 3,
            },
            2,
            0,
            BTreeMap::new(),
        );

        let text = metrics.render(&snapshot).unwrap();
        assert!(text.contains("unified_replication_operations_total"));
        assert!(text.contains("unified_replication_discovery_cache_hits 4"));
    }

    #[test]
    fn test_instances_do_not_collide() {
        let a = OrchestratorMetrics::new().unwrap();
        let b = OrchestratorMetrics::new().unwrap();
        a.record(Some(Backend::Ceph), "delete", None, Duration::ZERO);
        assert_eq!(b.operations(Some(Backend::Ceph), "delete", "ok"), 0);
    }
}
