//! Reaper Metrics
//!
//! Prometheus counters for delete calls and cleanup passes, kept in a
//! registry owned by the controller and served on `/metrics`.

use crate::domain::{DeleteOutcome, ResourceKind};
use crate::error::{Error, Result};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

/// Label value for a failed delete
const OUTCOME_FAILED: &str = "failed";

/// Metrics for one controller instance
#[derive(Clone)]
pub struct ReaperMetrics {
    registry: Registry,
    deletes: IntCounterVec,
    node_cleanups: IntCounter,
    orphaned_claims: IntCounter,
    cleanup_duration: Histogram,
}

impl std::fmt::Debug for ReaperMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaperMetrics")
            .field("node_cleanups", &self.node_cleanups.get())
            .field("orphaned_claims", &self.orphaned_claims.get())
            .finish()
    }
}

impl ReaperMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let deletes = IntCounterVec::new(
            Opts::new("reaper_deletes_total", "Delete calls issued, by kind and outcome"),
            &["kind", "outcome"],
        )
        .map_err(metric_error)?;
        let node_cleanups = IntCounter::new(
            "reaper_node_cleanups_total",
            "Node cleanup passes started",
        )
        .map_err(metric_error)?;
        let orphaned_claims = IntCounter::new(
            "reaper_orphaned_claims_total",
            "Claims found anchored to a missing node",
        )
        .map_err(metric_error)?;
        let cleanup_duration = Histogram::with_opts(HistogramOpts::new(
            "reaper_cleanup_duration_seconds",
            "Duration of node cleanup passes",
        ))
        .map_err(metric_error)?;

        for collector in [
            Box::new(deletes.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(node_cleanups.clone()),
            Box::new(orphaned_claims.clone()),
            Box::new(cleanup_duration.clone()),
        ] {
            registry.register(collector).map_err(metric_error)?;
        }

        Ok(Self {
            registry,
            deletes,
            node_cleanups,
            orphaned_claims,
            cleanup_duration,
        })
    }

    /// Record a successful delete call
    pub fn record_delete(&self, kind: ResourceKind, outcome: DeleteOutcome) {
        self.deletes
            .with_label_values(&[kind.label(), outcome.label()])
            .inc();
    }

    /// Record a failed delete call
    pub fn record_delete_failure(&self, kind: ResourceKind) {
        self.deletes
            .with_label_values(&[kind.label(), OUTCOME_FAILED])
            .inc();
    }

    pub fn record_node_cleanup(&self, elapsed_secs: f64) {
        self.node_cleanups.inc();
        self.cleanup_duration.observe(elapsed_secs);
    }

    pub fn record_orphaned_claim(&self) {
        self.orphaned_claims.inc();
    }

    /// Number of deletes recorded for `kind` with `outcome` label
    pub fn delete_count(&self, kind: ResourceKind, outcome: &str) -> u64 {
        self.deletes.with_label_values(&[kind.label(), outcome]).get()
    }

    pub fn orphaned_claim_count(&self) -> u64 {
        self.orphaned_claims.get()
    }

    /// Render every metric in the Prometheus text format
    pub fn encode(&self) -> std::result::Result<Vec<u8>, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }

    /// Content type of [`encode`](Self::encode)'s output
    pub fn content_type(&self) -> &'static str {
        prometheus::TEXT_FORMAT
    }
}

fn metric_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metric registration failed: {}", e))
}
