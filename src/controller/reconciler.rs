//! Startup Reconciler
//!
//! Node deletions are only observed while the controller runs. After the
//! initial sync this pass walks every claim once and cleans up those whose
//! anchor node is no longer in the snapshot, so a restart converges on the
//! same state a continuously running controller would have reached.

use crate::controller::cleanup::{ClaimReport, CleanupEngine};
use crate::domain::ResourceKind;
use crate::error::Result;
use crate::snapshot::ClusterSnapshot;
use futures::stream::{self, StreamExt};
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, info};

/// Counts from one reconciliation pass
#[derive(Debug, Clone, Default)]
pub struct ReconcileSummary {
    /// Claims in the snapshot
    pub scanned: usize,
    /// Claims owned by the configured provisioner
    pub owned: usize,
    /// Owned claims without a selected node
    pub unanchored: usize,
    /// Owned claims whose node still exists
    pub healthy: usize,
    /// Cleanups of claims whose node is gone
    pub orphaned: Vec<ClaimReport>,
}

/// One-shot pass over the claim snapshot
pub struct StartupReconciler {
    engine: Arc<CleanupEngine>,
    snapshot: Arc<ClusterSnapshot>,
}

impl std::fmt::Debug for StartupReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartupReconciler")
            .field("engine", &self.engine)
            .finish()
    }
}

impl StartupReconciler {
    pub fn new(engine: Arc<CleanupEngine>, snapshot: Arc<ClusterSnapshot>) -> Self {
        Self { engine, snapshot }
    }

    /// Clean up every owned claim anchored to a node missing from the snapshot.
    /// Fails with nothing deleted unless every resource kind has synced.
    pub async fn reconcile_on_startup(&self) -> Result<ReconcileSummary> {
        for kind in ResourceKind::ALL {
            self.snapshot.ensure_synced(kind)?;
        }

        let filter = self.snapshot.filter();
        let mut summary = ReconcileSummary::default();
        let mut orphans = Vec::new();

        for claim in self.snapshot.claims() {
            summary.scanned += 1;
            if !filter.is_owned(claim.annotations()) {
                continue;
            }
            summary.owned += 1;

            let Some(node) = filter.anchor_node(claim.annotations()) else {
                debug!(
                    "Claim {}/{} has no selected node, leaving it alone",
                    claim.namespace().unwrap_or_default(),
                    claim.name_any()
                );
                summary.unanchored += 1;
                continue;
            };

            if self.snapshot.contains_node(node) {
                debug!(
                    "Node {} of claim {}/{} still exists",
                    node,
                    claim.namespace().unwrap_or_default(),
                    claim.name_any()
                );
                summary.healthy += 1;
                continue;
            }

            info!(
                "Node {} of claim {}/{} no longer exists",
                node,
                claim.namespace().unwrap_or_default(),
                claim.name_any()
            );
            self.engine.metrics().record_orphaned_claim();
            orphans.push(claim);
        }

        summary.orphaned = stream::iter(orphans)
            .map(|claim| async move { self.engine.cleanup_claim(&claim).await })
            .buffer_unordered(self.engine.fan_out())
            .collect()
            .await;

        info!(
            "Startup reconciliation: {} claim(s) scanned, {} owned, {} orphaned",
            summary.scanned,
            summary.owned,
            summary.orphaned.len()
        );
        Ok(summary)
    }
}
