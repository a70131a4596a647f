//! Cleanup Engine
//!
//! Resolves the claims anchored to a node and deletes, per claim, the PVC,
//! then its bound PV, then every Pod mounting it. Every delete is best effort:
//! a failure is logged and counted and never stops the rest of the batch.

use crate::controller::config::{ClaimResolution, ControllerConfig};
use crate::domain::{ClusterClient, DeleteOutcome, ObjectKey, ResourceKind};
use crate::error::Result;
use crate::index::{bound_volume_name, volume_claim_ref};
use crate::metrics::ReaperMetrics;
use crate::snapshot::ClusterSnapshot;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use futures::stream::{self, StreamExt};
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::ResourceExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

// =============================================================================
// Reports
// =============================================================================

/// What happened to one claim and its dependents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimReport {
    pub claim: ObjectKey,
    /// The claim was not processed: foreign, or already being cleaned up
    pub skipped: bool,
    /// Delete calls that succeeded, including already-absent objects
    pub deletes: usize,
    /// Delete calls that failed
    pub failures: usize,
}

impl ClaimReport {
    fn new(claim: ObjectKey) -> Self {
        Self {
            claim,
            skipped: false,
            deletes: 0,
            failures: 0,
        }
    }

    fn skipped(claim: ObjectKey) -> Self {
        Self {
            skipped: true,
            ..Self::new(claim)
        }
    }

    fn tally(&mut self, succeeded: bool) {
        if succeeded {
            self.deletes += 1;
        } else {
            self.failures += 1;
        }
    }
}

/// Result of one node cleanup pass
#[derive(Debug, Clone)]
pub struct CleanupReport {
    pub node: String,
    pub started_at: DateTime<Utc>,
    pub claims: Vec<ClaimReport>,
}

impl CleanupReport {
    pub fn deletes(&self) -> usize {
        self.claims.iter().map(|claim| claim.deletes).sum()
    }

    pub fn failures(&self) -> usize {
        self.claims.iter().map(|claim| claim.failures).sum()
    }
}

// =============================================================================
// In-Flight Tracking
// =============================================================================

/// Releases a claim's in-flight marker when its cleanup ends
struct InFlightGuard<'a> {
    claims: &'a DashSet<ObjectKey>,
    claim: ObjectKey,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.claims.remove(&self.claim);
    }
}

// =============================================================================
// Cleanup Engine
// =============================================================================

/// Deletes the storage objects and pods left behind by a removed node
pub struct CleanupEngine {
    client: Arc<dyn ClusterClient>,
    snapshot: Arc<ClusterSnapshot>,
    metrics: ReaperMetrics,
    resolution: ClaimResolution,
    /// Claims cleaned concurrently within one batch
    fan_out: usize,
    /// Claims cleaned concurrently across all batches
    permits: Arc<Semaphore>,
    /// Claims with a cleanup currently running
    in_flight: DashSet<ObjectKey>,
}

impl std::fmt::Debug for CleanupEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupEngine")
            .field("resolution", &self.resolution)
            .field("fan_out", &self.fan_out)
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

impl CleanupEngine {
    pub fn new(
        config: &ControllerConfig,
        client: Arc<dyn ClusterClient>,
        snapshot: Arc<ClusterSnapshot>,
        metrics: ReaperMetrics,
    ) -> Arc<Self> {
        let fan_out = config.max_concurrent_deletes.max(1);
        Arc::new(Self {
            client,
            snapshot,
            metrics,
            resolution: config.claim_resolution,
            fan_out,
            permits: Arc::new(Semaphore::new(fan_out)),
            in_flight: DashSet::new(),
        })
    }

    pub fn fan_out(&self) -> usize {
        self.fan_out
    }

    pub fn metrics(&self) -> &ReaperMetrics {
        &self.metrics
    }

    /// Delete every claim anchored to `node_name`, with its volume and pods.
    ///
    /// Safe to call repeatedly and concurrently. Fails only when the claims
    /// cannot be enumerated, in which case nothing was deleted.
    pub async fn cleanup_node(&self, node_name: &str) -> Result<CleanupReport> {
        let started_at = Utc::now();
        let timer = Instant::now();

        let claims = self.resolve_claims(node_name)?;
        if claims.is_empty() {
            debug!("No claims anchored to node {}", node_name);
        } else {
            info!(
                "Cleaning up {} claim(s) anchored to node {} (resolved by {})",
                claims.len(),
                node_name,
                self.resolution
            );
        }

        let pods_seen = DashSet::new();
        let reports: Vec<ClaimReport> = stream::iter(claims)
            .map(|claim| {
                let pods_seen = &pods_seen;
                async move { self.cleanup_claim_in_batch(&claim, pods_seen).await }
            })
            .buffer_unordered(self.fan_out)
            .collect()
            .await;

        let report = CleanupReport {
            node: node_name.to_string(),
            started_at,
            claims: reports,
        };
        self.metrics
            .record_node_cleanup(timer.elapsed().as_secs_f64());

        if report.failures() > 0 {
            warn!(
                "Cleanup of node {} finished with {} failed delete(s), {} succeeded",
                node_name,
                report.failures(),
                report.deletes()
            );
        } else if !report.claims.is_empty() {
            info!(
                "Cleanup of node {} finished: {} delete(s)",
                node_name,
                report.deletes()
            );
        }

        Ok(report)
    }

    /// Claims anchored to `node_name`, per the configured resolution strategy.
    ///
    /// Claims, volumes and pods must all have synced: a claim deleted against
    /// a partial view would strand its volume and pods for good.
    pub fn resolve_claims(&self, node_name: &str) -> Result<Vec<Arc<PersistentVolumeClaim>>> {
        for kind in [
            ResourceKind::PersistentVolumeClaim,
            ResourceKind::PersistentVolume,
            ResourceKind::Pod,
        ] {
            self.snapshot.ensure_synced(kind)?;
        }
        if node_name.is_empty() {
            return Ok(Vec::new());
        }

        match self.resolution {
            ClaimResolution::Index => Ok(self
                .snapshot
                .claims_on_node(node_name)
                .iter()
                .filter_map(|key| self.snapshot.claim(key))
                .collect()),
            ClaimResolution::VolumeScan => Ok(self.scan_volumes_for_claims(node_name)),
        }
    }

    /// Non-indexed resolution: owned volumes on the node, followed through
    /// their claimRef to owned claims.
    fn scan_volumes_for_claims(&self, node_name: &str) -> Vec<Arc<PersistentVolumeClaim>> {
        let filter = self.snapshot.filter();
        let mut claims: Vec<Arc<PersistentVolumeClaim>> = Vec::new();

        for volume in self.snapshot.volumes() {
            if filter.owned_anchor(volume.annotations()) != Some(node_name) {
                continue;
            }
            let Some(claim_key) = volume_claim_ref(&volume) else {
                continue;
            };
            let Some(claim) = self.snapshot.claim(&claim_key) else {
                debug!(
                    "Volume {} refers to claim {} which is not in the snapshot",
                    volume.name_any(),
                    claim_key
                );
                continue;
            };
            if !filter.is_owned(claim.annotations()) {
                continue;
            }
            if !claims.iter().any(|known| ObjectKey::of(known.as_ref()) == claim_key) {
                claims.push(claim);
            }
        }

        claims
    }

    /// Delete one orphaned claim, its bound volume, and the pods mounting it,
    /// in that order. Foreign claims and claims already being cleaned up are
    /// skipped.
    pub async fn cleanup_claim(&self, claim: &PersistentVolumeClaim) -> ClaimReport {
        self.cleanup_claim_in_batch(claim, &DashSet::new()).await
    }

    /// [`cleanup_claim`](Self::cleanup_claim) within a batch; a pod mounting
    /// several claims of the batch is deleted once, by the first claim to reach it.
    async fn cleanup_claim_in_batch(
        &self,
        claim: &PersistentVolumeClaim,
        pods_seen: &DashSet<ObjectKey>,
    ) -> ClaimReport {
        let key = ObjectKey::of(claim);
        let filter = self.snapshot.filter();

        if !filter.is_owned(claim.annotations()) {
            debug!("Claim {} is not owned by this provisioner, skipping", key);
            return ClaimReport::skipped(key);
        }
        if !self.in_flight.insert(key.clone()) {
            debug!("Claim {} is already being cleaned up", key);
            return ClaimReport::skipped(key);
        }
        let _guard = InFlightGuard {
            claims: &self.in_flight,
            claim: key.clone(),
        };
        let Ok(_permit) = self.permits.acquire().await else {
            return ClaimReport::skipped(key);
        };

        let node = filter.anchor_node(claim.annotations()).unwrap_or("<unanchored>");
        let mut report = ClaimReport::new(key.clone());

        let claim_deleted = self
            .delete(
                ResourceKind::PersistentVolumeClaim,
                &key.to_string(),
                node,
                self.client.delete_claim(&key),
            )
            .await;
        report.tally(claim_deleted);

        match bound_volume_name(claim) {
            None => debug!("Claim {} is not bound to a volume", key),
            Some(volume_name) => match self.snapshot.volume(volume_name) {
                None => debug!(
                    "Volume {} of claim {} is not in the snapshot, nothing to delete",
                    volume_name, key
                ),
                Some(volume) if !filter.is_owned(volume.annotations()) => debug!(
                    "Volume {} of claim {} is not owned by this provisioner, skipping",
                    volume_name, key
                ),
                Some(_) => {
                    let volume_deleted = self
                        .delete(
                            ResourceKind::PersistentVolume,
                            volume_name,
                            node,
                            self.client.delete_volume(volume_name),
                        )
                        .await;
                    report.tally(volume_deleted);
                }
            },
        }

        let pods: Vec<ObjectKey> = self
            .snapshot
            .pods_using_claim(&key)
            .into_iter()
            .filter(|pod| pods_seen.insert(pod.clone()))
            .collect();
        let targets: Vec<String> = pods.iter().map(ToString::to_string).collect();
        let pod_deletes: Vec<_> = pods
            .iter()
            .zip(&targets)
            .map(|(pod, target)| {
                self.delete(ResourceKind::Pod, target, node, self.client.delete_pod(pod))
            })
            .collect();
        let pod_results: Vec<bool> = stream::iter(pod_deletes)
            .buffer_unordered(self.fan_out)
            .collect()
            .await;
        for deleted in pod_results {
            report.tally(deleted);
        }

        report
    }

    /// Await one delete call, log and count its outcome
    async fn delete<F>(&self, kind: ResourceKind, target: &str, node: &str, call: F) -> bool
    where
        F: Future<Output = Result<DeleteOutcome>>,
    {
        match call.await {
            Ok(outcome) => {
                self.metrics.record_delete(kind, outcome);
                match outcome {
                    DeleteOutcome::Deleted => {
                        info!("Deleted {} {} (node {})", kind, target, node)
                    }
                    DeleteOutcome::AlreadyGone => {
                        debug!("{} {} already gone (node {})", kind, target, node)
                    }
                }
                true
            }
            Err(e) => {
                self.metrics.record_delete_failure(kind);
                warn!("Failed to delete {} {} (node {}): {}", kind, target, node, e);
                false
            }
        }
    }
}
