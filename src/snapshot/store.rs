//! Cluster Snapshot
//!
//! Locally queryable copy of the Nodes, PVCs, PVs and Pods delivered by the
//! resource watcher, together with the PVC-by-node and Pod-by-PVC indices.
//! Every watcher notification updates the store and the affected index, so
//! lookups reflect adds, updates, deletes and relists alike.

use crate::domain::{ObjectKey, OwnershipFilter, ResourceKind};
use crate::error::{Error, Result};
use crate::index::{
    claim_node_keys, pod_claim_keys, ReverseIndex, CLAIMS_BY_NODE_INDEX, PODS_BY_CLAIM_INDEX,
};
use dashmap::DashMap;
use k8s_openapi::api::core::v1::{Node, PersistentVolume, PersistentVolumeClaim, Pod};
use kube::runtime::watcher::Event;
use kube::ResourceExt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

// =============================================================================
// Sync Tracking
// =============================================================================

fn sync_bit(kind: ResourceKind) -> u8 {
    match kind {
        ResourceKind::Node => 0b0001,
        ResourceKind::PersistentVolumeClaim => 0b0010,
        ResourceKind::PersistentVolume => 0b0100,
        ResourceKind::Pod => 0b1000,
    }
}

const ALL_SYNCED: u8 = 0b1111;

// =============================================================================
// Snapshot Statistics
// =============================================================================

/// Point-in-time object counts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotStats {
    pub nodes: usize,
    pub claims: usize,
    pub volumes: usize,
    pub pods: usize,
    /// Owned, anchored claims present in the PVC-by-node index
    pub indexed_claims: usize,
    /// Distinct nodes those claims are anchored to
    pub anchor_nodes: usize,
    /// Pods mounting at least one claim
    pub indexed_pods: usize,
}

// =============================================================================
// Cluster Snapshot
// =============================================================================

/// Eventually consistent view of the cluster objects the reaper cares about
pub struct ClusterSnapshot {
    filter: OwnershipFilter,
    nodes: DashMap<String, Arc<Node>>,
    claims: DashMap<ObjectKey, Arc<PersistentVolumeClaim>>,
    volumes: DashMap<String, Arc<PersistentVolume>>,
    pods: DashMap<ObjectKey, Arc<Pod>>,
    claims_by_node: ReverseIndex<String, ObjectKey>,
    pods_by_claim: ReverseIndex<ObjectKey, ObjectKey>,
    synced: watch::Sender<u8>,
}

impl std::fmt::Debug for ClusterSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterSnapshot")
            .field("stats", &self.stats())
            .finish()
    }
}

impl ClusterSnapshot {
    /// Create an empty snapshot that indexes claims according to `filter`
    pub fn new(filter: OwnershipFilter) -> Arc<Self> {
        let (synced, _) = watch::channel(0);
        Arc::new(Self {
            filter,
            nodes: DashMap::new(),
            claims: DashMap::new(),
            volumes: DashMap::new(),
            pods: DashMap::new(),
            claims_by_node: ReverseIndex::new(CLAIMS_BY_NODE_INDEX),
            pods_by_claim: ReverseIndex::new(PODS_BY_CLAIM_INDEX),
            synced,
        })
    }

    pub fn filter(&self) -> &OwnershipFilter {
        &self.filter
    }

    // =========================================================================
    // Event Application
    // =========================================================================

    /// Apply a Node notification. Returns the names of nodes that left the
    /// snapshot: the deleted node, or every node missing from a relist.
    pub fn apply_node_event(&self, event: Event<Node>) -> Vec<String> {
        match event {
            Event::Applied(node) => {
                self.nodes.insert(node.name_any(), Arc::new(node));
                Vec::new()
            }
            Event::Deleted(node) => {
                let name = node.name_any();
                self.nodes.remove(&name);
                vec![name]
            }
            Event::Restarted(nodes) => {
                let fresh = nodes
                    .into_iter()
                    .map(|node| (node.name_any(), Arc::new(node)))
                    .collect();
                let vanished = relist(&self.nodes, fresh);
                self.mark_synced(ResourceKind::Node);
                vanished
            }
        }
    }

    /// Apply a PersistentVolumeClaim notification and re-key the claim in the
    /// PVC-by-node index.
    pub fn apply_claim_event(&self, event: Event<PersistentVolumeClaim>) {
        match event {
            Event::Applied(claim) => {
                let key = ObjectKey::of(&claim);
                let node_keys = claim_node_keys(&self.filter, &claim);
                self.claims.insert(key.clone(), Arc::new(claim));
                self.claims_by_node.upsert(key, node_keys);
            }
            Event::Deleted(claim) => {
                let key = ObjectKey::of(&claim);
                self.claims_by_node.remove(&key);
                self.claims.remove(&key);
            }
            Event::Restarted(claims) => {
                let fresh: Vec<_> = claims
                    .into_iter()
                    .map(|claim| (ObjectKey::of(&claim), Arc::new(claim)))
                    .collect();
                self.claims_by_node.replace_all(
                    fresh
                        .iter()
                        .map(|(key, claim)| (key.clone(), claim_node_keys(&self.filter, claim))),
                );
                relist(&self.claims, fresh);
                self.mark_synced(ResourceKind::PersistentVolumeClaim);
            }
        }
    }

    /// Apply a PersistentVolume notification
    pub fn apply_volume_event(&self, event: Event<PersistentVolume>) {
        match event {
            Event::Applied(volume) => {
                self.volumes.insert(volume.name_any(), Arc::new(volume));
            }
            Event::Deleted(volume) => {
                self.volumes.remove(&volume.name_any());
            }
            Event::Restarted(volumes) => {
                let fresh = volumes
                    .into_iter()
                    .map(|volume| (volume.name_any(), Arc::new(volume)))
                    .collect();
                relist(&self.volumes, fresh);
                self.mark_synced(ResourceKind::PersistentVolume);
            }
        }
    }

    /// Apply a Pod notification and re-key the pod in the Pod-by-PVC index
    pub fn apply_pod_event(&self, event: Event<Pod>) {
        match event {
            Event::Applied(pod) => {
                let key = ObjectKey::of(&pod);
                let claim_keys = pod_claim_keys(&pod);
                self.pods.insert(key.clone(), Arc::new(pod));
                self.pods_by_claim.upsert(key, claim_keys);
            }
            Event::Deleted(pod) => {
                let key = ObjectKey::of(&pod);
                self.pods_by_claim.remove(&key);
                self.pods.remove(&key);
            }
            Event::Restarted(pods) => {
                let fresh: Vec<_> = pods
                    .into_iter()
                    .map(|pod| (ObjectKey::of(&pod), Arc::new(pod)))
                    .collect();
                self.pods_by_claim.replace_all(
                    fresh
                        .iter()
                        .map(|(key, pod)| (key.clone(), pod_claim_keys(pod))),
                );
                relist(&self.pods, fresh);
                self.mark_synced(ResourceKind::Pod);
            }
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn contains_node(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn claim(&self, key: &ObjectKey) -> Option<Arc<PersistentVolumeClaim>> {
        self.claims.get(key).map(|entry| entry.value().clone())
    }

    pub fn volume(&self, name: &str) -> Option<Arc<PersistentVolume>> {
        self.volumes.get(name).map(|entry| entry.value().clone())
    }

    /// Every claim in the snapshot, ordered by key
    pub fn claims(&self) -> Vec<Arc<PersistentVolumeClaim>> {
        let mut claims: Vec<_> = self
            .claims
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        claims.sort_by(|a, b| a.0.cmp(&b.0));
        claims.into_iter().map(|(_, claim)| claim).collect()
    }

    /// Every volume in the snapshot, ordered by name
    pub fn volumes(&self) -> Vec<Arc<PersistentVolume>> {
        let mut volumes: Vec<_> = self
            .volumes
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        volumes.sort_by(|a, b| a.0.cmp(&b.0));
        volumes.into_iter().map(|(_, volume)| volume).collect()
    }

    /// PVC-by-node lookup. The empty name is never a real node and matches nothing.
    pub fn claims_on_node(&self, node_name: &str) -> Vec<ObjectKey> {
        if node_name.is_empty() {
            return Vec::new();
        }
        self.claims_by_node.lookup(&node_name.to_string())
    }

    /// Pod-by-PVC lookup
    pub fn pods_using_claim(&self, claim: &ObjectKey) -> Vec<ObjectKey> {
        self.pods_by_claim.lookup(claim)
    }

    pub fn stats(&self) -> SnapshotStats {
        SnapshotStats {
            nodes: self.nodes.len(),
            claims: self.claims.len(),
            volumes: self.volumes.len(),
            pods: self.pods.len(),
            indexed_claims: self.claims_by_node.object_count(),
            anchor_nodes: self.claims_by_node.key_count(),
            indexed_pods: self.pods_by_claim.object_count(),
        }
    }

    // =========================================================================
    // Sync State
    // =========================================================================

    /// Record that `kind` has completed a full listing
    pub fn mark_synced(&self, kind: ResourceKind) {
        let bit = sync_bit(kind);
        let mut first = false;
        self.synced.send_modify(|mask| {
            first = *mask & bit == 0;
            *mask |= bit;
        });
        if first {
            info!("Initial sync complete for {} ({:?})", kind, self.stats());
        } else {
            debug!("Relisted {}", kind);
        }
    }

    pub fn is_synced(&self, kind: ResourceKind) -> bool {
        *self.synced.borrow() & sync_bit(kind) != 0
    }

    /// Fail with [`Error::SnapshotNotSynced`] unless `kind` has synced
    pub fn ensure_synced(&self, kind: ResourceKind) -> Result<()> {
        if self.is_synced(kind) {
            Ok(())
        } else {
            Err(Error::SnapshotNotSynced {
                kind: kind.to_string(),
            })
        }
    }

    /// Wait until every resource kind has completed its initial listing
    pub async fn wait_for_sync(&self, timeout: Duration) -> Result<()> {
        let mut receiver = self.synced.subscribe();
        let waited = tokio::time::timeout(timeout, receiver.wait_for(|mask| *mask == ALL_SYNCED)).await;

        match waited {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(Error::Internal("snapshot sync channel closed".into())),
            Err(_) => {
                let pending: Vec<String> = ResourceKind::ALL
                    .iter()
                    .filter(|kind| !self.is_synced(**kind))
                    .map(|kind| kind.to_string())
                    .collect();
                Err(Error::CacheSyncTimeout {
                    timeout,
                    pending: pending.join(", "),
                })
            }
        }
    }
}

/// Replace the contents of `store` with `fresh` without an empty window.
/// Returns the keys that were present before but are missing from `fresh`.
fn relist<K, T>(store: &DashMap<K, Arc<T>>, fresh: Vec<(K, Arc<T>)>) -> Vec<K>
where
    K: Hash + Eq + Clone,
{
    let mut stale: Vec<K> = store.iter().map(|entry| entry.key().clone()).collect();
    let fresh_keys: std::collections::HashSet<K> = fresh.iter().map(|(key, _)| key.clone()).collect();
    stale.retain(|key| !fresh_keys.contains(key));

    for (key, value) in fresh {
        store.insert(key, value);
    }
    for key in &stale {
        store.remove(key);
    }
    stale
}
