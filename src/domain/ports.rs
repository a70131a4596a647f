//! Domain Ports - Core trait definitions for the reaper
//!
//! These traits define the boundaries between the cleanup logic and the
//! cluster. Adapters in [`crate::cluster`] implement them against a live API
//! server; tests implement them in memory.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// =============================================================================
// Object Identity
// =============================================================================

/// Identity of a namespaced object. Cluster-scoped objects use an empty namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Build the key of any kube resource from its metadata
    pub fn of<K: kube::ResourceExt>(resource: &K) -> Self {
        Self::new(resource.namespace().unwrap_or_default(), resource.name_any())
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

// =============================================================================
// Resource Kinds
// =============================================================================

/// Resource kinds the reaper observes or deletes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Node,
    PersistentVolumeClaim,
    PersistentVolume,
    Pod,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Node,
        ResourceKind::PersistentVolumeClaim,
        ResourceKind::PersistentVolume,
        ResourceKind::Pod,
    ];

    /// Short lowercase label used in metrics
    pub fn label(&self) -> &'static str {
        match self {
            ResourceKind::Node => "node",
            ResourceKind::PersistentVolumeClaim => "pvc",
            ResourceKind::PersistentVolume => "pv",
            ResourceKind::Pod => "pod",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Node => write!(f, "Node"),
            ResourceKind::PersistentVolumeClaim => write!(f, "PersistentVolumeClaim"),
            ResourceKind::PersistentVolume => write!(f, "PersistentVolume"),
            ResourceKind::Pod => write!(f, "Pod"),
        }
    }
}

// =============================================================================
// Delete Outcome
// =============================================================================

/// Successful result of a delete call. An object that is already gone counts
/// as deleted, which makes every delete idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The API server accepted the delete
    Deleted,
    /// The object did not exist
    AlreadyGone,
}

impl DeleteOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            DeleteOutcome::Deleted => "deleted",
            DeleteOutcome::AlreadyGone => "already_gone",
        }
    }
}

// =============================================================================
// Cluster Client Port
// =============================================================================

/// Outbound delete calls against the cluster.
///
/// Implementations must be safe for concurrent use and must report a missing
/// object as [`DeleteOutcome::AlreadyGone`] rather than an error.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Delete a PersistentVolumeClaim
    async fn delete_claim(&self, claim: &ObjectKey) -> Result<DeleteOutcome>;

    /// Delete a PersistentVolume
    async fn delete_volume(&self, name: &str) -> Result<DeleteOutcome>;

    /// Delete a Pod
    async fn delete_pod(&self, pod: &ObjectKey) -> Result<DeleteOutcome>;
}

// =============================================================================
// Node Removal Port
// =============================================================================

/// Callback invoked by the resource watcher once per observed node deletion.
///
/// Implementations must return promptly; the watcher delivers the next
/// notification only after this returns.
pub trait NodeRemovedHandler: Send + Sync {
    fn on_node_removed(&self, node_name: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key_display() {
        assert_eq!(ObjectKey::new("ns1", "data-0").to_string(), "ns1/data-0");
        assert_eq!(ObjectKey::new("", "pv-123").to_string(), "pv-123");
    }

    #[test]
    fn test_object_key_ordering() {
        let mut keys = vec![
            ObjectKey::new("ns2", "a"),
            ObjectKey::new("ns1", "b"),
            ObjectKey::new("ns1", "a"),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                ObjectKey::new("ns1", "a"),
                ObjectKey::new("ns1", "b"),
                ObjectKey::new("ns2", "a"),
            ]
        );
    }
}
