//! Fixtures shared by unit tests: object builders and an in-memory client
//! that records every delete it receives.

use crate::domain::{
    ClusterClient, DeleteOutcome, ObjectKey, ResourceKind, DEFAULT_EXPECTED_PROVISIONER,
    DEFAULT_PROVISIONER_ANNOTATION, DEFAULT_SELECTED_NODE_ANNOTATION,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Node, ObjectReference, PersistentVolume, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PersistentVolumeSpec, Pod,
    PodSpec, Volume,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

// =============================================================================
// Object Builders
// =============================================================================

fn storage_annotations(
    provisioner: Option<&str>,
    node: Option<&str>,
) -> Option<BTreeMap<String, String>> {
    let mut annotations = BTreeMap::new();
    if let Some(provisioner) = provisioner {
        annotations.insert(DEFAULT_PROVISIONER_ANNOTATION.to_string(), provisioner.to_string());
    }
    if let Some(node) = node {
        annotations.insert(DEFAULT_SELECTED_NODE_ANNOTATION.to_string(), node.to_string());
    }
    Some(annotations)
}

pub fn node(name: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn claim(
    namespace: &str,
    name: &str,
    provisioner: Option<&str>,
    node: Option<&str>,
    volume_name: Option<&str>,
) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            annotations: storage_annotations(provisioner, node),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            volume_name: volume_name.map(str::to_string),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Claim created by the default provisioner on `node`
pub fn owned_claim(
    namespace: &str,
    name: &str,
    node: &str,
    volume_name: Option<&str>,
) -> PersistentVolumeClaim {
    claim(
        namespace,
        name,
        Some(DEFAULT_EXPECTED_PROVISIONER),
        Some(node),
        volume_name,
    )
}

pub fn volume(
    name: &str,
    provisioner: Option<&str>,
    node: Option<&str>,
    claim_ref: Option<(&str, &str)>,
) -> PersistentVolume {
    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            annotations: storage_annotations(provisioner, node),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            claim_ref: claim_ref.map(|(namespace, name)| ObjectReference {
                namespace: Some(namespace.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Volume created by the default provisioner on `node`, bound to `claim_ref`
pub fn owned_volume(name: &str, node: &str, claim_ref: (&str, &str)) -> PersistentVolume {
    volume(
        name,
        Some(DEFAULT_EXPECTED_PROVISIONER),
        Some(node),
        Some(claim_ref),
    )
}

pub fn pod_with_claims(namespace: &str, name: &str, claims: &[&str]) -> Pod {
    let volumes = claims
        .iter()
        .enumerate()
        .map(|(i, claim_name)| Volume {
            name: format!("vol-{}", i),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim_name.to_string(),
                read_only: None,
            }),
            ..Default::default()
        })
        .collect();

    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            volumes: Some(volumes),
            ..Default::default()
        }),
        ..Default::default()
    }
}

// =============================================================================
// Recording Client
// =============================================================================

/// A delete call observed by [`RecordingClient`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeleteCall {
    pub kind: &'static str,
    pub target: String,
}

impl DeleteCall {
    pub fn claim(namespace: &str, name: &str) -> Self {
        Self {
            kind: "pvc",
            target: format!("{}/{}", namespace, name),
        }
    }

    pub fn volume(name: &str) -> Self {
        Self {
            kind: "pv",
            target: name.to_string(),
        }
    }

    pub fn pod(namespace: &str, name: &str) -> Self {
        Self {
            kind: "pod",
            target: format!("{}/{}", namespace, name),
        }
    }
}

/// In-memory [`ClusterClient`]. Objects deleted once report `AlreadyGone`
/// afterwards; targets listed in `failing` return a server error.
#[derive(Default)]
pub struct RecordingClient {
    calls: Mutex<Vec<DeleteCall>>,
    gone: Mutex<HashSet<DeleteCall>>,
    failing: Mutex<HashSet<DeleteCall>>,
    delay: Option<Duration>,
}

impl RecordingClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Client whose deletes take `delay` to complete
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn fail_on(&self, call: DeleteCall) {
        self.failing.lock().insert(call);
    }

    /// Every delete issued so far, in call order
    pub fn calls(&self) -> Vec<DeleteCall> {
        self.calls.lock().clone()
    }

    /// Every delete issued so far, sorted
    pub fn sorted_calls(&self) -> Vec<DeleteCall> {
        let mut calls = self.calls();
        calls.sort();
        calls
    }

    async fn record(&self, call: DeleteCall, kind: ResourceKind) -> Result<DeleteOutcome> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.calls.lock().push(call.clone());

        if self.failing.lock().contains(&call) {
            return Err(Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".into(),
                message: format!("{} {} refused", kind, call.target),
                reason: "InternalError".into(),
                code: 500,
            })));
        }

        if self.gone.lock().insert(call) {
            Ok(DeleteOutcome::Deleted)
        } else {
            Ok(DeleteOutcome::AlreadyGone)
        }
    }
}

#[async_trait]
impl ClusterClient for RecordingClient {
    async fn delete_claim(&self, claim: &ObjectKey) -> Result<DeleteOutcome> {
        self.record(
            DeleteCall::claim(&claim.namespace, &claim.name),
            ResourceKind::PersistentVolumeClaim,
        )
        .await
    }

    async fn delete_volume(&self, name: &str) -> Result<DeleteOutcome> {
        self.record(DeleteCall::volume(name), ResourceKind::PersistentVolume)
            .await
    }

    async fn delete_pod(&self, pod: &ObjectKey) -> Result<DeleteOutcome> {
        self.record(DeleteCall::pod(&pod.namespace, &pod.name), ResourceKind::Pod)
            .await
    }
}
