//! Index key extraction
//!
//! Functions deriving the secondary-index keys of a watched object. They are
//! pure so the snapshot can recompute keys on every notification.

use crate::domain::{ObjectKey, OwnershipFilter};
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use kube::ResourceExt;

/// Node key of a claim for the PVC-by-node index.
///
/// Foreign claims and claims without an anchor contribute no key, so they can
/// never match a real node.
pub fn claim_node_keys(filter: &OwnershipFilter, claim: &PersistentVolumeClaim) -> Vec<String> {
    filter
        .owned_anchor(claim.annotations())
        .map(|node| vec![node.to_string()])
        .unwrap_or_default()
}

/// Claim keys of a pod for the Pod-by-PVC index: one per distinct non-empty
/// claim name, resolved in the pod's own namespace.
pub fn pod_claim_keys(pod: &Pod) -> Vec<ObjectKey> {
    let namespace = pod.namespace().unwrap_or_default();
    let mut keys: Vec<ObjectKey> = Vec::new();

    let volumes = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.volumes.as_ref())
        .map(Vec::as_slice)
        .unwrap_or_default();

    for volume in volumes {
        let Some(source) = &volume.persistent_volume_claim else {
            continue;
        };
        if source.claim_name.is_empty() {
            continue;
        }
        let key = ObjectKey::new(namespace.clone(), source.claim_name.clone());
        if !keys.contains(&key) {
            keys.push(key);
        }
    }

    keys
}

/// Name of the volume a claim is bound to, if any
pub fn bound_volume_name(claim: &PersistentVolumeClaim) -> Option<&str> {
    claim
        .spec
        .as_ref()
        .and_then(|spec| spec.volume_name.as_deref())
        .filter(|name| !name.is_empty())
}

/// Claim a volume points back to through its `claimRef`
pub fn volume_claim_ref(volume: &PersistentVolume) -> Option<ObjectKey> {
    let claim_ref = volume.spec.as_ref()?.claim_ref.as_ref()?;
    let name = claim_ref.name.as_deref().filter(|name| !name.is_empty())?;
    Some(ObjectKey::new(
        claim_ref.namespace.clone().unwrap_or_default(),
        name,
    ))
}
