//! Ownership Filter
//!
//! Decides whether a PVC or PV was created by the provisioner this controller
//! cleans up after, and reads the node the object is anchored to. Every other
//! component consults the filter before touching a claim or volume.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default annotation naming the provisioner that created the object
pub const DEFAULT_PROVISIONER_ANNOTATION: &str = "volume.kubernetes.io/storage-provisioner";

/// Default annotation naming the node the volume was provisioned on
pub const DEFAULT_SELECTED_NODE_ANNOTATION: &str = "volume.kubernetes.io/selected-node";

/// Default provisioner identity
pub const DEFAULT_EXPECTED_PROVISIONER: &str = "rancher.io/local-path";

/// Annotation keys and the provisioner value that put an object in scope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct OwnershipFilter {
    /// Annotation holding the provisioner identity
    pub provisioner_key: String,
    /// Annotation holding the anchor node name
    pub selected_node_key: String,
    /// Provisioner identity this controller owns
    pub expected_provisioner: String,
}

impl Default for OwnershipFilter {
    fn default() -> Self {
        Self {
            provisioner_key: DEFAULT_PROVISIONER_ANNOTATION.to_string(),
            selected_node_key: DEFAULT_SELECTED_NODE_ANNOTATION.to_string(),
            expected_provisioner: DEFAULT_EXPECTED_PROVISIONER.to_string(),
        }
    }
}

impl OwnershipFilter {
    pub fn new(expected_provisioner: impl Into<String>) -> Self {
        Self {
            expected_provisioner: expected_provisioner.into(),
            ..Default::default()
        }
    }

    /// True iff the provisioner annotation exactly equals the expected value
    #[inline]
    pub fn is_owned(&self, annotations: &BTreeMap<String, String>) -> bool {
        annotations
            .get(&self.provisioner_key)
            .is_some_and(|value| *value == self.expected_provisioner)
    }

    /// Anchor node recorded on the object. Absent and empty both mean unanchored.
    #[inline]
    pub fn anchor_node<'a>(&self, annotations: &'a BTreeMap<String, String>) -> Option<&'a str> {
        annotations
            .get(&self.selected_node_key)
            .map(String::as_str)
            .filter(|node| !node.is_empty())
    }

    /// Anchor node of an owned object, `None` for foreign or unanchored objects
    pub fn owned_anchor<'a>(&self, annotations: &'a BTreeMap<String, String>) -> Option<&'a str> {
        if self.is_owned(annotations) {
            self.anchor_node(annotations)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annotations(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_is_owned_exact_match_only() {
        let filter = OwnershipFilter::default();

        assert!(filter.is_owned(&annotations(&[(
            DEFAULT_PROVISIONER_ANNOTATION,
            DEFAULT_EXPECTED_PROVISIONER
        )])));

        assert!(!filter.is_owned(&annotations(&[(
            DEFAULT_PROVISIONER_ANNOTATION,
            "other-provisioner"
        )])));
        assert!(!filter.is_owned(&annotations(&[(
            DEFAULT_PROVISIONER_ANNOTATION,
            "rancher.io/local-path "
        )])));
        assert!(!filter.is_owned(&annotations(&[(DEFAULT_PROVISIONER_ANNOTATION, "")])));
        assert!(!filter.is_owned(&BTreeMap::new()));
        // Right value under the wrong key
        assert!(!filter.is_owned(&annotations(&[(
            DEFAULT_SELECTED_NODE_ANNOTATION,
            DEFAULT_EXPECTED_PROVISIONER
        )])));
    }

    #[test]
    fn test_custom_keys() {
        let filter = OwnershipFilter {
            provisioner_key: "example.com/provisioner".into(),
            selected_node_key: "example.com/node".into(),
            expected_provisioner: "example.com/disk".into(),
        };
        let owned = annotations(&[
            ("example.com/provisioner", "example.com/disk"),
            ("example.com/node", "node-a"),
        ]);
        assert!(filter.is_owned(&owned));
        assert_eq!(filter.anchor_node(&owned), Some("node-a"));

        assert!(!filter.is_owned(&annotations(&[(
            DEFAULT_PROVISIONER_ANNOTATION,
            "example.com/disk"
        )])));
    }

    #[test]
    fn test_anchor_node_treats_empty_as_unanchored() {
        let filter = OwnershipFilter::default();
        assert_eq!(
            filter.anchor_node(&annotations(&[(DEFAULT_SELECTED_NODE_ANNOTATION, "node-a")])),
            Some("node-a")
        );
        assert_eq!(
            filter.anchor_node(&annotations(&[(DEFAULT_SELECTED_NODE_ANNOTATION, "")])),
            None
        );
        assert_eq!(filter.anchor_node(&BTreeMap::new()), None);
    }

    #[test]
    fn test_owned_anchor_requires_ownership() {
        let filter = OwnershipFilter::default();
        let foreign = annotations(&[
            (DEFAULT_PROVISIONER_ANNOTATION, "other-provisioner"),
            (DEFAULT_SELECTED_NODE_ANNOTATION, "node-a"),
        ]);
        assert_eq!(filter.owned_anchor(&foreign), None);

        let owned = annotations(&[
            (DEFAULT_PROVISIONER_ANNOTATION, DEFAULT_EXPECTED_PROVISIONER),
            (DEFAULT_SELECTED_NODE_ANNOTATION, "node-a"),
        ]);
        assert_eq!(filter.owned_anchor(&owned), Some("node-a"));
    }
}
