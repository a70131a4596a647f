//! Secondary Index Module
//!
//! Reverse indices over the watched snapshot (PVC-by-node, Pod-by-PVC) and
//! the key extraction functions that feed them.

pub mod keys;
pub mod reverse_index;

pub use keys::*;
pub use reverse_index::*;

/// Name of the index from anchor node to claims
pub const CLAIMS_BY_NODE_INDEX: &str = "claims-by-node";

/// Name of the index from claim to the pods mounting it
pub const PODS_BY_CLAIM_INDEX: &str = "pods-by-claim";
