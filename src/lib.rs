//! Local Volume Reaper
//!
//! A Kubernetes controller that cleans up after node-local volumes. When a
//! node goes away, the claims a local-disk provisioner anchored to it can never
//! be satisfied again. The reaper deletes each such PersistentVolumeClaim, its
//! bound PersistentVolume, and the Pods that mount it, so workload controllers
//! can reschedule onto healthy nodes with fresh storage.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                          Resource Watcher                             │
//! │        Node · PersistentVolumeClaim · PersistentVolume · Pod          │
//! └───────────────────────────────┬───────────────────────────────────────┘
//!                                 │ events
//! ┌───────────────────────────────┴───────────────────────────────────────┐
//! │                          Cluster Snapshot                             │
//! │  ┌────────────────────────┐         ┌──────────────────────────────┐  │
//! │  │   claims-by-node index │         │     pods-by-claim index      │  │
//! │  └────────────────────────┘         └──────────────────────────────┘  │
//! └──────────┬─────────────────────────────────────────────┬──────────────┘
//!            │ node removed                                │ startup
//! ┌──────────┴───────────┐                     ┌───────────┴──────────────┐
//! │   Event Dispatcher   │                     │   Startup Reconciler     │
//! └──────────┬───────────┘                     └───────────┬──────────────┘
//!            └──────────────────┬──────────────────────────┘
//!                    ┌──────────┴──────────┐
//!                    │   Cleanup Engine    │──▶ delete PVC, PV, Pods
//!                    └─────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`cluster`]: API server client and watchers
//! - [`controller`]: Cleanup engine, dispatcher, reconciler and runtime
//! - [`domain`]: Object identities, ownership filter, and ports
//! - [`index`]: Reverse indices and their key functions
//! - [`snapshot`]: Local cluster view with sync tracking
//! - [`metrics`]: Prometheus metrics
//! - [`error`]: Error types and handling

pub mod cluster;
pub mod controller;
pub mod domain;
pub mod error;
pub mod index;
pub mod metrics;
pub mod snapshot;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use cluster::{connect, KubeClusterClient, ResourceWatcher};

pub use controller::{
    ClaimReport, ClaimResolution, CleanupEngine, CleanupReport, Controller, ControllerConfig,
    EventDispatcher, ReconcileSummary, StartupReconciler, WatchSource,
};

pub use domain::{
    ClusterClient, DeleteOutcome, NodeRemovedHandler, ObjectKey, OwnershipFilter, ResourceKind,
};

pub use error::{Error, ErrorAction, Result};

pub use index::ReverseIndex;

pub use metrics::ReaperMetrics;

pub use snapshot::{ClusterSnapshot, SnapshotStats};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
