//! Cluster adapters - the API server side of the domain ports
//!
//! - [`client`]: delete calls with deadlines, retries and 404 handling
//! - [`watcher`]: watch streams feeding the snapshot

pub mod client;
pub mod watcher;

pub use client::{connect, KubeClusterClient};
pub use watcher::ResourceWatcher;
