//! Event Dispatcher
//!
//! Turns node-removed notifications from the watch loop into cleanup tasks.
//! The watch loop must never block on API calls, so every cleanup runs on
//! its own task, tracked so shutdown can wait for them.

use crate::controller::cleanup::CleanupEngine;
use crate::domain::NodeRemovedHandler;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

pub struct EventDispatcher {
    engine: Arc<CleanupEngine>,
    tracker: TaskTracker,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("engine", &self.engine)
            .field("in_flight", &self.tracker.len())
            .field("closed", &self.tracker.is_closed())
            .finish()
    }
}

impl EventDispatcher {
    pub fn new(engine: Arc<CleanupEngine>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            tracker: TaskTracker::new(),
        })
    }

    /// Cleanups still running
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Stop accepting cleanups and wait up to `grace` for running ones.
    /// Returns false if some were still running when the grace period ended.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.tracker.close();
        let running = self.tracker.len();
        if running > 0 {
            info!("Waiting up to {:?} for {} node cleanup(s)", grace, running);
        }

        match tokio::time::timeout(grace, self.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    "{} node cleanup(s) still running after {:?}, abandoning",
                    self.tracker.len(),
                    grace
                );
                false
            }
        }
    }
}

impl NodeRemovedHandler for EventDispatcher {
    fn on_node_removed(&self, node_name: &str) {
        if self.tracker.is_closed() {
            warn!("Node {} deleted during shutdown, not cleaning up", node_name);
            return;
        }
        info!("Node {} deleted", node_name);

        let engine = self.engine.clone();
        let node_name = node_name.to_string();
        self.tracker.spawn(async move {
            match engine.cleanup_node(&node_name).await {
                Ok(report) if !report.claims.is_empty() => info!(
                    "Node {} cleanup: {} claim(s), {} delete(s), {} failure(s)",
                    report.node,
                    report.claims.len(),
                    report.deletes(),
                    report.failures()
                ),
                Ok(_) => {}
                Err(e) => error!("Cleanup of node {} aborted: {}", node_name, e),
            }
        });
    }
}
