//! Controller Runtime
//!
//! Wires the snapshot, cleanup engine, reconciler and dispatcher together and
//! drives the lifecycle: start watches, wait for the initial sync, reconcile
//! once, then serve node deletions until shutdown.

use crate::controller::cleanup::CleanupEngine;
use crate::controller::config::ControllerConfig;
use crate::controller::dispatcher::EventDispatcher;
use crate::controller::reconciler::{ReconcileSummary, StartupReconciler};
use crate::domain::{ClusterClient, NodeRemovedHandler};
use crate::error::{Error, Result};
use crate::metrics::ReaperMetrics;
use crate::snapshot::ClusterSnapshot;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Feeds cluster notifications into the snapshot.
///
/// Implementations apply every event to `snapshot` and report each node that
/// leaves it to `handler`, until `shutdown` is cancelled.
#[async_trait]
pub trait WatchSource: Send + Sync {
    async fn run(
        &self,
        snapshot: Arc<ClusterSnapshot>,
        handler: Arc<dyn NodeRemovedHandler>,
        shutdown: CancellationToken,
    ) -> Result<()>;
}

pub struct Controller {
    config: ControllerConfig,
    snapshot: Arc<ClusterSnapshot>,
    reconciler: StartupReconciler,
    dispatcher: Arc<EventDispatcher>,
    ready: Arc<AtomicBool>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("config", &self.config)
            .field("snapshot", &self.snapshot)
            .field("dispatcher", &self.dispatcher)
            .field("ready", &self.ready.load(Ordering::SeqCst))
            .finish()
    }
}

impl Controller {
    pub fn new(
        config: ControllerConfig,
        client: Arc<dyn ClusterClient>,
        metrics: ReaperMetrics,
    ) -> Result<Self> {
        config.validate()?;

        let snapshot = ClusterSnapshot::new(config.ownership.clone());
        let engine = CleanupEngine::new(&config, client, snapshot.clone(), metrics);
        let reconciler = StartupReconciler::new(engine.clone(), snapshot.clone());
        let dispatcher = EventDispatcher::new(engine);

        Ok(Self {
            config,
            snapshot,
            reconciler,
            dispatcher,
            ready: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Set once startup reconciliation has finished
    pub fn ready_flag(&self) -> Arc<AtomicBool> {
        self.ready.clone()
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Fails if the initial sync does not finish within the configured
    /// timeout or the watch source stops with an error.
    pub async fn run(
        &self,
        source: Arc<dyn WatchSource>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        info!(
            "Starting reaper for provisioner {} (claims resolved by {})",
            self.config.ownership.expected_provisioner, self.config.claim_resolution
        );

        let watch_shutdown = shutdown.child_token();
        let snapshot = self.snapshot.clone();
        let handler: Arc<dyn NodeRemovedHandler> = self.dispatcher.clone();
        let watch_token = watch_shutdown.clone();
        let mut watch =
            tokio::spawn(async move { source.run(snapshot, handler, watch_token).await });

        // Initial sync
        tokio::select! {
            synced = self.snapshot.wait_for_sync(self.config.sync_timeout()) => {
                if let Err(e) = synced {
                    error!("Initial sync failed: {}", e);
                    watch_shutdown.cancel();
                    let _ = watch.await;
                    return Err(e);
                }
            }
            finished = &mut watch => {
                return Self::watch_finished(finished);
            }
            _ = shutdown.cancelled() => {
                let _ = watch.await;
                return Ok(());
            }
        }

        match self.reconciler.reconcile_on_startup().await {
            Ok(summary) => log_summary(&summary),
            Err(e) => error!("Startup reconciliation failed: {}", e),
        }
        self.ready.store(true, Ordering::SeqCst);
        info!("Reaper is ready, watching for node deletions");

        let result = tokio::select! {
            finished = &mut watch => Self::watch_finished(finished),
            _ = shutdown.cancelled() => {
                info!("Shutdown requested");
                let _ = watch.await;
                Ok(())
            }
        };

        self.ready.store(false, Ordering::SeqCst);
        if !self.dispatcher.shutdown(self.config.shutdown_grace()).await {
            warn!("Exiting with node cleanups still in flight");
        }
        result
    }

    fn watch_finished(
        finished: std::result::Result<Result<()>, tokio::task::JoinError>,
    ) -> Result<()> {
        match finished {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!("Watch stopped: {}", e);
                Err(e)
            }
            Err(e) => Err(Error::Internal(format!("watch task failed: {}", e))),
        }
    }
}

fn log_summary(summary: &ReconcileSummary) {
    let failures: usize = summary.orphaned.iter().map(|claim| claim.failures).sum();
    if failures > 0 {
        warn!(
            "Startup reconciliation cleaned {} orphaned claim(s) with {} failed delete(s)",
            summary.orphaned.len(),
            failures
        );
    } else if !summary.orphaned.is_empty() {
        info!(
            "Startup reconciliation cleaned {} orphaned claim(s)",
            summary.orphaned.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{node, owned_claim, DeleteCall, RecordingClient};
    use assert_matches::assert_matches;
    use kube::runtime::watcher::Event;
    use std::time::Duration;
    use tokio_test::assert_ok;

    /// Lists a fixed cluster, then deletes the given nodes one by one
    struct ScriptedSource {
        nodes: Vec<&'static str>,
        claims: Vec<(&'static str, &'static str)>,
        deletions: Vec<&'static str>,
    }

    #[async_trait]
    impl WatchSource for ScriptedSource {
        async fn run(
            &self,
            snapshot: Arc<ClusterSnapshot>,
            handler: Arc<dyn NodeRemovedHandler>,
            shutdown: CancellationToken,
        ) -> Result<()> {
            snapshot.apply_node_event(Event::Restarted(
                self.nodes.iter().map(|name| node(name)).collect(),
            ));
            snapshot.apply_claim_event(Event::Restarted(
                self.claims
                    .iter()
                    .map(|(name, anchor)| owned_claim("ns1", name, anchor, None))
                    .collect(),
            ));
            snapshot.apply_volume_event(Event::Restarted(vec![]));
            snapshot.apply_pod_event(Event::Restarted(vec![]));

            // Let startup reconciliation run before the first deletion
            tokio::time::sleep(Duration::from_millis(50)).await;
            for name in &self.deletions {
                for removed in snapshot.apply_node_event(Event::Deleted(node(name))) {
                    handler.on_node_removed(&removed);
                }
            }

            shutdown.cancelled().await;
            Ok(())
        }
    }

    /// Never lists anything
    struct SilentSource;

    #[async_trait]
    impl WatchSource for SilentSource {
        async fn run(
            &self,
            _snapshot: Arc<ClusterSnapshot>,
            _handler: Arc<dyn NodeRemovedHandler>,
            shutdown: CancellationToken,
        ) -> Result<()> {
            shutdown.cancelled().await;
            Ok(())
        }
    }

    async fn wait_until_ready(ready: &AtomicBool) {
        for _ in 0..100 {
            if ready.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("controller never became ready");
    }

    #[tokio::test]
    async fn test_reconciles_then_handles_deletions() {
        let client = Arc::new(RecordingClient::new());
        let metrics = ReaperMetrics::new().unwrap();
        let controller =
            Arc::new(Controller::new(ControllerConfig::default(), client.clone(), metrics).unwrap());
        let source = Arc::new(ScriptedSource {
            nodes: vec!["node-a", "node-b"],
            claims: vec![("orphan", "node-gone"), ("data-a", "node-a"), ("data-b", "node-b")],
            deletions: vec!["node-a"],
        });

        let shutdown = CancellationToken::new();
        let ready = controller.ready_flag();
        let running = {
            let controller = controller.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { controller.run(source, shutdown).await })
        };

        wait_until_ready(&ready).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.cancel();
        assert_ok!(running.await.unwrap());

        assert_eq!(
            client.sorted_calls(),
            vec![DeleteCall::claim("ns1", "data-a"), DeleteCall::claim("ns1", "orphan")]
        );
        assert!(!ready.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_sync_timeout_is_fatal() {
        let config = ControllerConfig {
            sync_timeout_secs: 1,
            ..Default::default()
        };
        let client = Arc::new(RecordingClient::new());
        let controller = Controller::new(config, client, ReaperMetrics::new().unwrap()).unwrap();

        let result = controller
            .run(Arc::new(SilentSource), CancellationToken::new())
            .await;

        assert_matches!(result, Err(Error::CacheSyncTimeout { .. }));
        assert!(!controller.ready_flag().load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_shutdown_before_sync() {
        let client = Arc::new(RecordingClient::new());
        let metrics = ReaperMetrics::new().unwrap();
        let controller = Controller::new(ControllerConfig::default(), client, metrics).unwrap();

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        assert_ok!(controller.run(Arc::new(SilentSource), shutdown).await);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ControllerConfig {
            max_concurrent_deletes: 0,
            ..Default::default()
        };
        let client = Arc::new(RecordingClient::new());
        assert_matches!(
            Controller::new(config, client, ReaperMetrics::new().unwrap()),
            Err(Error::Configuration(_))
        );
    }

    #[test]
    fn test_debug_output_shows_readiness() {
        let client = Arc::new(RecordingClient::new());
        let metrics = ReaperMetrics::new().unwrap();
        let controller = Controller::new(ControllerConfig::default(), client, metrics).unwrap();

        let rendered = format!("{:?}", controller);
        assert!(rendered.starts_with("Controller {"));
        assert!(rendered.contains("EventDispatcher"));
        assert!(rendered.contains("ready: false"));
    }
}
