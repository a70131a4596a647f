//! Resource Watcher
//!
//! Runs one `kube` watcher per resource kind and applies every event to the
//! [`ClusterSnapshot`]. Nodes that leave the snapshot, by deletion or by
//! disappearing across a relist, are reported to the [`NodeRemovedHandler`].

use crate::controller::WatchSource;
use crate::domain::{NodeRemovedHandler, ResourceKind};
use crate::error::{Error, Result};
use crate::snapshot::ClusterSnapshot;
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, PersistentVolume, PersistentVolumeClaim, Pod};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Watches Nodes, PersistentVolumeClaims, PersistentVolumes and Pods
/// cluster-wide
pub struct ResourceWatcher {
    client: Client,
}

impl ResourceWatcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WatchSource for ResourceWatcher {
    async fn run(
        &self,
        snapshot: Arc<ClusterSnapshot>,
        handler: Arc<dyn NodeRemovedHandler>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let nodes = {
            let snapshot = snapshot.clone();
            watch_kind(
                Api::<Node>::all(self.client.clone()),
                ResourceKind::Node,
                shutdown.clone(),
                move |event| {
                    for node_name in snapshot.apply_node_event(event) {
                        handler.on_node_removed(&node_name);
                    }
                },
            )
        };
        let claims = {
            let snapshot = snapshot.clone();
            watch_kind(
                Api::<PersistentVolumeClaim>::all(self.client.clone()),
                ResourceKind::PersistentVolumeClaim,
                shutdown.clone(),
                move |event| snapshot.apply_claim_event(event),
            )
        };
        let volumes = {
            let snapshot = snapshot.clone();
            watch_kind(
                Api::<PersistentVolume>::all(self.client.clone()),
                ResourceKind::PersistentVolume,
                shutdown.clone(),
                move |event| snapshot.apply_volume_event(event),
            )
        };
        let pods = watch_kind(
            Api::<Pod>::all(self.client.clone()),
            ResourceKind::Pod,
            shutdown,
            move |event| snapshot.apply_pod_event(event),
        );

        tokio::try_join!(nodes, claims, volumes, pods)?;
        Ok(())
    }
}

/// Drive one watcher until `shutdown`. Watch errors are retried with the
/// watcher's default backoff; the stream itself never ends on its own.
async fn watch_kind<K, F>(
    api: Api<K>,
    kind: ResourceKind,
    shutdown: CancellationToken,
    mut apply: F,
) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
    F: FnMut(Event<K>) + Send,
{
    let mut stream = watcher::watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();
    debug!("Watching {}", kind);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Stopped watching {}", kind);
                return Ok(());
            }
            next = stream.next() => match next {
                Some(Ok(event)) => apply(event),
                Some(Err(e)) => warn!("{} watch failed, backing off: {}", kind, Error::Watch(e)),
                None => {
                    return Err(Error::Internal(format!("{} watch stream ended", kind)));
                }
            },
        }
    }
}
