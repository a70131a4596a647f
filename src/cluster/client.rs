//! Kubernetes Cluster Client
//!
//! [`ClusterClient`] over the API server. Every delete carries a deadline,
//! transient failures are retried with exponential backoff, and a 404 is
//! reported as [`DeleteOutcome::AlreadyGone`].

use crate::controller::ControllerConfig;
use crate::domain::{ClusterClient, DeleteOutcome, ObjectKey, ResourceKind};
use crate::error::{Error, Result};
use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use kube::api::{Api, DeleteParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// Build a client from an explicit kubeconfig, or from the in-cluster
/// environment and default kubeconfig lookup when `kubeconfig` is `None`.
pub async fn connect(kubeconfig: Option<&Path>) -> Result<Client> {
    let Some(path) = kubeconfig else {
        return Ok(Client::try_default().await?);
    };

    let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
        Error::Configuration(format!("cannot read kubeconfig {}: {}", path.display(), e))
    })?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| {
            Error::Configuration(format!("invalid kubeconfig {}: {}", path.display(), e))
        })?;
    Ok(Client::try_from(config)?)
}

/// API server backed delete calls
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
    delete_timeout: Duration,
    retry_max_elapsed: Duration,
}

impl KubeClusterClient {
    pub fn new(client: Client, config: &ControllerConfig) -> Self {
        Self {
            client,
            delete_timeout: config.delete_timeout(),
            retry_max_elapsed: config.delete_retry_max_elapsed(),
        }
    }

    async fn delete<K>(&self, api: Api<K>, kind: ResourceKind, name: &str) -> Result<DeleteOutcome>
    where
        K: kube::Resource + Clone + DeserializeOwned + Debug,
    {
        if self.retry_max_elapsed.is_zero() {
            return delete_once(&api, kind, name, self.delete_timeout).await;
        }

        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(500))
            .with_max_interval(Duration::from_secs(10))
            .with_max_elapsed_time(Some(self.retry_max_elapsed))
            .build();
        let api = &api;
        let timeout = self.delete_timeout;

        backoff::future::retry_notify(
            policy,
            move || async move {
                delete_once(api, kind, name, timeout).await.map_err(|e| {
                    if e.is_retryable() {
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            },
            |e: Error, wait: Duration| {
                warn!("Delete of {} {} failed, retrying in {:?}: {}", kind, name, wait, e)
            },
        )
        .await
    }
}

/// One delete call bounded by `timeout`
async fn delete_once<K>(
    api: &Api<K>,
    kind: ResourceKind,
    name: &str,
    timeout: Duration,
) -> Result<DeleteOutcome>
where
    K: kube::Resource + Clone + DeserializeOwned + Debug,
{
    match tokio::time::timeout(timeout, api.delete(name, &DeleteParams::default())).await {
        Err(_) => Err(Error::DeleteTimeout {
            kind: kind.to_string(),
            name: name.to_string(),
            duration: timeout,
        }),
        Ok(Ok(_)) => Ok(DeleteOutcome::Deleted),
        Ok(Err(e)) => match Error::from(e) {
            e if e.is_not_found() => {
                debug!("{} {} not found (already deleted)", kind, name);
                Ok(DeleteOutcome::AlreadyGone)
            }
            e => Err(e),
        },
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn delete_claim(&self, claim: &ObjectKey) -> Result<DeleteOutcome> {
        let api: Api<PersistentVolumeClaim> =
            Api::namespaced(self.client.clone(), &claim.namespace);
        self.delete(api, ResourceKind::PersistentVolumeClaim, &claim.name)
            .await
    }

    async fn delete_volume(&self, name: &str) -> Result<DeleteOutcome> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        self.delete(api, ResourceKind::PersistentVolume, name).await
    }

    async fn delete_pod(&self, pod: &ObjectKey) -> Result<DeleteOutcome> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);
        self.delete(api, ResourceKind::Pod, &pod.name).await
    }
}
