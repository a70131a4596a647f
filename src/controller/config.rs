//! Controller Configuration
//!
//! Deployment-time settings, fixed at process start. Loaded from an optional
//! YAML file and overridden by command line flags in `main.rs`.

use crate::domain::OwnershipFilter;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// How the cleanup engine finds the claims anchored to a deleted node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClaimResolution {
    /// PVC-by-node index lookup
    #[default]
    Index,
    /// Scan every volume and follow its claimRef
    VolumeScan,
}

impl std::str::FromStr for ClaimResolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "index" => Ok(ClaimResolution::Index),
            "volume-scan" => Ok(ClaimResolution::VolumeScan),
            other => Err(Error::Configuration(format!(
                "unknown claim resolution '{}', expected 'index' or 'volume-scan'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for ClaimResolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClaimResolution::Index => write!(f, "index"),
            ClaimResolution::VolumeScan => write!(f, "volume-scan"),
        }
    }
}

/// Configuration for the reaper
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ControllerConfig {
    /// Annotation keys and the provisioner identity in scope
    #[serde(flatten)]
    pub ownership: OwnershipFilter,
    /// Claim lookup strategy for node cleanups
    pub claim_resolution: ClaimResolution,
    /// Upper bound on claims being cleaned up at once, across all nodes
    pub max_concurrent_deletes: usize,
    /// Deadline for a single delete call
    pub delete_timeout_secs: u64,
    /// Total time a transient delete failure may be retried; 0 disables retries
    pub delete_retry_max_elapsed_secs: u64,
    /// How long to wait for the initial listing of every resource kind
    pub sync_timeout_secs: u64,
    /// How long shutdown waits for in-flight cleanups
    pub shutdown_grace_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            ownership: OwnershipFilter::default(),
            claim_resolution: ClaimResolution::Index,
            max_concurrent_deletes: 16,
            delete_timeout_secs: 30,
            delete_retry_max_elapsed_secs: 60,
            sync_timeout_secs: 300,
            shutdown_grace_secs: 30,
        }
    }
}

impl ControllerConfig {
    /// Load a config file. Missing fields keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: ControllerConfig = serde_yaml::from_str(&raw)?;
        Ok(config)
    }

    /// Reject settings the controller cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.ownership.provisioner_key.is_empty() {
            return Err(Error::Configuration("provisioner-key must not be empty".into()));
        }
        if self.ownership.selected_node_key.is_empty() {
            return Err(Error::Configuration(
                "selected-node-key must not be empty".into(),
            ));
        }
        if self.ownership.expected_provisioner.is_empty() {
            return Err(Error::Configuration(
                "expected-provisioner must not be empty".into(),
            ));
        }
        if self.max_concurrent_deletes == 0 {
            return Err(Error::Configuration(
                "max-concurrent-deletes must be at least 1".into(),
            ));
        }
        if self.delete_timeout_secs == 0 {
            return Err(Error::Configuration(
                "delete-timeout-secs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn delete_timeout(&self) -> Duration {
        Duration::from_secs(self.delete_timeout_secs)
    }

    pub fn delete_retry_max_elapsed(&self) -> Duration {
        Duration::from_secs(self.delete_retry_max_elapsed_secs)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
