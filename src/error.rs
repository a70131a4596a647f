//! Error types for the Local Volume Reaper
//!
//! Provides structured error types for the cleanup engine, the snapshot and
//! its watchers, and process configuration.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the controller
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Watch stream error: {0}")]
    Watch(#[from] kube::runtime::watcher::Error),

    #[error("Delete of {kind} {name} timed out after {duration:?}")]
    DeleteTimeout {
        kind: String,
        name: String,
        duration: Duration,
    },

    // =========================================================================
    // Snapshot Errors
    // =========================================================================
    #[error("Snapshot of {kind} has not completed its initial sync")]
    SnapshotNotSynced { kind: String },

    #[error("Initial cache sync did not complete within {timeout:?}; pending: {pending}")]
    CacheSyncTimeout { timeout: Duration, pending: String },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take when a call fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Retry the same idempotent call with exponential backoff
    RetryWithBackoff,
    /// Give up, the failure will not go away on its own
    GiveUp,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        if self.is_transient() {
            ErrorAction::RetryWithBackoff
        } else {
            ErrorAction::GiveUp
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self.action(), ErrorAction::RetryWithBackoff)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        match self {
            // Server-side trouble and throttling clear up; client mistakes don't
            Error::Kube(kube::Error::Api(response)) => {
                response.code >= 500 || response.code == 429
            }
            Error::Kube(kube::Error::HyperError(_)) | Error::Kube(kube::Error::Service(_)) => {
                true
            }
            Error::DeleteTimeout { .. } | Error::Watch(_) => true,
            _ => false,
        }
    }

    /// Check if this error is a 404 from the API server
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(response)) if response.code == 404)
    }
}

/// Result type alias for the controller
pub type Result<T> = std::result::Result<T, Error>;
