//! Controller - node deletion handling and startup reconciliation
//!
//! ```text
//!   watch source ──▶ snapshot ──▶ dispatcher ──▶ cleanup engine ──▶ cluster client
//!                        │                            ▲
//!                        └────── reconciler ──────────┘
//! ```

pub mod cleanup;
pub mod config;
pub mod dispatcher;
pub mod reconciler;
pub mod runtime;

pub use cleanup::{ClaimReport, CleanupEngine, CleanupReport};
pub use config::{ClaimResolution, ControllerConfig};
pub use dispatcher::EventDispatcher;
pub use reconciler::{ReconcileSummary, StartupReconciler};
pub use runtime::{Controller, WatchSource};
