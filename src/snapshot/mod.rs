//! Snapshot Module
//!
//! Local, incrementally maintained view of the cluster objects the reaper
//! reads, with its secondary indices and initial-sync tracking.

pub mod store;

pub use store::*;
