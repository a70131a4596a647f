//! Domain layer - Core types and port definitions
//!
//! This module defines object identities, the ownership filter, and the traits
//! (ports) that cluster adapters implement.

pub mod ownership;
pub mod ports;

pub use ownership::*;
pub use ports::*;
