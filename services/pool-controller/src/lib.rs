//! vmfleet pool controller.
//!
//! Owns one machine pool and runs its reconciliation loop: fetches the
//! scale-set snapshot, converges tracking records, and correlates each
//! record with its cluster node.

pub mod config;
pub mod controller;

pub use config::Config;
pub use controller::{Controller, ControllerConfig};
