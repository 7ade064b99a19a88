//! Warden Common - shared types and API schemas for the fleet warden
//!
//! Used by the daemon (`wardend`) to serve its HTTP API and by the operator
//! CLI (`wardenctl`) and the peer node to consume it.

pub mod schemas;
pub mod types;

pub use schemas::*;
pub use types::*;
