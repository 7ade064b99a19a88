//! wardend - fleet resilience orchestrator
//!
//! Starts interdependent agents in dependency phases, watches their health,
//! isolates failures behind circuit breakers, predicts failures from health
//! history, recovers agents through escalating tiers and mirrors its metrics
//! to a peer node.

pub mod config;
pub mod error;
pub mod health;
pub mod launcher;
pub mod lifecycle;
pub mod network;
pub mod predictor;
pub mod recovery;
pub mod registry;
pub mod routes;
pub mod scheduler;
pub mod server;
pub mod storage;
pub mod supervisor;

pub use config::WardenConfig;
pub use error::{WardenError, WardenResult};
pub use lifecycle::{StartupOptions, Warden};
