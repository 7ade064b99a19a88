//! Peer networking and metrics export

pub mod metrics;
pub mod peers;
pub mod sync;

pub use metrics::FleetMetrics;
pub use peers::{peer_status_of, BackoffConfig, PeerClient, RequestStatus};
pub use sync::{CrossNodeCoordinator, PeerState};
