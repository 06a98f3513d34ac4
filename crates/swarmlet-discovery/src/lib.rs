//! swarmlet-discovery — the replicated service endpoint registry.
//!
//! An eventually-consistent map from `(service, namespace)` to healthy
//! endpoints, maintained by gossip updates and TTL-based liveness. DNS
//! and the ingress proxy read it through the same filtered paths.

pub mod error;
pub mod registry;

pub use error::{DiscoveryError, DiscoveryResult};
pub use registry::{
    ClusterHandle, ServiceEndpoint, ServiceRegistry, ServiceUpdate, FRESHNESS_WINDOW,
    MSG_SERVICE_UPDATE, SWEEP_INTERVAL,
};
