//! swarmlet-dns — service discovery over DNS.
//!
//! Serves the cluster zone authoritatively from the endpoint registry
//! (A and SRV, both plain and `.svc` Kubernetes-compatible forms) and
//! forwards everything else through an upstream chain with UDP-first,
//! TCP-fallback exchanges and an optional host whitelist that also
//! validates CNAME targets in upstream answers.

pub mod error;
pub mod server;
pub mod whitelist;

pub use error::{DnsError, DnsResult};
pub use server::{DnsServer, DEFAULT_CLUSTER_DOMAIN, DEFAULT_DNS_PORT};
pub use whitelist::Whitelist;
