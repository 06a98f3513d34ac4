//! swarmlet-cluster — peer membership and the encrypted gossip bus.
//!
//! Nodes form a full mesh over one UDP socket and one TCP listener per
//! agent. The crate owns the node roster (join, leave, failure
//! detection), join-token authorization, and best-effort delivery of
//! application payloads sealed with AES-256-GCM.
//!
//! Higher layers see three narrow capabilities: `broadcast(bytes)`,
//! `local_address()` and `set_message_handler(fn)` — the registry and
//! the store never reach into the roster directly.

pub mod encryption;
pub mod error;
pub mod membership;
pub mod tls;
pub mod token;

pub use encryption::Encryptor;
pub use error::{ClusterError, ClusterResult};
pub use membership::{Cluster, ClusterConfig, MessageHandler};
pub use tls::{TlsFiles, TlsMaterial};
pub use token::{JoinToken, TokenManager};
