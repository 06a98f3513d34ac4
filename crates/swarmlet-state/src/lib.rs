//! swarmlet-state — declared cluster state for swarmlet.
//!
//! Owns the authoritative record of deployments, services, ingresses
//! and pods. The full state is one JSON snapshot, persisted atomically
//! (tmp-write + rename) on every mutation, broadcast periodically to
//! peers, and merged last-writer-wins per entity.
//!
//! The `Store` is `Send + Sync` (one `RwLock` over all entity maps) and
//! is shared across async tasks behind an `Arc`.

pub mod error;
pub mod store;
pub mod sync;
pub mod types;

pub use error::{StoreError, StoreResult};
pub use store::Store;
pub use sync::{StateSyncMessage, MSG_STATE_REQUEST, MSG_STATE_SYNC};
pub use types::*;
