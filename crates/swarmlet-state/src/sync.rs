//! Anti-entropy state synchronization messages.
//!
//! Every node periodically broadcasts its full `ClusterState`; peers
//! merge it last-writer-wins. A lost broadcast is repaired by the next
//! period. The `state_request` variant is decoded and logged but needs
//! no reply — the periodic broadcast already answers it.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StoreResult;
use crate::store::{now_millis, Store};
use crate::types::ClusterState;

/// Message type tag for a full-state broadcast.
pub const MSG_STATE_SYNC: &str = "state_sync";
/// Message type tag for a state request (reserved).
pub const MSG_STATE_REQUEST: &str = "state_request";

/// A state synchronization message exchanged over the cluster bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSyncMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ClusterState>,
    /// Unix millis when the message was built.
    pub timestamp: u64,
    pub node_name: String,
}

impl Store {
    /// Serialize a `state_sync` message carrying the current snapshot.
    pub fn sync_message(&self, node_name: &str) -> StoreResult<Vec<u8>> {
        let msg = StateSyncMessage {
            msg_type: MSG_STATE_SYNC.to_string(),
            state: Some(self.state()),
            timestamp: now_millis(),
            node_name: node_name.to_string(),
        };
        Ok(serde_json::to_vec(&msg)?)
    }

    /// Apply an incoming sync message from a peer.
    ///
    /// Returns whether a merge changed the local state.
    pub fn handle_sync_message(&self, data: &[u8]) -> StoreResult<bool> {
        let msg: StateSyncMessage = serde_json::from_slice(data)?;

        match msg.msg_type.as_str() {
            MSG_STATE_SYNC => {
                if let Some(state) = &msg.state {
                    return Ok(self.merge(state));
                }
                Ok(false)
            }
            MSG_STATE_REQUEST => {
                debug!(node = %msg.node_name, "state request received");
                Ok(false)
            }
            other => {
                debug!(msg_type = other, "ignoring unknown sync message");
                Ok(false)
            }
        }
    }
}
