//! Error types for the swarmlet cluster layer.

use thiserror::Error;

/// Result type alias for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors that can occur in membership and the message bus.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encrypt message")]
    Encrypt,

    #[error("failed to decrypt message")]
    Decrypt,

    #[error("invalid join token")]
    InvalidToken,

    #[error("join rejected by seed {0}")]
    JoinRejected(String),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("tls error: {0}")]
    Tls(String),
}
