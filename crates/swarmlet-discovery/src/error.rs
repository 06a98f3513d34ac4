//! Error types for the service registry.

use thiserror::Error;

/// Result type alias for registry operations.
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Errors that can occur in the service registry.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("service not found: {0}")]
    NotFound(String),

    #[error("no healthy instances for service {0}")]
    NoHealthyEndpoints(String),

    #[error("malformed service update: {0}")]
    Malformed(#[from] serde_json::Error),
}
