//! Error types for the DNS server.

use thiserror::Error;

/// Result type alias for DNS operations.
pub type DnsResult<T> = Result<T, DnsError>;

/// Errors that can occur in the DNS server.
#[derive(Debug, Error)]
pub enum DnsError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("dns protocol error: {0}")]
    Proto(#[from] hickory_proto::error::ProtoError),
}
