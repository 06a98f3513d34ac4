//! swarmlet-runtime — the container runtime adapter.
//!
//! The core talks to the container engine only through the
//! [`ContainerRuntime`] trait: create/start/stop/remove/inspect/pull by
//! id, logs retrieval, and per-container DNS injection. `PodmanRuntime`
//! implements it against the Podman libpod REST API over a Unix socket;
//! `StubRuntime` is an in-memory stand-in for tests and for running an
//! agent without a container engine.

pub mod podman;
pub mod stub;

use async_trait::async_trait;
use thiserror::Error;

use swarmlet_state::{Pod, PodState};

pub use podman::PodmanRuntime;
pub use stub::StubRuntime;

/// Result type alias for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors that can occur while driving the container engine.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    #[error("bad request: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("runtime api error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("container not found: {0}")]
    NotFound(String),

    #[error("invalid runtime response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Seconds a container gets to stop before it is force-removed.
pub const STOP_GRACE_SECS: u32 = 10;

/// The interface the core consumes to realize pods as containers.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a container for the pod. Returns the runtime container id.
    async fn create(&self, pod: &Pod) -> RuntimeResult<String>;

    /// Start a created container.
    async fn start(&self, id: &str) -> RuntimeResult<()>;

    /// Stop a container with the standard grace period.
    async fn stop(&self, id: &str) -> RuntimeResult<()>;

    /// Remove a container, forcing if still running.
    async fn remove(&self, id: &str) -> RuntimeResult<()>;

    /// Observe the container's lifecycle state.
    async fn state(&self, id: &str) -> RuntimeResult<PodState>;

    /// Pull an image by reference.
    async fn pull(&self, image: &str) -> RuntimeResult<()>;

    /// Fetch container logs (stdout + stderr).
    async fn logs(&self, id: &str, tail: Option<u32>) -> RuntimeResult<String>;

    /// Set the DNS server injected into every container created after
    /// this call.
    fn set_dns(&self, ip: &str);
}
