//! swarmlet-workload — apply/delete controllers and startup recovery.
//!
//! Translates declared state into runtime operations on the local node
//! and keeps the endpoint registry in step with what is running here.

pub mod controller;
pub mod recovery;

pub use controller::{WorkloadController, WorkloadError, WorkloadResult};
pub use recovery::{RecoveryStats, RECOVERY_DELAY};
