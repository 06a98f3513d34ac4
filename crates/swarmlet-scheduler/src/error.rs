//! Error types for the scheduler.

use thiserror::Error;

/// Result type alias for scheduling operations.
pub type ScheduleResult<T> = Result<T, ScheduleError>;

/// Errors that can occur while assigning pods to nodes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("no nodes available")]
    NoNodes,

    #[error("no node matches selector")]
    NoSelectorMatch,
}
