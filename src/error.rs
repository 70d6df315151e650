//! Error taxonomy for the scheduler core
//!
//! Every precondition failure is a typed error checked inside the transaction
//! that would have applied the mutation, so checks and mutations are atomic.

use thiserror::Error;

/// Rolling-update precondition violations. Surfaced to callers as
/// `INVALID_REQUEST`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UpdateError {
    #[error("No active tasks found for job {0}")]
    NoActiveTasks(String),

    #[error("Update already in progress for {0}")]
    UpdateInProgress(String),

    #[error("Unable to proceed until UPDATING and ROLLBACK tasks complete for {0}")]
    TasksBusy(String),

    #[error("No active update found for {0}")]
    UnknownUpdate(String),

    #[error("Invalid update token for {0}")]
    InvalidToken(String),

    #[error("Cannot update unrecognized shards {0:?}")]
    UnrecognizedShards(Vec<u32>),
}

/// Placement or job-lifecycle policy violations. Surfaced as `INVALID_REQUEST`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("Job {0} already has active tasks")]
    JobExists(String),

    #[error("No tasks matched query")]
    NoTasksMatched,

    #[error("Not all requested shards are active")]
    ShardsNotActive,

    #[error("Invalid job name: '{0}'")]
    InvalidJobName(String),

    #[error("Insufficient ports offered: requested {requested}, offered {offered}")]
    InsufficientPorts { requested: usize, offered: usize },
}

/// Underlying store failure. Aborts the enclosing transaction; no side effects
/// escape.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Storage failure: {0}")]
pub struct StorageError(pub String);

/// Session authentication failure, caught at the admin boundary.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Authentication failed: {0}")]
pub struct AuthError(pub String);
