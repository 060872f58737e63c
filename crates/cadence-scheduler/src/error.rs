use thiserror::Error;

use crate::job::JobId;
use crate::trigger::TriggerError;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A method-style job names a component the resolver cannot produce.
    #[error("Unresolved owner: job {job} requires component {owner_key:?}")]
    UnresolvedOwner { job: JobId, owner_key: String },

    /// The resolved component is not of the type the job method expects.
    #[error("Owner type mismatch: job {job} expects component {owner_key:?} to be a {expected}")]
    OwnerTypeMismatch {
        job: JobId,
        owner_key: String,
        expected: &'static str,
    },

    /// The provided trigger definition is invalid.
    #[error("Invalid trigger: {0}")]
    InvalidTrigger(#[from] TriggerError),

    /// Engine configuration the engine cannot run with.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The engine has shut down and no longer accepts commands.
    #[error("Scheduler engine is not running")]
    EngineStopped,
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
