use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::JobId;

/// Point-in-time view of one job's running state and counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    /// Human-readable trigger description.
    pub trigger: String,
    /// `None` once the job is retired.
    pub next_fire_at: Option<DateTime<Utc>>,
    /// Executions dispatched and not yet completed.
    pub in_flight: usize,
    /// Highest `in_flight` value ever observed.
    pub peak_in_flight: usize,
    pub max_instances: usize,
    /// Firings handed to the worker pool.
    pub dispatched: u64,
    pub succeeded: u64,
    /// Executions that returned an error or panicked.
    pub failed: u64,
    /// Firings dropped because `max_instances` executions were in flight.
    pub dropped: u64,
    /// Missed firings not run while catching up.
    pub skipped: u64,
    /// Error or panic message of the most recent failed execution.
    pub last_error: Option<String>,
    /// The trigger is exhausted; the job will never fire again.
    pub retired: bool,
}

/// Lifecycle state of the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Running,
    /// Firings are not dispatched; resume applies the catch-up policy.
    Paused,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EngineState::Running => "running",
            EngineState::Paused => "paused",
        };
        write!(f, "{s}")
    }
}

/// Outcome of [`SchedulerHandle::shutdown`](crate::SchedulerHandle::shutdown).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// Every in-flight execution finished within the grace period.
    pub drained: bool,
    /// Executions still running when the grace period ran out.
    pub abandoned: usize,
}
