//! Task lifecycle states

use serde::{Deserialize, Serialize};

/// Status of a scheduled task.
///
/// Tasks move roughly `INIT -> PENDING -> ASSIGNED -> STARTING -> RUNNING`
/// and from there to a terminal state. `UPDATING`, `ROLLBACK`, `KILLING`,
/// `PREEMPTING` and `RESTARTING` are intermediate states in which the current
/// instance is being terminated on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    /// Created but not yet saved with a pending status.
    Init,
    /// Awaiting placement on a host.
    Pending,
    /// Placed on a host, awaiting launch.
    Assigned,
    /// Executor acknowledged the task.
    Starting,
    /// Running on a host.
    Running,
    /// Exited non-zero or was lost by its executor.
    Failed,
    /// Exited zero.
    Finished,
    /// Terminated at the scheduler's request.
    Killed,
    /// Termination requested, awaiting the framework's confirmation.
    Killing,
    /// The host or executor disappeared.
    Lost,
    /// Being terminated to restart in place.
    Restarting,
    /// Being terminated to be replaced with a new configuration.
    Updating,
    /// Being terminated to be replaced with its pre-update configuration.
    Rollback,
    /// Being terminated to free resources for a higher-priority task.
    Preempting,
    /// The store has no record of this task.
    Unknown,
}

impl ScheduleStatus {
    /// True when the task occupies (or will occupy) resources.
    ///
    /// At most one active task may exist per (role, job, shard).
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Pending
                | Self::Assigned
                | Self::Starting
                | Self::Running
                | Self::Updating
                | Self::Rollback
                | Self::Killing
                | Self::Preempting
                | Self::Restarting
        )
    }

    /// True for sink states. Terminal tasks only leave the store via
    /// garbage collection.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Failed | Self::Finished | Self::Killed | Self::Lost | Self::Unknown
        )
    }

    /// All active statuses, for query building.
    pub fn active_states() -> &'static [ScheduleStatus] {
        &[
            Self::Pending,
            Self::Assigned,
            Self::Starting,
            Self::Running,
            Self::Updating,
            Self::Rollback,
            Self::Killing,
            Self::Preempting,
            Self::Restarting,
        ]
    }
}

impl std::fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Init => "INIT",
            Self::Pending => "PENDING",
            Self::Assigned => "ASSIGNED",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Failed => "FAILED",
            Self::Finished => "FINISHED",
            Self::Killed => "KILLED",
            Self::Killing => "KILLING",
            Self::Lost => "LOST",
            Self::Restarting => "RESTARTING",
            Self::Updating => "UPDATING",
            Self::Rollback => "ROLLBACK",
            Self::Preempting => "PREEMPTING",
            Self::Unknown => "UNKNOWN",
        };
        write!(f, "{name}")
    }
}
