//! Task records
//!
//! `ScheduledTask` is the unit of persistence: the declared configuration of
//! one shard of a job, its placement once assigned, and the audit trail of
//! every status it has passed through.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::attribute::TaskConstraint;
use super::status::ScheduleStatus;

/// Job ownership principal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    /// Role the job belongs to.
    pub role: String,
    /// Acting user, recorded in audit messages.
    pub user: String,
}

impl Identity {
    pub fn new(role: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            user: user.into(),
        }
    }
}

/// Resources requested by a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    pub num_cpus: f64,
    pub ram_mb: u64,
    pub disk_mb: u64,
}

/// Declared configuration of one shard of a job.
///
/// Two tasks with equal configs are "unchanged" for rolling-update purposes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Owning role.
    pub role: String,

    /// Deployment environment (e.g. "prod", "devel").
    pub environment: String,

    /// Job this shard belongs to.
    pub job_name: String,

    /// Index of this shard within the job. Stable across reschedules.
    pub shard_id: u32,

    /// Named ports the task wants bound. Names map to concrete port numbers
    /// at assignment.
    #[serde(default)]
    pub requested_ports: BTreeSet<String>,

    /// Requested resources.
    #[serde(default)]
    pub resources: Resources,

    /// Placement constraints evaluated against host attributes.
    #[serde(default)]
    pub constraints: Vec<TaskConstraint>,

    /// Service-style tasks are rescheduled when they exit.
    #[serde(default)]
    pub is_service: bool,

    /// Failure budget before the task stops being rescheduled on FAILED.
    /// Negative means unlimited.
    #[serde(default)]
    pub max_task_failures: i32,

    /// Opaque executor payload, carried through untouched.
    #[serde(default)]
    pub executor_config: serde_json::Value,
}

impl TaskConfig {
    /// Key of the job this config belongs to, `role/job`.
    pub fn job_key(&self) -> String {
        format!("{}/{}", self.role, self.job_name)
    }
}

/// Configuration plus placement for a task.
///
/// `slave_id`, `slave_host` and `assigned_ports` are populated when the task
/// reaches ASSIGNED and cleared on reschedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignedTask {
    /// Globally unique task id.
    pub task_id: String,

    /// The declared configuration.
    pub task: TaskConfig,

    /// Id of the host this task was assigned to.
    pub slave_id: Option<String>,

    /// Hostname this task was assigned to.
    pub slave_host: Option<String>,

    /// Concrete port bindings, name to port number.
    #[serde(default)]
    pub assigned_ports: BTreeMap<String, u16>,
}

/// One entry in a task's audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEvent {
    /// Epoch milliseconds when the transition was applied.
    pub timestamp: i64,

    /// Status the task entered.
    pub status: ScheduleStatus,

    /// Audit message, when the transition carried one.
    pub message: Option<String>,
}

/// A task as owned by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    /// Current status.
    pub status: ScheduleStatus,

    /// Configuration and placement.
    pub assigned_task: AssignedTask,

    /// Times this shard has FAILED, carried across reschedules.
    #[serde(default)]
    pub failure_count: i32,

    /// Task id of the predecessor when this task was created by a reschedule.
    #[serde(default)]
    pub ancestor_id: Option<String>,

    /// Ordered audit log, appended on every effective transition.
    #[serde(default)]
    pub task_events: Vec<TaskEvent>,
}

impl ScheduledTask {
    /// A freshly declared task: status INIT, no placement, empty audit log.
    pub fn new(task_id: impl Into<String>, config: TaskConfig) -> Self {
        Self {
            status: ScheduleStatus::Init,
            assigned_task: AssignedTask {
                task_id: task_id.into(),
                task: config,
                slave_id: None,
                slave_host: None,
                assigned_ports: BTreeMap::new(),
            },
            failure_count: 0,
            ancestor_id: None,
            task_events: Vec::new(),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.assigned_task.task_id
    }

    pub fn config(&self) -> &TaskConfig {
        &self.assigned_task.task
    }

    pub fn role(&self) -> &str {
        &self.assigned_task.task.role
    }

    pub fn job_name(&self) -> &str {
        &self.assigned_task.task.job_name
    }

    pub fn shard_id(&self) -> u32 {
        self.assigned_task.task.shard_id
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}
