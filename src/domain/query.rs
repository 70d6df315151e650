//! Structured task queries
//!
//! A `TaskQuery` is a conjunction of optional predicates. The store turns
//! role+job queries into index lookups; everything else is a filter.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::status::ScheduleStatus;
use super::task::ScheduledTask;

/// Conjunction of predicates over task records. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskQuery {
    pub role: Option<String>,
    pub environment: Option<String>,
    pub job_name: Option<String>,
    pub task_ids: Option<BTreeSet<String>>,
    pub statuses: Option<BTreeSet<ScheduleStatus>>,
    pub shard_ids: Option<BTreeSet<u32>>,
    pub slave_host: Option<String>,
}

impl TaskQuery {
    /// Match everything.
    pub fn all() -> Self {
        Self::default()
    }

    /// Match a single task id.
    pub fn by_id(task_id: impl Into<String>) -> Self {
        Self {
            task_ids: Some(BTreeSet::from([task_id.into()])),
            ..Self::default()
        }
    }

    /// Match a set of task ids.
    pub fn by_ids(task_ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            task_ids: Some(task_ids.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Match all tasks of a job.
    pub fn job_scoped(role: impl Into<String>, job_name: impl Into<String>) -> Self {
        Self {
            role: Some(role.into()),
            job_name: Some(job_name.into()),
            ..Self::default()
        }
    }

    /// Match the given shards of a job.
    pub fn shard_scoped(
        role: impl Into<String>,
        job_name: impl Into<String>,
        shard_ids: impl IntoIterator<Item = u32>,
    ) -> Self {
        Self {
            role: Some(role.into()),
            job_name: Some(job_name.into()),
            shard_ids: Some(shard_ids.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Match all tasks owned by a role.
    pub fn role_scoped(role: impl Into<String>) -> Self {
        Self {
            role: Some(role.into()),
            ..Self::default()
        }
    }

    /// Restrict to active statuses.
    pub fn active(mut self) -> Self {
        self.statuses = Some(ScheduleStatus::active_states().iter().copied().collect());
        self
    }

    /// Restrict to the given statuses.
    pub fn by_status(mut self, statuses: impl IntoIterator<Item = ScheduleStatus>) -> Self {
        self.statuses = Some(statuses.into_iter().collect());
        self
    }

    /// Whether `task` satisfies every set predicate.
    pub fn matches(&self, task: &ScheduledTask) -> bool {
        if let Some(role) = &self.role {
            if task.role() != role {
                return false;
            }
        }
        if let Some(env) = &self.environment {
            if &task.config().environment != env {
                return false;
            }
        }
        if let Some(job) = &self.job_name {
            if task.job_name() != job {
                return false;
            }
        }
        if let Some(ids) = &self.task_ids {
            if !ids.contains(task.task_id()) {
                return false;
            }
        }
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&task.status) {
                return false;
            }
        }
        if let Some(shards) = &self.shard_ids {
            if !shards.contains(&task.shard_id()) {
                return false;
            }
        }
        if let Some(host) = &self.slave_host {
            if task.assigned_task.slave_host.as_deref() != Some(host.as_str()) {
                return false;
            }
        }
        true
    }
}
