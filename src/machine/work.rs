//! Deferred side-effect work
//!
//! State machines do not touch the store directly; they emit work commands
//! into a transaction-scoped queue which the state manager drains at commit.

use std::collections::VecDeque;

use crate::domain::{ScheduledTask, ScheduleStatus};

/// Mutation applied to a task record while executing `UpdateState` work.
pub type TaskMutation = Box<dyn FnOnce(&mut ScheduledTask) + Send>;

/// Commands a state machine may emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkCommand {
    /// Ask the driver to kill the task. Issued post-commit.
    Kill,
    /// Create a replacement task for this shard with the same configuration.
    Reschedule,
    /// Create a replacement task with the registered update's new config.
    Update,
    /// Create a replacement task with the registered update's old config.
    Rollback,
    /// Persist the machine's transition: status, mutation, audit event.
    UpdateState,
    /// Remove the task record from the store.
    Delete,
    /// Bump the task's failure count.
    IncrementFailures,
}

/// One queued unit of work, tagged with the emitting machine's transition.
pub struct WorkEntry {
    pub command: WorkCommand,
    pub task_id: String,
    pub new_status: ScheduleStatus,
    pub previous_status: ScheduleStatus,
    pub audit_message: Option<String>,
    pub mutation: Option<TaskMutation>,
}

impl WorkEntry {
    pub fn new(
        command: WorkCommand,
        task_id: impl Into<String>,
        new_status: ScheduleStatus,
        previous_status: ScheduleStatus,
    ) -> Self {
        Self {
            command,
            task_id: task_id.into(),
            new_status,
            previous_status,
            audit_message: None,
            mutation: None,
        }
    }

    pub fn with_audit(mut self, message: Option<String>) -> Self {
        self.audit_message = message;
        self
    }

    pub fn with_mutation(mut self, mutation: Option<TaskMutation>) -> Self {
        self.mutation = mutation;
        self
    }
}

impl std::fmt::Debug for WorkEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkEntry")
            .field("command", &self.command)
            .field("task_id", &self.task_id)
            .field("new_status", &self.new_status)
            .field("previous_status", &self.previous_status)
            .field("audit_message", &self.audit_message)
            .field("has_mutation", &self.mutation.is_some())
            .finish()
    }
}

/// Transaction-scoped queue of deferred work.
///
/// `Delete` entries drain strictly after everything else so a transition that
/// both mutates and deletes a task lands the mutation before the record
/// disappears. Order within either class is unspecified.
#[derive(Debug, Default)]
pub struct WorkQueue {
    regular: VecDeque<WorkEntry>,
    deletes: VecDeque<WorkEntry>,
}

impl WorkQueue {
    pub fn push(&mut self, entry: WorkEntry) {
        if entry.command == WorkCommand::Delete {
            self.deletes.push_back(entry);
        } else {
            self.regular.push_back(entry);
        }
    }

    /// Next entry to execute: all non-delete work before any delete.
    pub fn pop(&mut self) -> Option<WorkEntry> {
        self.regular.pop_front().or_else(|| self.deletes.pop_front())
    }

    pub fn is_empty(&self) -> bool {
        self.regular.is_empty() && self.deletes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.regular.len() + self.deletes.len()
    }
}
