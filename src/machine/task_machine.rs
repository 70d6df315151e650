//! Per-task state machine
//!
//! Machines are transient: reconstructed from the store for each transaction,
//! never persisted. A machine validates one transition at a time and emits
//! work commands into the transaction's deferred queue; it performs no
//! mutation itself.

use tracing::{debug, warn};

use super::work::{TaskMutation, WorkCommand, WorkEntry, WorkQueue};
use crate::domain::{ScheduledTask, ScheduleStatus};

use ScheduleStatus::*;

/// State machine for a single task.
pub struct TaskStateMachine {
    task_id: String,
    /// The stored record, absent when the machine represents a task the
    /// store does not know. Unknown-task machines exist only to emit
    /// corrective kills for spurious status updates.
    task: Option<ScheduledTask>,
    /// Whether an update is registered for the task's job, fixed at
    /// construction within the enclosing transaction.
    update_in_progress: bool,
    state: ScheduleStatus,
    previous: ScheduleStatus,
}

impl TaskStateMachine {
    /// Machine for a stored task, starting from the given state.
    pub fn new(task: ScheduledTask, initial_state: ScheduleStatus, update_in_progress: bool) -> Self {
        Self {
            task_id: task.task_id().to_string(),
            task: Some(task),
            update_in_progress,
            state: initial_state,
            previous: initial_state,
        }
    }

    /// Machine for a task id the store has no record of.
    pub fn for_unknown_task(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            task: None,
            update_in_progress: false,
            state: Init,
            previous: Init,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn state(&self) -> ScheduleStatus {
        self.state
    }

    pub fn previous_state(&self) -> ScheduleStatus {
        self.previous
    }

    /// Attempt to advance the machine to `target`, emitting work into `sink`.
    ///
    /// Returns true when the transition was accepted. A transition to the
    /// current state is refused, but when it carries an audit message an
    /// audit-only event append is emitted. Illegal transitions are logged and
    /// refused; they are never fatal.
    pub fn update_state(
        &mut self,
        target: ScheduleStatus,
        audit_message: Option<String>,
        mutation: Option<TaskMutation>,
        sink: &mut WorkQueue,
    ) -> bool {
        if target == self.state {
            if audit_message.is_some() {
                // Same-state audit: append the event, change nothing else.
                sink.push(
                    WorkEntry::new(WorkCommand::UpdateState, &self.task_id, target, self.state)
                        .with_audit(audit_message),
                );
            }
            return false;
        }

        if !self.is_legal_transition(target) {
            warn!(
                task_id = %self.task_id,
                from = %self.state,
                to = %target,
                "illegal state transition refused"
            );
            return false;
        }

        debug!(task_id = %self.task_id, from = %self.state, to = %target, "transition");

        match target {
            Pending | Assigned | Starting | Running => {
                self.emit_update_state(target, audit_message, mutation, sink);
            }

            Killing | Updating | Rollback | Restarting | Preempting => {
                // The current instance must die before anything replaces it.
                sink.push(WorkEntry::new(WorkCommand::Kill, &self.task_id, target, self.state));
                self.emit_update_state(target, audit_message, mutation, sink);
            }

            Failed | Finished | Killed | Lost => {
                if target == Failed {
                    sink.push(WorkEntry::new(
                        WorkCommand::IncrementFailures,
                        &self.task_id,
                        target,
                        self.state,
                    ));
                }
                if let Some(command) = self.reschedule_command(target) {
                    sink.push(WorkEntry::new(command, &self.task_id, target, self.state));
                }
                self.emit_update_state(target, audit_message, mutation, sink);
            }

            Unknown => {
                if self.task.is_none() {
                    // Spurious status update: silence the framework.
                    sink.push(WorkEntry::new(WorkCommand::Kill, &self.task_id, target, self.state));
                } else {
                    // Garbage collection of a terminal record.
                    sink.push(WorkEntry::new(WorkCommand::Delete, &self.task_id, target, self.state));
                }
            }

            Init => unreachable!("INIT is never a legal transition target"),
        }

        self.previous = self.state;
        self.state = target;
        true
    }

    /// The follow-up command a terminal transition warrants, if any.
    fn reschedule_command(&self, target: ScheduleStatus) -> Option<WorkCommand> {
        match self.state {
            // A user-requested kill is final.
            Killing => None,

            // Mid-update tasks are replaced with the update's target config.
            Updating => Some(WorkCommand::Update),
            Rollback => Some(WorkCommand::Rollback),

            // Restarts and preemptions always replace the instance.
            Restarting | Preempting => Some(WorkCommand::Reschedule),

            // Organic terminal transitions consult the task's policy.
            _ => {
                let config = self.task.as_ref()?.config();
                let wants_reschedule = match target {
                    Lost => true,
                    Finished | Killed => config.is_service,
                    Failed => {
                        let task = self.task.as_ref()?;
                        config.max_task_failures < 0
                            || task.failure_count + 1 < config.max_task_failures
                    }
                    _ => false,
                };
                if !wants_reschedule {
                    None
                } else if self.update_in_progress {
                    // A registered update owns this shard's future config.
                    Some(WorkCommand::Update)
                } else {
                    Some(WorkCommand::Reschedule)
                }
            }
        }
    }

    fn emit_update_state(
        &self,
        target: ScheduleStatus,
        audit_message: Option<String>,
        mutation: Option<TaskMutation>,
        sink: &mut WorkQueue,
    ) {
        sink.push(
            WorkEntry::new(WorkCommand::UpdateState, &self.task_id, target, self.state)
                .with_audit(audit_message)
                .with_mutation(mutation),
        );
    }

    fn is_legal_transition(&self, target: ScheduleStatus) -> bool {
        match (self.state, target) {
            (Init, Pending) => true,
            (Init, Unknown) => self.task.is_none(),

            (Pending, Assigned) => true,
            (Pending, Killing | Updating | Rollback | Restarting | Preempting | Lost) => true,

            (Assigned | Starting | Running, next) => matches!(
                next,
                Starting
                    | Running
                    | Finished
                    | Failed
                    | Killed
                    | Lost
                    | Killing
                    | Updating
                    | Rollback
                    | Restarting
                    | Preempting
            ) && legal_progression(self.state, next),

            (Killing, Finished | Failed | Killed | Lost) => true,

            // An in-flight update may be redirected into a rollback (and back)
            // while the instance is still dying.
            (Updating | Rollback, next) => {
                matches!(next, Finished | Failed | Killed | Lost | Killing | Updating | Rollback)
            }

            (Restarting | Preempting, next) => {
                matches!(next, Finished | Failed | Killed | Lost | Killing)
            }

            // Terminal records only leave via garbage collection.
            (Failed | Finished | Killed | Lost, Unknown) => self.task.is_some(),

            _ => false,
        }
    }
}

/// Forward progress only within ASSIGNED -> STARTING -> RUNNING.
fn legal_progression(from: ScheduleStatus, to: ScheduleStatus) -> bool {
    match to {
        Starting => from == Assigned,
        Running => matches!(from, Assigned | Starting),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskConfig;

    fn config(is_service: bool, max_failures: i32) -> TaskConfig {
        TaskConfig {
            role: "ops".to_string(),
            environment: "prod".to_string(),
            job_name: "web".to_string(),
            shard_id: 0,
            requested_ports: Default::default(),
            resources: Default::default(),
            constraints: Vec::new(),
            is_service,
            max_task_failures: max_failures,
            executor_config: serde_json::Value::Null,
        }
    }

    fn machine(status: ScheduleStatus, is_service: bool, max_failures: i32) -> TaskStateMachine {
        let mut task = ScheduledTask::new("t-0", config(is_service, max_failures));
        task.status = status;
        TaskStateMachine::new(task, status, false)
    }

    fn drain(sink: &mut WorkQueue) -> Vec<WorkCommand> {
        std::iter::from_fn(|| sink.pop()).map(|e| e.command).collect()
    }

    #[test]
    fn test_init_to_pending_emits_update_state() {
        let mut sink = WorkQueue::default();
        let mut m = machine(Init, false, 0);
        assert!(m.update_state(Pending, None, None, &mut sink));
        assert_eq!(drain(&mut sink), vec![WorkCommand::UpdateState]);
        assert_eq!(m.state(), Pending);
        assert_eq!(m.previous_state(), Init);
    }

    #[test]
    fn test_same_state_is_noop_without_audit() {
        let mut sink = WorkQueue::default();
        let mut m = machine(Running, false, 0);
        assert!(!m.update_state(Running, None, None, &mut sink));
        assert!(sink.is_empty());
    }

    #[test]
    fn test_same_state_with_audit_appends_event_only() {
        let mut sink = WorkQueue::default();
        let mut m = machine(Running, false, 0);
        assert!(!m.update_state(Running, Some("checked".to_string()), None, &mut sink));
        let entry = sink.pop().unwrap();
        assert_eq!(entry.command, WorkCommand::UpdateState);
        assert_eq!(entry.new_status, Running);
        assert_eq!(entry.previous_status, Running);
        assert_eq!(entry.audit_message.as_deref(), Some("checked"));
        assert!(sink.is_empty());
    }

    #[test]
    fn test_illegal_transition_refused() {
        let mut sink = WorkQueue::default();
        let mut m = machine(Finished, false, 0);
        assert!(!m.update_state(Running, None, None, &mut sink));
        assert!(sink.is_empty());
        assert_eq!(m.state(), Finished);

        let mut m = machine(Running, false, 0);
        assert!(!m.update_state(Pending, None, None, &mut sink));
        assert!(sink.is_empty());
    }

    #[test]
    fn test_killing_emits_kill_and_update_state() {
        let mut sink = WorkQueue::default();
        let mut m = machine(Running, false, 0);
        assert!(m.update_state(Killing, Some("Killed by alice".to_string()), None, &mut sink));
        assert_eq!(drain(&mut sink), vec![WorkCommand::Kill, WorkCommand::UpdateState]);
    }

    #[test]
    fn test_killing_to_killed_never_reschedules() {
        let mut sink = WorkQueue::default();
        let mut m = machine(Killing, true, -1);
        assert!(m.update_state(Killed, None, None, &mut sink));
        assert_eq!(drain(&mut sink), vec![WorkCommand::UpdateState]);
    }

    #[test]
    fn test_service_finished_reschedules() {
        let mut sink = WorkQueue::default();
        let mut m = machine(Running, true, 0);
        assert!(m.update_state(Finished, None, None, &mut sink));
        assert_eq!(drain(&mut sink), vec![WorkCommand::Reschedule, WorkCommand::UpdateState]);
    }

    #[test]
    fn test_non_service_finished_does_not_reschedule() {
        let mut sink = WorkQueue::default();
        let mut m = machine(Running, false, 0);
        assert!(m.update_state(Finished, None, None, &mut sink));
        assert_eq!(drain(&mut sink), vec![WorkCommand::UpdateState]);
    }

    #[test]
    fn test_lost_always_reschedules() {
        let mut sink = WorkQueue::default();
        let mut m = machine(Assigned, false, 1);
        assert!(m.update_state(Lost, None, None, &mut sink));
        assert_eq!(drain(&mut sink), vec![WorkCommand::Reschedule, WorkCommand::UpdateState]);
    }

    #[test]
    fn test_failed_increments_and_respects_failure_budget() {
        // Budget of 2: first failure reschedules.
        let mut sink = WorkQueue::default();
        let mut m = machine(Running, false, 2);
        assert!(m.update_state(Failed, None, None, &mut sink));
        assert_eq!(
            drain(&mut sink),
            vec![
                WorkCommand::IncrementFailures,
                WorkCommand::Reschedule,
                WorkCommand::UpdateState
            ]
        );

        // Budget exhausted: failure_count 1, max 2, this is the second failure.
        let mut task = ScheduledTask::new("t-0", config(false, 2));
        task.status = Running;
        task.failure_count = 1;
        let mut m = TaskStateMachine::new(task, Running, false);
        let mut sink = WorkQueue::default();
        assert!(m.update_state(Failed, None, None, &mut sink));
        assert_eq!(
            drain(&mut sink),
            vec![WorkCommand::IncrementFailures, WorkCommand::UpdateState]
        );
    }

    #[test]
    fn test_negative_failure_budget_is_unlimited() {
        let mut task = ScheduledTask::new("t-0", config(false, -1));
        task.status = Running;
        task.failure_count = 1_000;
        let mut m = TaskStateMachine::new(task, Running, false);
        let mut sink = WorkQueue::default();
        assert!(m.update_state(Failed, None, None, &mut sink));
        let commands = drain(&mut sink);
        assert!(commands.contains(&WorkCommand::Reschedule));
    }

    #[test]
    fn test_updating_entry_emits_kill() {
        let mut sink = WorkQueue::default();
        let mut m = machine(Running, true, 0);
        assert!(m.update_state(Updating, Some("Updated by bob".to_string()), None, &mut sink));
        assert_eq!(drain(&mut sink), vec![WorkCommand::Kill, WorkCommand::UpdateState]);
    }

    #[test]
    fn test_updating_terminal_emits_update_work() {
        let mut sink = WorkQueue::default();
        let mut m = machine(Updating, true, 0);
        assert!(m.update_state(Killed, None, None, &mut sink));
        assert_eq!(drain(&mut sink), vec![WorkCommand::Update, WorkCommand::UpdateState]);
    }

    #[test]
    fn test_updating_can_flip_to_rollback() {
        let mut sink = WorkQueue::default();
        let mut m = machine(Updating, true, 0);
        assert!(m.update_state(Rollback, Some("Rolled back by bob".to_string()), None, &mut sink));
        assert_eq!(drain(&mut sink), vec![WorkCommand::Kill, WorkCommand::UpdateState]);
        // Terminal from ROLLBACK now yields rollback work.
        assert!(m.update_state(Killed, None, None, &mut sink));
        assert_eq!(drain(&mut sink), vec![WorkCommand::Rollback, WorkCommand::UpdateState]);
    }

    #[test]
    fn test_rollback_terminal_emits_rollback_work() {
        let mut sink = WorkQueue::default();
        let mut m = machine(Rollback, true, 0);
        assert!(m.update_state(Killed, None, None, &mut sink));
        assert_eq!(drain(&mut sink), vec![WorkCommand::Rollback, WorkCommand::UpdateState]);
    }

    #[test]
    fn test_reschedule_redirected_to_update_when_update_registered() {
        let mut task = ScheduledTask::new("t-0", config(true, 0));
        task.status = Running;
        let mut m = TaskStateMachine::new(task, Running, true);
        let mut sink = WorkQueue::default();
        assert!(m.update_state(Killed, None, None, &mut sink));
        assert_eq!(drain(&mut sink), vec![WorkCommand::Update, WorkCommand::UpdateState]);
    }

    #[test]
    fn test_restarting_terminal_reschedules() {
        let mut sink = WorkQueue::default();
        let mut m = machine(Restarting, false, 0);
        assert!(m.update_state(Killed, None, None, &mut sink));
        assert_eq!(drain(&mut sink), vec![WorkCommand::Reschedule, WorkCommand::UpdateState]);
    }

    #[test]
    fn test_preempting_terminal_reschedules() {
        let mut sink = WorkQueue::default();
        let mut m = machine(Preempting, false, 0);
        assert!(m.update_state(Lost, None, None, &mut sink));
        assert_eq!(drain(&mut sink), vec![WorkCommand::Reschedule, WorkCommand::UpdateState]);
    }

    #[test]
    fn test_unknown_task_machine_emits_kill() {
        let mut sink = WorkQueue::default();
        let mut m = TaskStateMachine::for_unknown_task("ghost-1");
        assert!(m.update_state(Unknown, None, None, &mut sink));
        assert_eq!(drain(&mut sink), vec![WorkCommand::Kill]);
        // Once UNKNOWN, further transitions are refused.
        assert!(!m.update_state(Running, None, None, &mut sink));
        assert!(sink.is_empty());
    }

    #[test]
    fn test_terminal_to_unknown_emits_delete() {
        let mut sink = WorkQueue::default();
        let mut m = machine(Finished, false, 0);
        assert!(m.update_state(Unknown, None, None, &mut sink));
        assert_eq!(drain(&mut sink), vec![WorkCommand::Delete]);
    }

    #[test]
    fn test_active_to_unknown_is_illegal() {
        let mut sink = WorkQueue::default();
        let mut m = machine(Running, false, 0);
        assert!(!m.update_state(Unknown, None, None, &mut sink));
        assert!(sink.is_empty());
    }

    #[test]
    fn test_full_lifecycle_progression() {
        let mut sink = WorkQueue::default();
        let mut m = machine(Init, false, 0);
        for next in [Pending, Assigned, Starting, Running, Finished] {
            assert!(m.update_state(next, None, None, &mut sink), "step to {next}");
        }
        assert_eq!(m.state(), Finished);
        assert_eq!(m.previous_state(), Running);
        // Skipping STARTING is allowed; skipping ASSIGNED is not.
        let mut m = machine(Assigned, false, 0);
        assert!(m.update_state(Running, None, None, &mut sink));
        let mut m = machine(Pending, false, 0);
        assert!(!m.update_state(Running, None, None, &mut sink));
    }
}
