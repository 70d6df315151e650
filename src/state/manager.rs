//! StateManager - controller for persisted task state transitions
//!
//! Every mutation runs inside a write transaction: the affected tasks are
//! materialized into state machines, the machines emit work commands into the
//! transaction's deferred queue, and the finalizer drains the queue against
//! the still-open transaction. Driver kills and pub/sub events escape only
//! after commit.

use std::collections::{BTreeMap, BTreeSet};
use std::convert::Infallible;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::domain::{
    generate_task_id, AssignedTask, ScheduledTask, ScheduleStatus, TaskConfig, TaskEvent,
    TaskQuery,
};
use crate::driver::Driver;
use crate::error::ScheduleError;
use crate::events::PubsubEvent;
use crate::machine::{TaskMutation, TaskStateMachine, WorkCommand, WorkEntry};
use crate::storage::{TransactionalStorage, WriteContext};

/// Manager of all persistence-related operations for the scheduler.
///
/// Long-lived and cheap to clone by reference; holds no mutable state of its
/// own. The deferred work queue lives inside each write transaction.
pub struct StateManager {
    storage: Arc<TransactionalStorage>,
    driver: Arc<dyn Driver>,
    clock: Arc<dyn Clock>,
}

impl StateManager {
    pub fn new(
        storage: Arc<TransactionalStorage>,
        driver: Arc<dyn Driver>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            driver,
            clock,
        }
    }

    pub fn storage(&self) -> &Arc<TransactionalStorage> {
        &self.storage
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Run a write transaction whose body cannot fail.
    pub(crate) fn write_quiet<T>(
        &self,
        body: impl FnOnce(&mut WriteContext<'_>) -> T,
    ) -> T {
        let result: Result<T, Infallible> =
            self.write(|ctx| Ok(body(ctx)));
        match result {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    /// Run a write transaction with the work-queue finalizer attached, then
    /// issue any recorded driver kills.
    pub(crate) fn write<T, E>(
        &self,
        body: impl FnOnce(&mut WriteContext<'_>) -> Result<T, E>,
    ) -> Result<T, E> {
        let (value, committed) = self
            .storage
            .write(body, |ctx| self.drain_work_queue(ctx))?;
        for task_id in &committed.kills {
            self.driver.kill_task(task_id);
        }
        Ok(value)
    }

    /// Insert new tasks and drive them to PENDING.
    ///
    /// Returns the generated task ids.
    pub fn insert_tasks(&self, configs: impl IntoIterator<Item = TaskConfig>) -> BTreeSet<String> {
        let configs: Vec<TaskConfig> = configs.into_iter().collect();
        self.write_quiet(|ctx| self.insert_tasks_in_tx(ctx, configs))
    }

    /// Transaction-scoped body of [`insert_tasks`], shared with the update
    /// coordinator.
    pub(crate) fn insert_tasks_in_tx(
        &self,
        ctx: &mut WriteContext<'_>,
        configs: Vec<TaskConfig>,
    ) -> BTreeSet<String> {
        let tasks: Vec<ScheduledTask> = configs
            .into_iter()
            .map(|config| {
                ScheduledTask::new(generate_task_id(self.clock.as_ref(), &config), config)
            })
            .collect();

        let ids: BTreeSet<String> = tasks.iter().map(|t| t.task_id().to_string()).collect();
        info!(count = tasks.len(), "inserting tasks");
        ctx.stores.task_store.save_tasks(tasks.clone());

        for task in tasks {
            let mut machine = self.machine_for_task(ctx, task);
            machine.update_state(ScheduleStatus::Pending, None, None, &mut ctx.effects.work);
        }
        ids
    }

    /// Place a task on a host, populating slave id, hostname, and the
    /// name-to-number port map computed from the task's requested ports.
    pub fn assign_task(
        &self,
        task_id: &str,
        slave_host: &str,
        slave_id: &str,
        offered_ports: BTreeSet<u16>,
    ) -> Result<AssignedTask, ScheduleError> {
        let captured: Arc<Mutex<Option<AssignedTask>>> = Arc::default();

        self.write(|ctx| {
            let task = match ctx.stores.task_store.fetch_task(task_id) {
                Some(task) => task.clone(),
                None => return Err(ScheduleError::NoTasksMatched),
            };
            let port_map = map_ports(&task.config().requested_ports, &offered_ports)?;

            let host = slave_host.to_string();
            let slave = slave_id.to_string();
            let slot = Arc::clone(&captured);
            let mutation: TaskMutation = Box::new(move |task| {
                let assigned = &mut task.assigned_task;
                assigned.assigned_ports = port_map;
                assigned.slave_host = Some(host);
                assigned.slave_id = Some(slave);
                let mut captured = slot.lock().expect("assignment capture poisoned");
                assert!(
                    captured.is_none(),
                    "More than one result was found for an identity query."
                );
                *captured = Some(assigned.clone());
            });

            let mut machine = self.machine_for_stored(ctx, task);
            if !machine.update_state(ScheduleStatus::Assigned, None, Some(mutation), &mut ctx.effects.work)
            {
                return Err(ScheduleError::NoTasksMatched);
            }
            Ok(())
        })?;

        let assigned = captured
            .lock()
            .expect("assignment capture poisoned")
            .take()
            .ok_or(ScheduleError::NoTasksMatched)?;
        Ok(assigned)
    }

    /// Transition every task matching `query` to `new_state`.
    ///
    /// Returns the number of machines that accepted the transition.
    pub fn change_state(
        &self,
        query: &TaskQuery,
        new_state: ScheduleStatus,
        audit_message: Option<String>,
    ) -> usize {
        self.write_quiet(|ctx| self.change_state_in_tx(ctx, query, new_state, audit_message))
    }

    /// Transaction-scoped body of [`change_state`].
    pub(crate) fn change_state_in_tx(
        &self,
        ctx: &mut WriteContext<'_>,
        query: &TaskQuery,
        new_state: ScheduleStatus,
        audit_message: Option<String>,
    ) -> usize {
        // A query naming explicit task ids enumerates them all, so a status
        // update for a task the store does not know builds an unknown-task
        // machine and gets a corrective kill.
        let ids: Vec<String> = match &query.task_ids {
            Some(requested) => requested.iter().cloned().collect(),
            None => ctx.stores.task_store.fetch_task_ids(query),
        };

        let mut accepted = 0;
        for task_id in ids {
            match ctx.stores.task_store.fetch_task(&task_id).cloned() {
                Some(task) if query.matches(&task) => {
                    let mut machine = self.machine_for_stored(ctx, task);
                    if machine.update_state(
                        new_state,
                        audit_message.clone(),
                        None,
                        &mut ctx.effects.work,
                    ) {
                        accepted += 1;
                    }
                }
                Some(_) => {}
                None => {
                    let mut machine = self.unknown_machine(ctx, &task_id);
                    if machine.update_state(
                        new_state,
                        audit_message.clone(),
                        None,
                        &mut ctx.effects.work,
                    ) {
                        accepted += 1;
                    }
                }
            }
        }
        accepted
    }

    /// Read-only query.
    pub fn fetch_tasks(&self, query: &TaskQuery) -> Vec<ScheduledTask> {
        self.storage.read(|stores| stores.task_store.fetch_tasks(query))
    }

    /// Read-only id query.
    pub fn fetch_task_ids(&self, query: &TaskQuery) -> Vec<String> {
        self.storage.read(|stores| stores.task_store.fetch_task_ids(query))
    }

    /// Garbage-collect terminal task records.
    ///
    /// Active tasks named here are refused by their machines and survive.
    pub fn delete_tasks(&self, task_ids: impl IntoIterator<Item = String>) {
        let query = TaskQuery::by_ids(task_ids);
        self.write_quiet(|ctx| {
            self.change_state_in_tx(ctx, &query, ScheduleStatus::Unknown, None)
        });
    }

    /// Restart the named shards by driving their active tasks to RESTARTING.
    ///
    /// Every requested shard must have an active task.
    pub fn restart_shards(
        &self,
        role: &str,
        job_name: &str,
        shards: &BTreeSet<u32>,
        user: &str,
    ) -> Result<usize, ScheduleError> {
        let audit = format!("Restarted by {user}");
        self.write(|ctx| {
            let query = TaskQuery::shard_scoped(role, job_name, shards.iter().copied()).active();
            let active: BTreeSet<u32> = ctx
                .stores
                .task_store
                .fetch_tasks(&query)
                .iter()
                .map(|t| t.shard_id())
                .collect();
            if active.is_empty() {
                return Err(ScheduleError::NoTasksMatched);
            }
            if active != *shards {
                return Err(ScheduleError::ShardsNotActive);
            }
            Ok(self.change_state_in_tx(ctx, &query, ScheduleStatus::Restarting, Some(audit)))
        })
    }

    /// Record the attributes the framework reported for a host.
    pub fn save_host_attributes(
        &self,
        host: &str,
        attributes: impl IntoIterator<Item = crate::domain::Attribute>,
    ) {
        let attributes: Vec<_> = attributes.into_iter().collect();
        self.write_quiet(move |ctx| {
            ctx.stores
                .attribute_store
                .save_host_attributes(host, attributes);
        });
    }

    /// Record the framework registration and announce it.
    pub fn save_framework_id(&self, framework_id: &str) {
        self.write_quiet(|ctx| {
            ctx.stores.scheduler_store.save_framework_id(framework_id);
            ctx.effects.add_event(PubsubEvent::DriverRegistered {
                framework_id: framework_id.to_string(),
            });
        });
    }

    // ------------------------------------------------------------------
    // Machine construction
    // ------------------------------------------------------------------

    /// Machine for a task just declared in this transaction (state INIT).
    fn machine_for_task(&self, ctx: &WriteContext<'_>, task: ScheduledTask) -> TaskStateMachine {
        let update_in_progress = self.update_registered(ctx, task.role(), task.job_name());
        TaskStateMachine::new(task, ScheduleStatus::Init, update_in_progress)
    }

    /// Machine for a stored task, starting from its persisted status.
    fn machine_for_stored(&self, ctx: &WriteContext<'_>, task: ScheduledTask) -> TaskStateMachine {
        let update_in_progress = self.update_registered(ctx, task.role(), task.job_name());
        let status = task.status;
        TaskStateMachine::new(task, status, update_in_progress)
    }

    /// Machine for a task id the store does not know: immediately driven to
    /// UNKNOWN, emitting a corrective kill.
    fn unknown_machine(&self, ctx: &mut WriteContext<'_>, task_id: &str) -> TaskStateMachine {
        let mut machine = TaskStateMachine::for_unknown_task(task_id);
        machine.update_state(ScheduleStatus::Unknown, None, None, &mut ctx.effects.work);
        machine
    }

    fn update_registered(&self, ctx: &WriteContext<'_>, role: &str, job_name: &str) -> bool {
        ctx.stores
            .update_store
            .fetch_job_update_config(role, job_name)
            .is_some()
    }

    // ------------------------------------------------------------------
    // Work queue drain (the transaction finalizer)
    // ------------------------------------------------------------------

    /// Drain the deferred work queue against the open transaction.
    ///
    /// Work executed here may enqueue more work (a reschedule drives the
    /// replacement machine to PENDING); the loop runs until the queue is dry.
    /// Non-DELETE work drains before DELETE work.
    fn drain_work_queue(&self, ctx: &mut WriteContext<'_>) {
        while let Some(entry) = ctx.effects.work.pop() {
            debug!(?entry, "executing work");
            match entry.command {
                WorkCommand::Kill => {
                    ctx.effects.add_kill(entry.task_id);
                }
                WorkCommand::UpdateState => self.apply_update_state(ctx, entry),
                WorkCommand::IncrementFailures => {
                    ctx.stores
                        .task_store
                        .mutate_task(&entry.task_id, |task| task.failure_count += 1);
                }
                WorkCommand::Delete => {
                    ctx.stores.task_store.delete_tasks([entry.task_id.as_str()]);
                    ctx.effects.add_event(PubsubEvent::TasksDeleted {
                        task_ids: vec![entry.task_id],
                    });
                }
                WorkCommand::Reschedule => self.reschedule(ctx, &entry.task_id),
                WorkCommand::Update => self.reschedule_for_update(ctx, &entry.task_id, false),
                WorkCommand::Rollback => self.reschedule_for_update(ctx, &entry.task_id, true),
            }
        }
    }

    fn apply_update_state(&self, ctx: &mut WriteContext<'_>, entry: WorkEntry) {
        let WorkEntry {
            task_id,
            new_status,
            previous_status,
            audit_message,
            mutation,
            ..
        } = entry;

        let timestamp = self.clock.now_millis();
        let updated = ctx
            .stores
            .task_store
            .mutate_task(&task_id, |task| {
                task.status = new_status;
                if let Some(mutation) = mutation {
                    mutation(task);
                }
                task.task_events.push(TaskEvent {
                    timestamp,
                    status: new_status,
                    message: audit_message,
                });
            })
            .cloned();

        match updated {
            Some(task) if new_status != previous_status => {
                ctx.effects.add_event(PubsubEvent::TaskStateChange {
                    task: Box::new(task),
                    previous: previous_status,
                });
            }
            Some(_) => {} // audit-only append, no status change to announce
            None => warn!(%task_id, "UPDATE_STATE for a task missing from the store"),
        }
    }

    /// Replace a dead task with a fresh copy of the same configuration.
    fn reschedule(&self, ctx: &mut WriteContext<'_>, task_id: &str) {
        let Some(original) = ctx.stores.task_store.fetch_task(task_id).cloned() else {
            warn!(%task_id, "RESCHEDULE for a task missing from the store");
            return;
        };

        // Owned copy: the record in the store is never mutated in place here.
        let mut replacement = original;
        let assigned = &mut replacement.assigned_task;
        assigned.slave_id = None;
        assigned.slave_host = None;
        assigned.assigned_ports.clear();
        let new_id = generate_task_id(self.clock.as_ref(), &assigned.task);
        assigned.task_id = new_id.clone();
        replacement.task_events.clear();
        replacement.ancestor_id = Some(task_id.to_string());

        info!(old = %task_id, new = %new_id, "task being rescheduled");

        let config = replacement.config().clone();
        ctx.stores.task_store.save_tasks([replacement.clone()]);

        let mut machine = self.machine_for_task(ctx, replacement);
        machine.update_state(
            ScheduleStatus::Pending,
            Some("Rescheduled".to_string()),
            None,
            &mut ctx.effects.work,
        );

        ctx.effects.add_event(PubsubEvent::TaskRescheduled {
            role: config.role,
            job_name: config.job_name,
            shard_id: config.shard_id,
        });
    }

    /// Replace a task that died mid-update with the update's target config.
    ///
    /// If the update configuration is gone the update finished first; the
    /// race is benign and the work is skipped with a warning. A missing
    /// target side means the update removed the shard.
    fn reschedule_for_update(&self, ctx: &mut WriteContext<'_>, task_id: &str, rolling_back: bool) {
        let Some(old_task) = ctx.stores.task_store.fetch_task(task_id) else {
            warn!(%task_id, "update reschedule for a task missing from the store");
            return;
        };
        let (role, job_name, shard_id) = (
            old_task.role().to_string(),
            old_task.job_name().to_string(),
            old_task.shard_id(),
        );

        let target = ctx
            .stores
            .update_store
            .fetch_job_update_config(&role, &job_name)
            .and_then(|update| update.shard_config(shard_id));

        let Some(shard_config) = target else {
            warn!(
                job = %format!("{role}/{job_name}"),
                shard_id,
                "no update configuration found, assuming update has finished"
            );
            return;
        };

        let config = if rolling_back {
            shard_config.old_config.clone()
        } else {
            shard_config.new_config.clone()
        };
        let Some(config) = config else {
            // The accepted configuration removed this shard.
            return;
        };

        let mut replacement =
            ScheduledTask::new(generate_task_id(self.clock.as_ref(), &config), config);
        replacement.ancestor_id = Some(task_id.to_string());
        ctx.stores.task_store.save_tasks([replacement.clone()]);

        let audit = if rolling_back {
            "Rescheduled after rollback."
        } else {
            "Rescheduled after update."
        };
        let mut machine = self.machine_for_task(ctx, replacement);
        machine.update_state(
            ScheduleStatus::Pending,
            Some(audit.to_string()),
            None,
            &mut ctx.effects.work,
        );
    }
}

/// Map requested port names to offered port numbers, both in sorted order.
fn map_ports(
    requested: &BTreeSet<String>,
    offered: &BTreeSet<u16>,
) -> Result<BTreeMap<String, u16>, ScheduleError> {
    if offered.len() < requested.len() {
        return Err(ScheduleError::InsufficientPorts {
            requested: requested.len(),
            offered: offered.len(),
        });
    }
    Ok(requested
        .iter()
        .cloned()
        .zip(offered.iter().copied())
        .collect())
}
