//! Rolling-update coordinator
//!
//! Registers updates atomically, drives shards through UPDATING/ROLLBACK,
//! creates added shards, kills removed shards, and finishes updates
//! idempotently under a token.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::domain::{
    Identity, JobUpdateConfiguration, ScheduleStatus, ShardUpdateResult, TaskConfig,
    TaskQuery, TaskUpdateConfiguration, UpdateResult,
};
use crate::error::UpdateError;
use crate::state::StateManager;
use crate::storage::WriteContext;

/// Coordinates rolling updates on top of the state manager.
pub struct UpdateCoordinator {
    manager: Arc<StateManager>,
}

impl UpdateCoordinator {
    pub fn new(manager: Arc<StateManager>) -> Self {
        Self { manager }
    }

    /// Register a new update for (role, job).
    ///
    /// Persists one per-shard old/new config pair for every shard in the
    /// union of the running and target shard sets, and returns the token
    /// protecting the update.
    pub fn register_update(
        &self,
        role: &str,
        job_name: &str,
        updated_tasks: Vec<TaskConfig>,
    ) -> Result<String, UpdateError> {
        let job_key = job_key(role, job_name);
        self.manager.write(|ctx| {
            assert_not_updating_or_rolling_back(ctx, role, job_name)?;

            let existing: Vec<TaskConfig> = ctx
                .stores
                .task_store
                .fetch_tasks(&TaskQuery::job_scoped(role, job_name).active())
                .into_iter()
                .map(|t| t.config().clone())
                .collect();
            if existing.is_empty() {
                return Err(UpdateError::NoActiveTasks(job_key.clone()));
            }

            if ctx
                .stores
                .update_store
                .fetch_job_update_config(role, job_name)
                .is_some()
            {
                return Err(UpdateError::UpdateInProgress(job_key.clone()));
            }

            let old_shards = index_by_shard(existing);
            let new_shards = index_by_shard(updated_tasks);

            let shard_union: BTreeSet<u32> =
                old_shards.keys().chain(new_shards.keys()).copied().collect();
            let configs: Vec<TaskUpdateConfiguration> = shard_union
                .into_iter()
                .map(|shard| TaskUpdateConfiguration {
                    old_config: old_shards.get(&shard).cloned(),
                    new_config: new_shards.get(&shard).cloned(),
                })
                .collect();

            let update_token = Uuid::new_v4().to_string();
            info!(job = %job_key, shards = configs.len(), "registering update");
            ctx.stores
                .update_store
                .save_job_update_config(JobUpdateConfiguration {
                    role: role.to_string(),
                    job_name: job_name.to_string(),
                    update_token: update_token.clone(),
                    configs,
                });
            Ok(update_token)
        })
    }

    /// Move a batch of shards to their updated configuration.
    pub fn update_shards(
        &self,
        identity: &Identity,
        job_name: &str,
        shards: &BTreeSet<u32>,
        update_token: &str,
    ) -> Result<BTreeMap<u32, ShardUpdateResult>, UpdateError> {
        self.modify_shards(identity, job_name, shards, update_token, true)
    }

    /// Move a batch of shards back to their original configuration.
    pub fn rollback_shards(
        &self,
        identity: &Identity,
        job_name: &str,
        shards: &BTreeSet<u32>,
        update_token: &str,
    ) -> Result<BTreeMap<u32, ShardUpdateResult>, UpdateError> {
        self.modify_shards(identity, job_name, shards, update_token, false)
    }

    /// Drive `shards` toward the configuration selected by `updating`.
    ///
    /// Shards with no active task are created from the target config
    /// (`Added`); shards whose config differs are driven to UPDATING or
    /// ROLLBACK (`Restarting`); the rest are `Unchanged`. A shard id the
    /// registered update does not cover fails the whole call atomically.
    pub fn modify_shards(
        &self,
        identity: &Identity,
        job_name: &str,
        shards: &BTreeSet<u32>,
        update_token: &str,
        updating: bool,
    ) -> Result<BTreeMap<u32, ShardUpdateResult>, UpdateError> {
        let role = identity.role.clone();
        let job_key = job_key(&role, job_name);
        let (modifying_state, audit_message) = if updating {
            (
                ScheduleStatus::Updating,
                format!("Updated by {}", identity.user),
            )
        } else {
            (
                ScheduleStatus::Rollback,
                format!("Rolled back by {}", identity.user),
            )
        };

        self.manager.write(|ctx| {
            let mut results = BTreeMap::new();

            let update = ctx
                .stores
                .update_store
                .fetch_job_update_config(&role, job_name)
                .cloned()
                .ok_or_else(|| UpdateError::UnknownUpdate(job_key.clone()))?;
            if update.update_token != update_token {
                return Err(UpdateError::InvalidToken(job_key.clone()));
            }

            let active_tasks = ctx.stores.task_store.fetch_tasks(
                &TaskQuery::shard_scoped(role.clone(), job_name, shards.iter().copied()).active(),
            );
            let active_shards: BTreeSet<u32> =
                active_tasks.iter().map(|t| t.shard_id()).collect();

            // Shards being added by this stage of the update.
            let new_shard_ids: BTreeSet<u32> =
                shards.difference(&active_shards).copied().collect();
            if !new_shard_ids.is_empty() {
                let new_configs = target_configs(&update, &new_shard_ids, updating);
                let recognized: BTreeSet<u32> =
                    new_configs.iter().map(|c| c.shard_id).collect();
                let unrecognized: Vec<u32> =
                    new_shard_ids.difference(&recognized).copied().collect();
                if !unrecognized.is_empty() {
                    return Err(UpdateError::UnrecognizedShards(unrecognized));
                }

                self.manager.insert_tasks_in_tx(ctx, new_configs);
                put_results(&mut results, ShardUpdateResult::Added, &new_shard_ids);
            }

            let update_shard_ids: BTreeSet<u32> =
                shards.difference(&new_shard_ids).copied().collect();
            if !update_shard_ids.is_empty() {
                let target = target_configs(&update, &update_shard_ids, updating);
                // Tasks already in UPDATING/ROLLBACK are excluded from the
                // comparison so they are re-driven toward the requested
                // direction rather than silently left pointing the other way.
                let not_updating_configs: Vec<TaskConfig> = active_tasks
                    .iter()
                    .filter(|t| {
                        t.status != ScheduleStatus::Updating
                            && t.status != ScheduleStatus::Rollback
                    })
                    .map(|t| t.config().clone())
                    .collect();
                let changed_shards: BTreeSet<u32> = target
                    .iter()
                    .filter(|config| !not_updating_configs.contains(config))
                    .map(|config| config.shard_id)
                    .collect();

                if !changed_shards.is_empty() {
                    self.manager.change_state_in_tx(
                        ctx,
                        &TaskQuery::shard_scoped(
                            role.clone(),
                            job_name,
                            changed_shards.iter().copied(),
                        )
                        .active(),
                        modifying_state,
                        Some(audit_message.clone()),
                    );
                    put_results(&mut results, ShardUpdateResult::Restarting, &changed_shards);
                }
                let unchanged: BTreeSet<u32> = update_shard_ids
                    .difference(&changed_shards)
                    .copied()
                    .collect();
                put_results(&mut results, ShardUpdateResult::Unchanged, &unchanged);
            }

            Ok(results)
        })
    }

    /// Complete an in-progress update.
    ///
    /// With `Success` or `Failed`, shards the accepted outcome removes are
    /// killed. Removes the update configuration; returns false (or throws,
    /// per `throw_if_missing`) when no update is registered.
    pub fn finish_update(
        &self,
        identity: &Identity,
        job_name: &str,
        update_token: Option<&str>,
        result: UpdateResult,
        throw_if_missing: bool,
    ) -> Result<bool, UpdateError> {
        let role = identity.role.clone();
        let user = identity.user.clone();
        let job_key = job_key(&role, job_name);

        self.manager.write(|ctx| {
            assert_not_updating_or_rolling_back(ctx, &role, job_name)?;

            let Some(update) = ctx
                .stores
                .update_store
                .fetch_job_update_config(&role, job_name)
                .cloned()
            else {
                if throw_if_missing {
                    return Err(UpdateError::UnknownUpdate(job_key.clone()));
                }
                return Ok(false);
            };

            if let Some(token) = update_token {
                if token != update.update_token {
                    return Err(UpdateError::InvalidToken(job_key.clone()));
                }
            }

            if matches!(result, UpdateResult::Success | UpdateResult::Failed) {
                // Kill shards the accepted side of the update removed.
                let removed: BTreeSet<u32> = update
                    .configs
                    .iter()
                    .filter(|config| {
                        let kept = match result {
                            UpdateResult::Success => &config.new_config,
                            _ => &config.old_config,
                        };
                        kept.is_none()
                    })
                    .map(TaskUpdateConfiguration::shard_id)
                    .collect();

                for shard in removed {
                    self.manager.change_state_in_tx(
                        ctx,
                        &TaskQuery::shard_scoped(role.clone(), job_name, [shard]).active(),
                        ScheduleStatus::Killing,
                        Some(format!("Removed during update by {user}")),
                    );
                }
            }

            info!(job = %job_key, ?result, "finishing update");
            ctx.stores
                .update_store
                .remove_shard_update_configs(&role, job_name);
            Ok(true)
        })
    }
}

fn job_key(role: &str, job_name: &str) -> String {
    format!("{role}/{job_name}")
}

/// No update may proceed while any task of the job is mid-update.
fn assert_not_updating_or_rolling_back(
    ctx: &WriteContext<'_>,
    role: &str,
    job_name: &str,
) -> Result<(), UpdateError> {
    let busy = ctx.stores.task_store.fetch_task_ids(
        &TaskQuery::job_scoped(role, job_name)
            .by_status([ScheduleStatus::Updating, ScheduleStatus::Rollback]),
    );
    if busy.is_empty() {
        Ok(())
    } else {
        Err(UpdateError::TasksBusy(job_key(role, job_name)))
    }
}

fn index_by_shard(configs: Vec<TaskConfig>) -> BTreeMap<u32, TaskConfig> {
    configs.into_iter().map(|c| (c.shard_id, c)).collect()
}

/// Configs for `shards` on the side of the update selected by `updating`.
/// Shards whose selected side is absent are silently dropped.
fn target_configs(
    update: &JobUpdateConfiguration,
    shards: &BTreeSet<u32>,
    updating: bool,
) -> Vec<TaskConfig> {
    update
        .configs
        .iter()
        .filter(|c| shards.contains(&c.shard_id()))
        .filter_map(|c| {
            if updating {
                c.new_config.clone()
            } else {
                c.old_config.clone()
            }
        })
        .collect()
}

fn put_results(
    results: &mut BTreeMap<u32, ShardUpdateResult>,
    result: ShardUpdateResult,
    shards: &BTreeSet<u32>,
) {
    for shard in shards {
        results.insert(*shard, result);
    }
}
