//! Administrative facade
//!
//! The typed front door for cluster administration: session-validated
//! operations over the state manager and update coordinator, with failures
//! mapped onto response codes instead of surfaced as raw errors.

mod auth;

pub use auth::{Capability, InMemorySessionValidator, SessionKey, SessionValidator};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{info, warn};

use crate::backoff::BackoffHelper;
use crate::config::SchedulerConfig;
use crate::domain::{
    Identity, JobUpdateConfiguration, Resources, ScheduledTask, ScheduleStatus,
    ShardUpdateResult, TaskConfig, TaskQuery, UpdateResult,
};
use crate::state::StateManager;
use crate::updater::UpdateCoordinator;

/// Outcome classes carried on every administrative response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    Ok,
    InvalidRequest,
    AuthFailed,
    Error,
}

/// Response envelope for administrative operations.
#[derive(Debug, Clone)]
pub struct Response<T> {
    pub code: ResponseCode,
    pub message: String,
    pub result: Option<T>,
}

impl<T> Response<T> {
    fn ok(message: impl Into<String>, result: T) -> Self {
        Self {
            code: ResponseCode::Ok,
            message: message.into(),
            result: Some(result),
        }
    }

    fn invalid_request(message: impl std::fmt::Display) -> Self {
        Self {
            code: ResponseCode::InvalidRequest,
            message: message.to_string(),
            result: None,
        }
    }

    fn auth_failed(message: impl std::fmt::Display) -> Self {
        Self {
            code: ResponseCode::AuthFailed,
            message: message.to_string(),
            result: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            code: ResponseCode::Error,
            message: message.into(),
            result: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == ResponseCode::Ok
    }
}

/// A job submission: owner, name, and one config per shard.
#[derive(Debug, Clone)]
pub struct JobConfiguration {
    pub owner: Identity,
    pub job_name: String,
    pub task_configs: Vec<TaskConfig>,
}

/// Session-validated administration over the scheduler core.
pub struct AdminInterface {
    config: SchedulerConfig,
    manager: Arc<StateManager>,
    updater: UpdateCoordinator,
    validator: Arc<dyn SessionValidator>,
}

impl AdminInterface {
    pub fn new(
        config: SchedulerConfig,
        manager: Arc<StateManager>,
        validator: Arc<dyn SessionValidator>,
    ) -> Self {
        let updater = UpdateCoordinator::new(Arc::clone(&manager));
        Self {
            config,
            manager,
            updater,
            validator,
        }
    }

    /// Create a job's tasks and leave them PENDING.
    pub fn create_job(
        &self,
        job: &JobConfiguration,
        session: &SessionKey,
    ) -> Response<BTreeSet<String>> {
        let job_key = format!("{}/{}", job.owner.role, job.job_name);
        info!(job = %job_key, "received create_job request");

        if !self.config.enable_job_creation {
            return Response::invalid_request("Job creation is disabled on this cluster.");
        }
        if let Err(err) = self.validator.check_authenticated(session, &job.owner.role) {
            return Response::auth_failed(err);
        }
        if job.task_configs.is_empty() {
            return Response::invalid_request("Invalid task description: no task configs");
        }

        let existing = self.manager.fetch_task_ids(
            &TaskQuery::job_scoped(&job.owner.role, &job.job_name).active(),
        );
        if !existing.is_empty() {
            return Response::invalid_request(format!(
                "Failed to schedule job - Job {job_key} already has active tasks"
            ));
        }

        let count = job.task_configs.len();
        let ids = self.manager.insert_tasks(job.task_configs.iter().cloned());
        Response::ok(format!("{count} new tasks pending for job {job_key}"), ids)
    }

    /// Tasks matching a query; an empty result is an invalid request.
    pub fn get_tasks_status(&self, query: &TaskQuery) -> Response<Vec<ScheduledTask>> {
        let tasks = self.manager.fetch_tasks(query);
        if tasks.is_empty() {
            Response::invalid_request(format!("No tasks found for query: {query:?}"))
        } else {
            Response::ok("", tasks)
        }
    }

    /// Kill every active task matching `query` and wait (bounded) for the
    /// kills to land.
    ///
    /// Non-admin sessions must be authenticated for every role the query
    /// touches. The wait polls outside any transaction under truncated
    /// exponential backoff and reports `Error` when the tasks outlive it.
    pub async fn kill_tasks(&self, query: &TaskQuery, session: &SessionKey) -> Response<()> {
        info!(user = %session.user, ?query, "received kill request");

        if let Some(job_name) = &query.job_name {
            if job_name.trim().is_empty() {
                return Response::invalid_request(format!("Invalid job name: '{job_name}'"));
            }
        }

        if self.is_admin(session) {
            info!(user = %session.user, "granting kill query to admin user");
        } else {
            let roles: BTreeSet<String> = self
                .manager
                .fetch_tasks(query)
                .iter()
                .map(|t| t.role().to_string())
                .collect();
            for role in roles {
                if let Err(err) = self.validator.check_authenticated(session, &role) {
                    return Response::auth_failed(err);
                }
            }
        }

        let active_query = query.clone().active();
        if self.manager.fetch_task_ids(&active_query).is_empty() {
            return Response::invalid_request("No tasks matched query");
        }
        self.manager.change_state(
            &active_query,
            ScheduleStatus::Killing,
            Some(format!("Killed by {}", session.user)),
        );

        let backoff = BackoffHelper::new(
            self.config.kill_task_initial_backoff(),
            self.config.kill_task_max_backoff(),
        );
        let manager = Arc::clone(&self.manager);
        let done = backoff
            .do_until_success(|| manager.fetch_task_ids(&active_query).is_empty())
            .await;

        if done {
            Response::ok("Tasks killed.", ())
        } else {
            warn!(?query, "tasks were not killed before the backoff gave up");
            Response::error("Tasks were not killed in time.")
        }
    }

    /// Register a rolling update toward the job's new task configs.
    pub fn start_update(&self, job: &JobConfiguration, session: &SessionKey) -> Response<String> {
        if let Err(err) = self.validator.check_authenticated(session, &job.owner.role) {
            return Response::auth_failed(err);
        }
        match self
            .updater
            .register_update(&job.owner.role, &job.job_name, job.task_configs.clone())
        {
            Ok(token) => Response::ok("Update successfully started.", token),
            Err(err) => Response::invalid_request(err),
        }
    }

    /// Move a batch of shards to the update's new configuration.
    pub fn update_shards(
        &self,
        role: &str,
        job_name: &str,
        shards: &BTreeSet<u32>,
        update_token: &str,
        session: &SessionKey,
    ) -> Response<BTreeMap<u32, ShardUpdateResult>> {
        let identity = Identity::new(role, &session.user);
        match self
            .updater
            .update_shards(&identity, job_name, shards, update_token)
        {
            Ok(results) => Response::ok(
                format!("Successfully started update of shards: {shards:?}"),
                results,
            ),
            Err(err) => Response::invalid_request(err),
        }
    }

    /// Move a batch of shards back to the update's original configuration.
    pub fn rollback_shards(
        &self,
        role: &str,
        job_name: &str,
        shards: &BTreeSet<u32>,
        update_token: &str,
        session: &SessionKey,
    ) -> Response<BTreeMap<u32, ShardUpdateResult>> {
        let identity = Identity::new(role, &session.user);
        match self
            .updater
            .rollback_shards(&identity, job_name, shards, update_token)
        {
            Ok(results) => Response::ok(
                format!("Successfully started rollback of shards: {shards:?}"),
                results,
            ),
            Err(err) => Response::invalid_request(err),
        }
    }

    /// Complete an in-progress update. A `Terminate` result ignores the
    /// token, allowing an abandoned update to be cleared.
    pub fn finish_update(
        &self,
        role: &str,
        job_name: &str,
        result: UpdateResult,
        update_token: Option<&str>,
        session: &SessionKey,
    ) -> Response<()> {
        let identity = Identity::new(role, &session.user);
        let token = match result {
            UpdateResult::Terminate => None,
            _ => update_token,
        };
        match self
            .updater
            .finish_update(&identity, job_name, token, result, true)
        {
            Ok(_) => Response::ok("Update successfully finished.", ()),
            Err(err) => Response::invalid_request(err),
        }
    }

    /// Restart the named shards in place.
    pub fn restart_shards(
        &self,
        role: &str,
        job_name: &str,
        shards: &BTreeSet<u32>,
        session: &SessionKey,
    ) -> Response<()> {
        if let Err(err) = self.validator.check_authenticated(session, role) {
            return Response::auth_failed(err);
        }
        match self
            .manager
            .restart_shards(role, job_name, shards, &session.user)
        {
            Ok(_) => Response::ok("Shards are restarting.", ()),
            Err(err) => Response::invalid_request(err),
        }
    }

    /// Force a task into a state, bypassing normal event flow. Admin only.
    pub fn force_task_state(
        &self,
        task_id: &str,
        status: ScheduleStatus,
        session: &SessionKey,
    ) -> Response<()> {
        if let Err(err) = self.validator.check_authorized(session, Capability::Root) {
            return Response::auth_failed(err);
        }
        self.manager.change_state(
            &TaskQuery::by_id(task_id),
            status,
            Some(format!("Transition forced by {}", session.user)),
        );
        Response::ok("Transition attempted.", ())
    }

    /// All registered updates, across roles.
    pub fn get_job_updates(&self) -> Response<Vec<JobUpdateConfiguration>> {
        let updates = self.manager.storage().read(|stores| {
            stores
                .update_store
                .fetch_updating_roles()
                .iter()
                .flat_map(|role| stores.update_store.fetch_update_configs(role))
                .collect::<Vec<_>>()
        });
        Response::ok("", updates)
    }

    /// Set a role's resource quota. Admin only.
    pub fn set_quota(
        &self,
        role: &str,
        quota: Resources,
        session: &SessionKey,
    ) -> Response<()> {
        if let Err(err) = self.validator.check_authorized(session, Capability::Root) {
            return Response::auth_failed(err);
        }
        let role = role.to_string();
        self.manager.write_quiet(move |ctx| {
            ctx.stores.quota_store.save_quota(role, quota);
        });
        Response::ok("Quota applied.", ())
    }

    /// A role's quota; absent quota reads as zero.
    pub fn get_quota(&self, role: &str) -> Response<Resources> {
        let quota = self
            .manager
            .storage()
            .read(|stores| stores.quota_store.fetch_quota(role).cloned())
            .unwrap_or_default();
        Response::ok("", quota)
    }

    fn is_admin(&self, session: &SessionKey) -> bool {
        self.validator
            .check_authorized(session, Capability::Root)
            .is_ok()
    }
}
