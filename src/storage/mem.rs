//! In-memory stores
//!
//! All scheduler state lives in these maps. The whole `StoreState` is
//! clonable so a write transaction can snapshot it and roll back on failure.

use std::collections::{BTreeSet, HashMap};

use crate::domain::{
    Attribute, JobUpdateConfiguration, Resources, ScheduledTask, TaskQuery,
};

/// Task records, indexed by id and by (role, job).
#[derive(Debug, Clone, Default)]
pub struct TaskStore {
    tasks: HashMap<String, ScheduledTask>,
    job_index: HashMap<(String, String), BTreeSet<String>>,
}

impl TaskStore {
    /// Insert or replace task records.
    pub fn save_tasks(&mut self, tasks: impl IntoIterator<Item = ScheduledTask>) {
        for task in tasks {
            let key = (task.role().to_string(), task.job_name().to_string());
            self.job_index
                .entry(key)
                .or_default()
                .insert(task.task_id().to_string());
            self.tasks.insert(task.task_id().to_string(), task);
        }
    }

    /// Apply `mutator` to every task matching `query`. Returns how many
    /// records were touched.
    pub fn mutate_tasks<F>(&mut self, query: &TaskQuery, mut mutator: F) -> usize
    where
        F: FnMut(&mut ScheduledTask),
    {
        let ids = self.fetch_task_ids(query);
        for id in &ids {
            if let Some(task) = self.tasks.get_mut(id) {
                mutator(task);
            }
        }
        ids.len()
    }

    /// Apply `mutator` to one task by id. Returns the mutated record.
    pub fn mutate_task<F>(&mut self, task_id: &str, mutator: F) -> Option<&ScheduledTask>
    where
        F: FnOnce(&mut ScheduledTask),
    {
        let task = self.tasks.get_mut(task_id)?;
        mutator(task);
        Some(task)
    }

    /// Remove task records by id.
    pub fn delete_tasks<'a>(&mut self, task_ids: impl IntoIterator<Item = &'a str>) {
        for id in task_ids {
            if let Some(task) = self.tasks.remove(id) {
                let key = (task.role().to_string(), task.job_name().to_string());
                if let Some(ids) = self.job_index.get_mut(&key) {
                    ids.remove(id);
                    if ids.is_empty() {
                        self.job_index.remove(&key);
                    }
                }
            }
        }
    }

    /// All tasks matching `query`.
    pub fn fetch_tasks(&self, query: &TaskQuery) -> Vec<ScheduledTask> {
        self.candidates(query)
            .filter(|t| query.matches(t))
            .cloned()
            .collect()
    }

    /// One task by id.
    pub fn fetch_task(&self, task_id: &str) -> Option<&ScheduledTask> {
        self.tasks.get(task_id)
    }

    /// Ids of all tasks matching `query`, in sorted (chronological) order.
    pub fn fetch_task_ids(&self, query: &TaskQuery) -> Vec<String> {
        let mut ids: Vec<String> = self
            .candidates(query)
            .filter(|t| query.matches(t))
            .map(|t| t.task_id().to_string())
            .collect();
        ids.sort();
        ids
    }

    /// Narrow iteration through an index where the query allows it.
    fn candidates<'a>(
        &'a self,
        query: &'a TaskQuery,
    ) -> Box<dyn Iterator<Item = &'a ScheduledTask> + 'a> {
        if let Some(ids) = &query.task_ids {
            return Box::new(ids.iter().filter_map(move |id| self.tasks.get(id)));
        }
        if let (Some(role), Some(job)) = (&query.role, &query.job_name) {
            let key = (role.clone(), job.clone());
            return match self.job_index.get(&key) {
                Some(ids) => Box::new(ids.iter().filter_map(move |id| self.tasks.get(id))),
                None => Box::new(std::iter::empty()),
            };
        }
        Box::new(self.tasks.values())
    }
}

/// Registered rolling updates, keyed by (role, job).
#[derive(Debug, Clone, Default)]
pub struct UpdateStore {
    configs: HashMap<(String, String), JobUpdateConfiguration>,
}

impl UpdateStore {
    pub fn fetch_job_update_config(
        &self,
        role: &str,
        job_name: &str,
    ) -> Option<&JobUpdateConfiguration> {
        self.configs.get(&(role.to_string(), job_name.to_string()))
    }

    /// All registered updates for a role.
    pub fn fetch_update_configs(&self, role: &str) -> Vec<JobUpdateConfiguration> {
        self.configs
            .values()
            .filter(|c| c.role == role)
            .cloned()
            .collect()
    }

    /// Roles that have at least one registered update.
    pub fn fetch_updating_roles(&self) -> BTreeSet<String> {
        self.configs.values().map(|c| c.role.clone()).collect()
    }

    pub fn save_job_update_config(&mut self, config: JobUpdateConfiguration) {
        self.configs
            .insert((config.role.clone(), config.job_name.clone()), config);
    }

    pub fn remove_shard_update_configs(&mut self, role: &str, job_name: &str) {
        self.configs
            .remove(&(role.to_string(), job_name.to_string()));
    }
}

/// Host attributes, keyed by hostname.
#[derive(Debug, Clone, Default)]
pub struct AttributeStore {
    hosts: HashMap<String, BTreeSet<Attribute>>,
}

impl AttributeStore {
    pub fn save_host_attributes(
        &mut self,
        host: impl Into<String>,
        attributes: impl IntoIterator<Item = Attribute>,
    ) {
        self.hosts
            .insert(host.into(), attributes.into_iter().collect());
    }

    pub fn fetch_host_attributes(&self, host: &str) -> BTreeSet<Attribute> {
        self.hosts.get(host).cloned().unwrap_or_default()
    }
}

/// Per-role resource quotas.
#[derive(Debug, Clone, Default)]
pub struct QuotaStore {
    quotas: HashMap<String, Resources>,
}

impl QuotaStore {
    pub fn save_quota(&mut self, role: impl Into<String>, quota: Resources) {
        self.quotas.insert(role.into(), quota);
    }

    pub fn fetch_quota(&self, role: &str) -> Option<&Resources> {
        self.quotas.get(role)
    }

    pub fn remove_quota(&mut self, role: &str) {
        self.quotas.remove(role);
    }
}

/// Singleton scheduler state: the framework registration.
#[derive(Debug, Clone, Default)]
pub struct SchedulerStore {
    framework_id: Option<String>,
}

impl SchedulerStore {
    pub fn save_framework_id(&mut self, framework_id: impl Into<String>) {
        self.framework_id = Some(framework_id.into());
    }

    pub fn fetch_framework_id(&self) -> Option<&str> {
        self.framework_id.as_deref()
    }
}

/// Everything a transaction can see and mutate.
#[derive(Debug, Clone, Default)]
pub struct StoreState {
    pub task_store: TaskStore,
    pub update_store: UpdateStore,
    pub attribute_store: AttributeStore,
    pub quota_store: QuotaStore,
    pub scheduler_store: SchedulerStore,
}
