//! Rolling-update records

use serde::{Deserialize, Serialize};

use super::task::TaskConfig;

/// Per-shard before/after pair within a registered update.
///
/// A missing `old_config` means the update adds the shard; a missing
/// `new_config` means the update removes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdateConfiguration {
    pub old_config: Option<TaskConfig>,
    pub new_config: Option<TaskConfig>,
}

impl TaskUpdateConfiguration {
    /// Shard id this entry covers, read from whichever side is present.
    pub fn shard_id(&self) -> u32 {
        self.old_config
            .as_ref()
            .or(self.new_config.as_ref())
            .expect("update configuration with neither old nor new config")
            .shard_id
    }
}

/// A registered update for one job, keyed by (role, job).
///
/// Exists from `register_update` until `finish_update` removes it; its
/// presence is what makes a job "updating".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobUpdateConfiguration {
    pub role: String,
    pub job_name: String,

    /// Opaque token protecting the update from concurrent modification.
    pub update_token: String,

    /// One entry per shard in the union of old and new shard sets.
    pub configs: Vec<TaskUpdateConfiguration>,
}

impl JobUpdateConfiguration {
    /// The entry for `shard_id`, if the update covers it.
    pub fn shard_config(&self, shard_id: u32) -> Option<&TaskUpdateConfiguration> {
        self.configs.iter().find(|c| c.shard_id() == shard_id)
    }
}

/// Per-shard outcome of a `modify_shards` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardUpdateResult {
    /// The shard had no active task and one was created.
    Added,
    /// The shard's task is being restarted with the target configuration.
    Restarting,
    /// The shard already matches the target configuration.
    Unchanged,
}

/// Caller-declared outcome of an update, passed to `finish_update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateResult {
    /// The new configuration is kept; shards it removed are killed.
    Success,
    /// The old configuration is kept; shards it lacked are killed.
    Failed,
    /// Abandon the update record without touching shards.
    Terminate,
}
