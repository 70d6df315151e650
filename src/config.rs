//! Scheduler configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the scheduler's administrative surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Allow new jobs to be created. When false all job creation requests are
    /// denied.
    #[serde(default = "default_enable_job_creation")]
    pub enable_job_creation: bool,

    /// Initial backoff delay while waiting for killed tasks to transition to
    /// a terminal state, in milliseconds.
    #[serde(default = "default_kill_task_initial_backoff_ms")]
    pub kill_task_initial_backoff_ms: u64,

    /// Max backoff delay while waiting for killed tasks to transition to a
    /// terminal state, in milliseconds.
    #[serde(default = "default_kill_task_max_backoff_ms")]
    pub kill_task_max_backoff_ms: u64,
}

fn default_enable_job_creation() -> bool {
    true
}

fn default_kill_task_initial_backoff_ms() -> u64 {
    1_000
}

fn default_kill_task_max_backoff_ms() -> u64 {
    30_000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enable_job_creation: true,
            kill_task_initial_backoff_ms: 1_000,
            kill_task_max_backoff_ms: 30_000,
        }
    }
}

impl SchedulerConfig {
    /// Initial kill-wait backoff as a Duration.
    pub fn kill_task_initial_backoff(&self) -> Duration {
        Duration::from_millis(self.kill_task_initial_backoff_ms)
    }

    /// Max kill-wait backoff as a Duration.
    pub fn kill_task_max_backoff(&self) -> Duration {
        Duration::from_millis(self.kill_task_max_backoff_ms)
    }
}
