//! Resource-framework driver seam

use std::sync::Mutex;

use tracing::debug;

/// The one thing the core asks of the resource framework.
///
/// Kills are fire-and-forget and idempotent on the framework side; killing an
/// unknown task id is harmless.
pub trait Driver: Send + Sync {
    fn kill_task(&self, task_id: &str);
}

/// Records kill requests. Used by tests and as a stand-in before the real
/// framework driver registers.
#[derive(Debug, Default)]
pub struct RecordingDriver {
    killed: Mutex<Vec<String>>,
}

impl RecordingDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Task ids killed so far, in request order.
    pub fn killed(&self) -> Vec<String> {
        self.killed.lock().expect("driver lock poisoned").clone()
    }
}

impl Driver for RecordingDriver {
    fn kill_task(&self, task_id: &str) {
        debug!(%task_id, "driver kill requested");
        self.killed
            .lock()
            .expect("driver lock poisoned")
            .push(task_id.to_string());
    }
}
