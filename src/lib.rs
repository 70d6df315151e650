//! Flotilla - task state manager for a cluster job scheduler
//!
//! Flotilla is the core of a cluster job scheduler built on a Mesos-style
//! resource-offer framework: it tracks every task's lifecycle through a
//! status state machine, places tasks onto offered hosts, and coordinates
//! rolling updates with rollback.
//!
//! # Core Concepts
//!
//! - **Transactions Own Mutation**: every change to task or update state runs
//!   inside a write transaction; side effects (driver kills, pub/sub events)
//!   are deferred and escape only after commit
//! - **Machines Emit Work**: per-task state machines are transient, rebuilt
//!   from the store each transaction, and emit work commands rather than
//!   mutating anything themselves
//! - **Updates Are Tokens**: a registered rolling update is a per-shard
//!   old/new config diff guarded by an opaque token until finished
//!
//! # Modules
//!
//! - [`domain`] - task records, statuses, queries, update configurations
//! - [`storage`] - in-memory stores behind the transactional wrapper
//! - [`machine`] - the per-task state machine and its work vocabulary
//! - [`state`] - the state manager orchestrating transactions and work drain
//! - [`updater`] - the rolling-update coordinator
//! - [`constraints`] - attribute and limit constraint matching
//! - [`admin`] - session-validated administrative facade

pub mod admin;
pub mod backoff;
pub mod clock;
pub mod config;
pub mod constraints;
pub mod domain;
pub mod driver;
pub mod error;
pub mod events;
pub mod machine;
pub mod state;
pub mod storage;
pub mod updater;

// Re-export commonly used types
pub use admin::{
    AdminInterface, Capability, InMemorySessionValidator, JobConfiguration, Response,
    ResponseCode, SessionKey, SessionValidator,
};
pub use backoff::BackoffHelper;
pub use clock::{Clock, FakeClock, SystemClock};
pub use config::SchedulerConfig;
pub use domain::{
    generate_task_id, AssignedTask, Attribute, ConstraintKind, Identity,
    JobUpdateConfiguration, LimitConstraint, Resources, ScheduleStatus, ScheduledTask,
    ShardUpdateResult, TaskConfig, TaskConstraint, TaskEvent, TaskQuery,
    TaskUpdateConfiguration, UpdateResult, ValueConstraint,
};
pub use driver::{Driver, RecordingDriver};
pub use error::{AuthError, ScheduleError, StorageError, UpdateError};
pub use events::{EventSink, PubsubEvent};
pub use machine::{TaskStateMachine, WorkCommand};
pub use state::StateManager;
pub use storage::TransactionalStorage;
pub use updater::UpdateCoordinator;
