//! Task state machine and its emitted work

pub mod task_machine;
pub mod work;

pub use task_machine::TaskStateMachine;
pub use work::{TaskMutation, WorkCommand, WorkEntry, WorkQueue};
