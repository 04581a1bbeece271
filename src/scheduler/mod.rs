//! Recurring background jobs.
//!
//! [`runner`] holds the generic periodic runner; [`tasks`] the built-in jobs
//! that run against the runtime state store and external collaborators.

pub mod runner;
pub mod tasks;

pub use runner::{
    DEFAULT_STAGGER, RecurringTask, TaskError, TaskHandle, TaskRunOutcome, TaskRunRecord,
    TaskState, TaskStatus,
};
pub use tasks::{TASK_FEED_SYNC, TASK_SESSION_REAPER, TASK_TIMER_SWEEP, builtin_tasks};
