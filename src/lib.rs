pub mod config;
pub mod cron;
pub mod cycle_check;
pub mod persistence;
pub mod retry;
pub mod scheduler;
pub mod task;

pub use config::SchedulerConfig;
pub use cron::{CronError, CronSchedule};
pub use cycle_check::{depends_on, has_cycle};
pub use persistence::{SerializedSchedule, SerializedTask, TaskPersistence};
pub use retry::{RetryExecutor, RetryPolicy};
pub use scheduler::{Scheduler, SchedulerStats};
pub use task::{FnHandler, Schedule, Task, TaskHandler, TaskPriority, TaskState, handler_fn};

use std::sync::Arc;
use thiserror::Error;

pub type BoxHandler = Arc<dyn TaskHandler>;
pub type HandlerResult = Result<(), SchedulerError>;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("task ID cannot be empty")]
    EmptyTaskId,
    #[error("task {0} has no handler")]
    MissingHandler(String),
    #[error("task with ID {0} already exists")]
    TaskExists(String),
    #[error("task with ID {0} not found")]
    TaskNotFound(String),
    #[error("invalid dependencies: dependency task not found: {0}")]
    DependencyNotFound(String),
    #[error("Circular dependency detected: {0}")]
    CircularDependency(String),
    #[error("task {0} is running")]
    TaskRunning(String),
    #[error("cannot remove task {task_id}: {dependent} depends on it")]
    HasDependents { task_id: String, dependent: String },
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
    #[error("invalid cron spec: {0}")]
    Cron(#[from] CronError),
    #[error("Task execution failed: {0}")]
    TaskExecution(String),
    #[error("Context cancelled: {0}")]
    ContextCancelled(String),
    #[error("task {task_id} failed after {attempts} attempts, last error: {last_error}")]
    RetryFailed {
        task_id: String,
        attempts: u32,
        last_error: String,
    },
    #[error("persistence not enabled")]
    PersistenceDisabled,
    #[error("scheduler already started")]
    AlreadyStarted,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
