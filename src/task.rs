use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use crate::{BoxHandler, CronError, CronSchedule, HandlerResult, SchedulerError};

/// A unit of work run by the scheduler.
///
/// Handlers may be retried within one scheduled run, so they must tolerate
/// being called again after a failure. They should watch `ctx` and return
/// early once it is cancelled.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, ctx: CancellationToken) -> HandlerResult;
}

/// Adapts a closure into a [`TaskHandler`].
///
/// ```
/// use schedcuter::{handler_fn, Schedule, Task};
/// use std::time::Duration;
///
/// let task = Task::new("warmup", "Cache warmup", Schedule::Interval(Duration::from_secs(300)))
///     .with_handler(handler_fn(|_ctx| async { Ok(()) }));
/// assert!(task.handler.is_some());
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    FnHandler { f }
}

#[derive(Clone)]
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn run(&self, ctx: CancellationToken) -> HandlerResult {
        (self.f)(ctx).await
    }
}

/// Named priority bands. Any `i32` is a valid priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskPriority {
    Low = 0,
    Medium = 50,
    High = 100,
}

impl From<TaskPriority> for i32 {
    fn from(priority: TaskPriority) -> Self {
        priority as i32
    }
}

/// Where a task is in its execution cycle. Tasks not in the running map are
/// `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    /// Selected by the poll loop, handler not started yet.
    Ready,
    Running,
}

/// When a task becomes eligible to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    /// Runs immediately on registration, then `interval` after each completion.
    Interval(Duration),
    /// Runs once at the earliest time not yet in the past (or the earliest
    /// time overall if all have passed), then the task is disabled.
    Once(Vec<DateTime<Utc>>),
    Cron(CronSchedule),
}

impl Schedule {
    pub fn cron(spec: &str) -> Result<Self, CronError> {
        CronSchedule::parse(spec).map(Schedule::Cron)
    }

    pub fn once(at: DateTime<Utc>) -> Self {
        Schedule::Once(vec![at])
    }

    /// The persisted type tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Schedule::Interval(_) => "interval",
            Schedule::Once(_) => "once",
            Schedule::Cron(_) => "cron",
        }
    }

    pub(crate) fn validate(&self) -> Result<(), SchedulerError> {
        match self {
            Schedule::Interval(interval) if interval.is_zero() => Err(
                SchedulerError::InvalidSchedule("invalid interval: must be > 0".to_string()),
            ),
            Schedule::Interval(interval) if TimeDelta::from_std(*interval).is_err() => Err(
                SchedulerError::InvalidSchedule(format!("interval out of range: {interval:?}")),
            ),
            Schedule::Once(times) if times.is_empty() => Err(SchedulerError::InvalidSchedule(
                "once schedule needs at least one time".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// First run after registration.
    pub(crate) fn initial_run(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Interval(_) => Some(now),
            Schedule::Once(times) => times
                .iter()
                .filter(|at| **at >= now)
                .min()
                .or_else(|| times.iter().min())
                .copied(),
            Schedule::Cron(cron) => Some(cron.next(now)),
        }
    }

    /// Next run after a completed execution. `None` means the task is done.
    pub(crate) fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Interval(interval) => TimeDelta::from_std(*interval)
                .ok()
                .and_then(|delta| now.checked_add_signed(delta)),
            Schedule::Once(_) => None,
            Schedule::Cron(cron) => Some(cron.next(now)),
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Interval(interval) => {
                write!(f, "every {}", humantime::format_duration(*interval))
            }
            Schedule::Once(times) => match times.iter().min() {
                Some(at) => write!(f, "once at {}", at.to_rfc3339()),
                None => f.write_str("once (no time set)"),
            },
            Schedule::Cron(cron) => write!(f, "cron \"{cron}\""),
        }
    }
}

#[derive(Clone)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub description: String,
    pub handler: Option<BoxHandler>,
    pub schedule: Schedule,
    pub enabled: bool,
    /// Higher runs first within one poll tick.
    pub priority: i32,
    /// IDs of tasks that must have succeeded before this one runs.
    pub dependencies: Vec<String>,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub error_count: u64,
    pub last_error: Option<String>,
}

impl Task {
    /// Creates an enabled, medium-priority task with no handler.
    pub fn new(id: impl Into<String>, name: impl Into<String>, schedule: Schedule) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            handler: None,
            schedule,
            enabled: true,
            priority: TaskPriority::Medium.into(),
            dependencies: Vec::new(),
            last_run: None,
            next_run: None,
            run_count: 0,
            error_count: 0,
            last_error: None,
        }
    }

    pub fn with_handler(mut self, handler: impl TaskHandler + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: impl Into<i32>) -> Self {
        self.priority = priority.into();
        self
    }

    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Whether the last completed run succeeded. False before the first run.
    pub fn succeeded(&self) -> bool {
        self.run_count > 0 && self.last_error.is_none()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("schedule", &self.schedule)
            .field("enabled", &self.enabled)
            .field("priority", &self.priority)
            .field("dependencies", &self.dependencies)
            .field("has_handler", &self.handler.is_some())
            .field("last_run", &self.last_run)
            .field("next_run", &self.next_run)
            .field("run_count", &self.run_count)
            .field("error_count", &self.error_count)
            .field("last_error", &self.last_error)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn closures_are_handlers() {
        let handler: BoxHandler = Arc::new(handler_fn(|_ctx| async { Ok(()) }));
        assert!(handler.run(CancellationToken::new()).await.is_ok());

        let failing: BoxHandler = Arc::new(handler_fn(|_ctx| async {
            Err(SchedulerError::TaskExecution("boom".to_string()))
        }));
        assert!(failing.run(CancellationToken::new()).await.is_err());
    }

    #[test]
    fn builder_defaults() {
        let task = Task::new("sync", "Sync sweep", Schedule::Interval(Duration::from_secs(60)));
        assert!(task.enabled);
        assert_eq!(task.priority, 50);
        assert!(task.handler.is_none());
        assert!(!task.succeeded());

        let task = task
            .with_priority(TaskPriority::High)
            .with_dependencies(["cache"])
            .with_enabled(false);
        assert_eq!(task.priority, 100);
        assert_eq!(task.dependencies, vec!["cache".to_string()]);
        assert!(!task.enabled);
    }

    #[test]
    fn validate_rejects_degenerate_schedules() {
        assert!(Schedule::Interval(Duration::ZERO).validate().is_err());
        assert!(Schedule::Interval(Duration::from_secs(u64::MAX)).validate().is_err());
        assert!(Schedule::Once(vec![]).validate().is_err());
        assert!(Schedule::Interval(Duration::from_millis(1)).validate().is_ok());
    }

    #[test]
    fn next_run_calculation() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let earlier = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();

        let interval = Schedule::Interval(Duration::from_secs(90));
        assert_eq!(interval.initial_run(now), Some(now));
        assert_eq!(interval.next_after(now), Some(now + TimeDelta::seconds(90)));

        let once = Schedule::Once(vec![later, earlier]);
        assert_eq!(once.initial_run(now), Some(earlier));
        assert_eq!(once.next_after(now), None);

        let past = Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap();
        let pending = Schedule::Once(vec![past, later, earlier]);
        assert_eq!(pending.initial_run(now), Some(earlier));
        let elapsed = Schedule::Once(vec![now - TimeDelta::days(2), past]);
        assert_eq!(elapsed.initial_run(now), Some(past));

        let cron = Schedule::cron("0 0 * * *").unwrap();
        let midnight = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        assert_eq!(cron.initial_run(now), Some(midnight));
        assert_eq!(cron.next_after(now), Some(midnight));
    }

    #[test]
    fn schedule_display() {
        assert_eq!(Schedule::Interval(Duration::from_secs(300)).to_string(), "every 5m");
        assert_eq!(Schedule::cron("*/5 * * * *").unwrap().to_string(), "cron \"*/5 * * * *\"");
        assert_eq!(Schedule::cron("0 0 * * *").unwrap().kind(), "cron");
    }
}
