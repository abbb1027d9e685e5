use chrono::{DateTime, TimeDelta, Utc};
use futures::FutureExt;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use crate::{
    BoxHandler, RetryExecutor, RetryPolicy, Schedule, SchedulerConfig, SchedulerError, Task,
    TaskHandler, TaskPersistence, TaskState, depends_on, has_cycle,
};

/// Aggregate counters across all registered tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub total_tasks: usize,
    pub enabled_tasks: usize,
    pub running_tasks: usize,
    pub total_runs: u64,
    pub total_errors: u64,
}

/// Polls registered tasks and runs the ready ones concurrently.
///
/// Every ready task is spawned as its own tokio task; priority only decides
/// the dispatch order within one poll tick. [`Scheduler::stop`] waits for the
/// poll loop and every in-flight execution before returning.
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    tasks: RwLock<HashMap<String, Task>>,
    handlers: RwLock<HashMap<String, BoxHandler>>,
    /// Single source of truth for "is executing". Absent means idle.
    running: RwLock<HashMap<String, TaskState>>,
    overrides: RwLock<HashSet<String>>,
    retry_policy: RwLock<RetryPolicy>,
    persistence: RwLock<Option<Arc<TaskPersistence>>>,
    /// Held from snapshot to write so saves land in the order they were taken.
    save_lock: Mutex<()>,
    poll_interval: Duration,
    ctx: CancellationToken,
    tracker: TaskTracker,
    started: AtomicBool,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    pub fn with_config(config: SchedulerConfig) -> Self {
        let config = config.normalized();
        let persistence = config
            .persistence_path
            .as_ref()
            .map(|path| Arc::new(TaskPersistence::new(path)));

        Self {
            inner: Arc::new(Inner {
                tasks: RwLock::new(HashMap::new()),
                handlers: RwLock::new(HashMap::new()),
                running: RwLock::new(HashMap::new()),
                overrides: RwLock::new(HashSet::new()),
                retry_policy: RwLock::new(config.retry_policy()),
                persistence: RwLock::new(persistence),
                save_lock: Mutex::new(()),
                poll_interval: config.poll_interval,
                ctx: CancellationToken::new(),
                tracker: TaskTracker::new(),
                started: AtomicBool::new(false),
            }),
        }
    }

    pub async fn set_persistence(&self, path: impl Into<PathBuf>) {
        let persistence = TaskPersistence::new(path);
        info!(path = %persistence.path().display(), "task persistence enabled");
        *self.inner.persistence.write().await = Some(Arc::new(persistence));
    }

    /// Associates a handler with a task ID so [`Scheduler::load_tasks`] can
    /// restore that task.
    pub async fn register_handler(&self, task_id: impl Into<String>, handler: impl TaskHandler + 'static) {
        let task_id = task_id.into();
        let handler: BoxHandler = Arc::new(handler);
        self.inner
            .handlers
            .write()
            .await
            .insert(task_id.clone(), Arc::clone(&handler));

        if let Some(task) = self.inner.tasks.write().await.get_mut(&task_id) {
            task.handler = Some(handler);
        }
    }

    pub async fn save_tasks(&self) -> Result<(), SchedulerError> {
        self.inner.save().await
    }

    /// Restores persisted tasks whose handlers have been registered.
    ///
    /// Entries without a handler, or that fail to parse, are skipped with a
    /// warning. Returns the number of tasks loaded.
    pub async fn load_tasks(&self) -> Result<usize, SchedulerError> {
        let persistence = self.inner.persistence().await?;
        let serialized = persistence.load().await?;
        let handlers = self.inner.handlers.read().await.clone();
        let now = Utc::now();

        let mut loaded = Vec::with_capacity(serialized.len());
        for entry in serialized {
            let task_id = entry.id.clone();
            let mut task = match entry.into_task() {
                Ok(task) => task,
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "failed to convert persisted task");
                    continue;
                }
            };

            let Some(handler) = handlers.get(&task.id) else {
                warn!(task_id = %task.id, "handler not found for persisted task");
                continue;
            };
            task.handler = Some(Arc::clone(handler));

            if task.enabled && task.next_run.is_none() {
                task.next_run = task.schedule.initial_run(now);
            }
            loaded.push(task);
        }

        let mut tasks = self.inner.tasks.write().await;
        let mut merged = tasks.clone();
        merged.extend(loaded.iter().map(|task| (task.id.clone(), task.clone())));
        if has_cycle(&merged) {
            return Err(SchedulerError::CircularDependency(
                "persisted tasks form a dependency cycle".to_string(),
            ));
        }

        let count = loaded.len();
        for task in loaded {
            for dep in task.dependencies.iter().filter(|dep| !merged.contains_key(*dep)) {
                warn!(task_id = %task.id, dependency = %dep, "persisted task depends on an unknown task");
            }
            info!(
                task_id = %task.id,
                name = %task.name,
                enabled = task.enabled,
                "task loaded from persistence"
            );
            tasks.insert(task.id.clone(), task);
        }

        Ok(count)
    }

    pub async fn add_task(&self, mut task: Task) -> Result<(), SchedulerError> {
        if task.id.is_empty() {
            return Err(SchedulerError::EmptyTaskId);
        }
        let Some(handler) = task.handler.clone() else {
            return Err(SchedulerError::MissingHandler(task.id));
        };
        task.schedule.validate()?;
        let task_id = task.id.clone();

        {
            let mut tasks = self.inner.tasks.write().await;
            if tasks.contains_key(&task.id) {
                return Err(SchedulerError::TaskExists(task.id));
            }

            for dep in &task.dependencies {
                if *dep == task.id {
                    return Err(SchedulerError::CircularDependency(format!(
                        "task {} depends on itself",
                        task.id
                    )));
                }
                if !tasks.contains_key(dep) {
                    return Err(SchedulerError::DependencyNotFound(dep.clone()));
                }
                if depends_on(&tasks, dep, &task.id) {
                    return Err(SchedulerError::CircularDependency(format!(
                        "{} already depends on {}",
                        dep, task.id
                    )));
                }
            }

            task.next_run = task.schedule.initial_run(Utc::now());

            info!(
                task_id = %task.id,
                name = %task.name,
                schedule_type = task.schedule.kind(),
                priority = task.priority,
                next_run = ?task.next_run,
                "task added to scheduler"
            );
            tasks.insert(task.id.clone(), task);
        }

        self.inner.handlers.write().await.insert(task_id, handler);
        self.spawn_auto_save();
        Ok(())
    }

    /// Refused while `task_id` is dispatched or running, or while any other
    /// task lists it as a dependency.
    pub async fn remove_task(&self, task_id: &str) -> Result<(), SchedulerError> {
        {
            let mut tasks = self.inner.tasks.write().await;
            if !tasks.contains_key(task_id) {
                return Err(SchedulerError::TaskNotFound(task_id.to_string()));
            }
            if self.inner.running.read().await.contains_key(task_id) {
                return Err(SchedulerError::TaskRunning(task_id.to_string()));
            }

            if let Some(dependent) = tasks
                .values()
                .find(|task| task.id != task_id && task.dependencies.iter().any(|dep| dep == task_id))
            {
                return Err(SchedulerError::HasDependents {
                    task_id: task_id.to_string(),
                    dependent: dependent.id.clone(),
                });
            }

            tasks.remove(task_id);
        }

        self.inner.handlers.write().await.remove(task_id);
        self.inner.overrides.write().await.remove(task_id);

        info!(task_id, "task removed from scheduler");
        self.spawn_auto_save();
        Ok(())
    }

    pub async fn enable_task(&self, task_id: &str) -> Result<(), SchedulerError> {
        self.set_enabled(task_id, true).await?;
        info!(task_id, "task enabled");
        Ok(())
    }

    pub async fn disable_task(&self, task_id: &str) -> Result<(), SchedulerError> {
        self.set_enabled(task_id, false).await?;
        info!(task_id, "task disabled");
        Ok(())
    }

    async fn set_enabled(&self, task_id: &str, enabled: bool) -> Result<(), SchedulerError> {
        let mut tasks = self.inner.tasks.write().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| SchedulerError::TaskNotFound(task_id.to_string()))?;
        task.enabled = enabled;
        Ok(())
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Task, SchedulerError> {
        self.inner
            .tasks
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| SchedulerError::TaskNotFound(task_id.to_string()))
    }

    /// All tasks, ordered by ID.
    pub async fn list_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.inner.tasks.read().await.values().cloned().collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }

    /// `None` for unknown tasks.
    pub async fn task_state(&self, task_id: &str) -> Option<TaskState> {
        if !self.inner.tasks.read().await.contains_key(task_id) {
            return None;
        }
        let running = self.inner.running.read().await;
        Some(running.get(task_id).copied().unwrap_or(TaskState::Idle))
    }

    /// Lets dependents of `task_id` run even though it has not succeeded.
    pub async fn override_dependency(&self, task_id: &str) -> Result<(), SchedulerError> {
        if !self.inner.tasks.read().await.contains_key(task_id) {
            return Err(SchedulerError::TaskNotFound(task_id.to_string()));
        }
        self.inner.overrides.write().await.insert(task_id.to_string());
        warn!(task_id, "dependency override set");
        Ok(())
    }

    /// Returns whether an override was set.
    pub async fn clear_dependency_override(&self, task_id: &str) -> bool {
        let cleared = self.inner.overrides.write().await.remove(task_id);
        if cleared {
            info!(task_id, "dependency override cleared");
        }
        cleared
    }

    pub async fn set_max_retries(&self, max_retries: u32) {
        self.inner.retry_policy.write().await.max_retries = max_retries;
    }

    pub async fn set_retry_delay(&self, delay: Duration) {
        self.inner.retry_policy.write().await.delay = delay;
    }

    pub async fn get_stats(&self) -> SchedulerStats {
        let tasks = self.inner.tasks.read().await;
        let running = self.inner.running.read().await;

        tasks.values().fold(
            SchedulerStats {
                total_tasks: tasks.len(),
                running_tasks: running.len(),
                ..Default::default()
            },
            |mut stats, task| {
                if task.enabled {
                    stats.enabled_tasks += 1;
                }
                stats.total_runs += task.run_count;
                stats.total_errors += task.error_count;
                stats
            },
        )
    }

    /// Spawns the poll loop. Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), SchedulerError> {
        if self.inner.ctx.is_cancelled() {
            return Err(SchedulerError::ContextCancelled("scheduler has been stopped".to_string()));
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyStarted);
        }

        let inner = Arc::clone(&self.inner);
        self.inner.tracker.spawn(inner.run());
        Ok(())
    }

    /// Cancels the scheduler and waits for the poll loop and all running
    /// executions to finish, then writes a final snapshot.
    pub async fn stop(&self) {
        self.inner.ctx.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;

        info!("scheduler stopped");

        if self.inner.persistence.read().await.is_some() {
            if let Err(e) = self.inner.save().await {
                error!(error = %e, "failed to save tasks on shutdown");
            }
        }
    }

    fn spawn_auto_save(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.tracker.spawn(async move {
            if inner.persistence.read().await.is_none() {
                return;
            }
            if let Err(e) = inner.save().await {
                error!(error = %e, "failed to auto-save tasks");
            }
        });
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.inner.ctx.cancel();
    }
}

impl Inner {
    async fn persistence(&self) -> Result<Arc<TaskPersistence>, SchedulerError> {
        self.persistence
            .read()
            .await
            .clone()
            .ok_or(SchedulerError::PersistenceDisabled)
    }

    async fn save(&self) -> Result<(), SchedulerError> {
        let persistence = self.persistence().await?;
        let _guard = self.save_lock.lock().await;
        let snapshot = self.tasks.read().await.clone();
        persistence.save(&snapshot).await
    }

    async fn run(self: Arc<Self>) {
        let task_count = self.tasks.read().await.len();
        info!(task_count, "scheduler started");

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.ctx.cancelled() => break,
                _ = ticker.tick() => self.check_and_run_tasks(Utc::now()).await,
            }
        }
    }

    async fn check_and_run_tasks(self: &Arc<Self>, now: DateTime<Utc>) {
        let dispatch = {
            let tasks = self.tasks.read().await;
            let mut running = self.running.write().await;
            let overrides = self.overrides.read().await;

            select_ready(&tasks, &running, &overrides, now)
                .into_iter()
                .filter_map(|task_id| {
                    let handler = tasks.get(&task_id)?.handler.clone()?;
                    running.insert(task_id.clone(), TaskState::Ready);
                    Some((task_id, handler))
                })
                .collect::<Vec<_>>()
        };

        for (task_id, handler) in dispatch {
            debug!(task_id = %task_id, "dispatching task");
            self.tracker.spawn(Arc::clone(self).execute_task(task_id, handler));
        }
    }

    async fn execute_task(self: Arc<Self>, task_id: String, handler: BoxHandler) {
        if self.ctx.is_cancelled() {
            self.running.write().await.remove(&task_id);
            return;
        }
        self.running.write().await.insert(task_id.clone(), TaskState::Running);

        debug!(task_id = %task_id, "executing task");

        let started_at = Utc::now();
        let clock = Instant::now();
        let policy = self.retry_policy.read().await.clone();

        let result = RetryExecutor::new(policy)
            .execute_with_retry(&self.ctx, &task_id, |_attempt| {
                let handler = Arc::clone(&handler);
                let ctx = self.ctx.child_token();
                async move {
                    AssertUnwindSafe(handler.run(ctx))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| {
                            Err(SchedulerError::TaskExecution("handler panicked".to_string()))
                        })
                }
            })
            .await;

        self.record_run(&task_id, started_at, clock.elapsed(), result).await;
        self.running.write().await.remove(&task_id);
    }

    /// Applies the outcome of one scheduled invocation, however many attempts
    /// it took.
    async fn record_run(
        &self,
        task_id: &str,
        started_at: DateTime<Utc>,
        elapsed: Duration,
        result: Result<(), SchedulerError>,
    ) {
        let mut tasks = self.tasks.write().await;
        let Some(task) = tasks.get_mut(task_id) else {
            warn!(task_id, "task removed while running");
            return;
        };

        let finished_at = Utc::now();
        task.last_run = Some(started_at);
        task.run_count += 1;

        match result {
            Ok(()) => {
                task.last_error = None;
                info!(
                    task_id,
                    priority = task.priority,
                    duration = ?elapsed,
                    run_count = task.run_count,
                    "task completed successfully"
                );
            }
            Err(e) => {
                let (message, attempts) = match e {
                    SchedulerError::RetryFailed { last_error, attempts, .. } => (last_error, Some(attempts)),
                    other => (other.to_string(), None),
                };
                task.error_count += 1;
                error!(
                    task_id,
                    error = %message,
                    attempts = ?attempts,
                    duration = ?elapsed,
                    "task failed"
                );
                task.last_error = Some(message);
            }
        }

        task.next_run = task.schedule.next_after(finished_at);
        if matches!(task.schedule, Schedule::Once(_)) {
            task.enabled = false;
        } else if task.next_run.is_none() {
            error!(task_id, "failed to calculate next run");
            task.next_run = finished_at.checked_add_signed(TimeDelta::hours(1));
        }
    }
}

/// IDs of tasks that should be dispatched at `now`, highest priority first
/// (ties broken by ID).
///
/// A task and one of its direct dependencies are never picked in the same
/// pass; the lower ranked one waits for a later tick.
fn select_ready(
    tasks: &HashMap<String, Task>,
    running: &HashMap<String, TaskState>,
    overrides: &HashSet<String>,
    now: DateTime<Utc>,
) -> Vec<String> {
    let mut candidates: Vec<&Task> = tasks
        .values()
        .filter(|task| {
            task.enabled
                && task.next_run.is_some_and(|next_run| next_run <= now)
                && !running.contains_key(&task.id)
                && dependencies_met(task, tasks, running, overrides)
        })
        .collect();
    candidates.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));

    let mut selected: Vec<&Task> = Vec::with_capacity(candidates.len());
    for task in candidates {
        let conflicts = selected.iter().any(|picked| {
            task.dependencies.contains(&picked.id) || picked.dependencies.contains(&task.id)
        });
        if !conflicts {
            selected.push(task);
        }
    }
    selected.into_iter().map(|task| task.id.clone()).collect()
}

fn dependencies_met(
    task: &Task,
    tasks: &HashMap<String, Task>,
    running: &HashMap<String, TaskState>,
    overrides: &HashSet<String>,
) -> bool {
    task.dependencies.iter().all(|dep_id| match tasks.get(dep_id) {
        Some(dep) => {
            !running.contains_key(dep_id) && (dep.succeeded() || overrides.contains(dep_id))
        }
        None => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn due(id: &str, priority: i32) -> Task {
        let mut task = Task::new(id, id, Schedule::Interval(Duration::from_secs(60))).with_priority(priority);
        task.next_run = Some(now());
        task
    }

    fn succeeded(mut task: Task) -> Task {
        task.run_count = 1;
        task.next_run = Some(now() + TimeDelta::minutes(1));
        task
    }

    fn registry(tasks: Vec<Task>) -> HashMap<String, Task> {
        tasks.into_iter().map(|task| (task.id.clone(), task)).collect()
    }

    #[test]
    fn ready_tasks_are_ordered_by_priority() {
        let tasks = registry(vec![due("low", 0), due("high", 100), due("mid-b", 50), due("mid-a", 50)]);
        let ready = select_ready(&tasks, &HashMap::new(), &HashSet::new(), now());
        assert_eq!(ready, vec!["high", "mid-a", "mid-b", "low"]);
    }

    #[test]
    fn skips_disabled_future_and_running_tasks() {
        let mut future = due("future", 0);
        future.next_run = Some(now() + TimeDelta::seconds(1));
        let mut unscheduled = due("unscheduled", 0);
        unscheduled.next_run = None;
        let tasks = registry(vec![
            due("due", 0),
            due("disabled", 0).with_enabled(false),
            future,
            unscheduled,
            due("busy", 0),
        ]);
        let running = HashMap::from([("busy".to_string(), TaskState::Running)]);

        let ready = select_ready(&tasks, &running, &HashSet::new(), now());
        assert_eq!(ready, vec!["due"]);
    }

    #[test]
    fn dependency_that_never_ran_blocks() {
        let mut dep = due("dep", 0);
        dep.next_run = Some(now() + TimeDelta::minutes(5));
        let tasks = registry(vec![dep, due("child", 0).with_dependencies(["dep"])]);
        assert!(select_ready(&tasks, &HashMap::new(), &HashSet::new(), now()).is_empty());
    }

    #[test]
    fn failed_dependency_blocks() {
        let mut dep = succeeded(due("dep", 0));
        dep.error_count = 1;
        dep.last_error = Some("boom".to_string());
        let tasks = registry(vec![dep, due("child", 0).with_dependencies(["dep"])]);
        assert!(select_ready(&tasks, &HashMap::new(), &HashSet::new(), now()).is_empty());
    }

    #[test]
    fn running_dependency_blocks() {
        let tasks = registry(vec![succeeded(due("dep", 0)), due("child", 0).with_dependencies(["dep"])]);
        let running = HashMap::from([("dep".to_string(), TaskState::Ready)]);
        assert!(select_ready(&tasks, &running, &HashSet::new(), now()).is_empty());
    }

    #[test]
    fn satisfied_dependency_allows_run() {
        let tasks = registry(vec![succeeded(due("dep", 0)), due("child", 0).with_dependencies(["dep"])]);
        let ready = select_ready(&tasks, &HashMap::new(), &HashSet::new(), now());
        assert_eq!(ready, vec!["child"]);
    }

    #[test]
    fn dependency_due_in_same_tick_goes_first() {
        let mut tasks = registry(vec![
            succeeded(due("dep", 100)),
            succeeded(due("child", 0)).with_dependencies(["dep"]),
            due("other", 0),
        ]);
        for task in tasks.values_mut() {
            task.next_run = Some(now());
        }

        let ready = select_ready(&tasks, &HashMap::new(), &HashSet::new(), now());
        assert_eq!(ready, vec!["dep", "other"]);

        let running = HashMap::from([("dep".to_string(), TaskState::Ready)]);
        assert_eq!(select_ready(&tasks, &running, &HashSet::new(), now()), vec!["other"]);
    }

    #[test]
    fn higher_priority_dependent_defers_its_dependency() {
        let mut tasks = registry(vec![
            succeeded(due("dep", 0)),
            succeeded(due("child", 100)).with_dependencies(["dep"]),
        ]);
        for task in tasks.values_mut() {
            task.next_run = Some(now());
        }

        let ready = select_ready(&tasks, &HashMap::new(), &HashSet::new(), now());
        assert_eq!(ready, vec!["child"]);
    }

    #[test]
    fn missing_dependency_blocks() {
        let tasks = registry(vec![due("child", 0).with_dependencies(["gone"])]);
        assert!(select_ready(&tasks, &HashMap::new(), &HashSet::new(), now()).is_empty());
    }

    #[test]
    fn override_unblocks_failed_dependency_but_not_running_one() {
        let mut dep = succeeded(due("dep", 0));
        dep.last_error = Some("boom".to_string());
        let tasks = registry(vec![dep, due("child", 0).with_dependencies(["dep"])]);
        let overrides = HashSet::from(["dep".to_string()]);

        let ready = select_ready(&tasks, &HashMap::new(), &overrides, now());
        assert_eq!(ready, vec!["child"]);

        let running = HashMap::from([("dep".to_string(), TaskState::Running)]);
        assert!(select_ready(&tasks, &running, &overrides, now()).is_empty());
    }
}
