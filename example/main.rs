use schedcuter::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let state_dir = tempfile::tempdir()?;
    let snapshot = state_dir.path().join("tasks.json");

    let scheduler = Scheduler::with_config(SchedulerConfig {
        poll_interval: Duration::from_millis(50),
        max_retries: 2,
        retry_delay: Duration::from_millis(200),
        persistence_path: Some(snapshot.clone()),
    });

    scheduler
        .add_task(
            Task::new("cache-warmup", "Cache warmup", Schedule::Interval(Duration::from_secs(1)))
                .with_description("Refresh the hot key cache")
                .with_priority(TaskPriority::High)
                .with_handler(handler_fn(|_ctx| async {
                    info!("warming cache");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(())
                })),
        )
        .await?;

    // Fails on its first attempt of every run to exercise the retry path.
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);
    scheduler
        .add_task(
            Task::new("sync-sweep", "Sync sweep", Schedule::Interval(Duration::from_millis(1500)))
                .with_dependencies(["cache-warmup"])
                .with_handler(handler_fn(move |ctx: CancellationToken| {
                    let counter = Arc::clone(&counter);
                    async move {
                        if counter.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
                            return Err(SchedulerError::TaskExecution("remote timed out".to_string()));
                        }
                        tokio::select! {
                            _ = ctx.cancelled() => Err(SchedulerError::ContextCancelled("sync interrupted".to_string())),
                            _ = tokio::time::sleep(Duration::from_millis(200)) => Ok(()),
                        }
                    }
                })),
        )
        .await?;

    scheduler
        .add_task(
            Task::new("retention-cleanup", "Retention cleanup", Schedule::cron("* * * * *")?)
                .with_priority(TaskPriority::Low)
                .with_handler(handler_fn(|_ctx| async {
                    info!("pruning expired records");
                    Ok(())
                })),
        )
        .await?;

    scheduler.start()?;
    tokio::time::sleep(Duration::from_secs(4)).await;

    for task in scheduler.list_tasks().await {
        info!(
            task_id = %task.id,
            schedule = %task.schedule,
            run_count = task.run_count,
            error_count = task.error_count,
            next_run = ?task.next_run,
            "task status"
        );
    }
    info!(stats = %serde_json::to_string(&scheduler.get_stats().await)?, "scheduler stats");

    scheduler.stop().await;

    // A fresh process restores the same tasks once it registers their handlers.
    let restored = Scheduler::new();
    restored.set_persistence(&snapshot).await;
    for task_id in ["cache-warmup", "sync-sweep", "retention-cleanup"] {
        restored.register_handler(task_id, handler_fn(|_ctx| async { Ok(()) })).await;
    }
    let loaded = restored.load_tasks().await?;
    info!(loaded, path = %snapshot.display(), "tasks restored from snapshot");

    Ok(())
}
