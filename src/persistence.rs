//! JSON snapshots of the task registry.
//!
//! Handlers are not part of the snapshot. After loading, each entry needs a
//! handler registered under the same task ID.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use crate::{CronSchedule, Schedule, SchedulerError, Task};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedSchedule {
    #[serde(rename = "type")]
    pub kind: String,
    /// Humantime duration, e.g. `"5m"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_spec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub times: Option<Vec<DateTime<Utc>>>,
}

impl From<&Schedule> for SerializedSchedule {
    fn from(schedule: &Schedule) -> Self {
        let mut serialized = SerializedSchedule {
            kind: schedule.kind().to_string(),
            interval: None,
            cron_spec: None,
            times: None,
        };
        match schedule {
            Schedule::Interval(interval) => {
                serialized.interval = Some(humantime::format_duration(*interval).to_string());
            }
            Schedule::Once(times) => serialized.times = Some(times.clone()),
            Schedule::Cron(cron) => serialized.cron_spec = Some(cron.spec().to_string()),
        }
        serialized
    }
}

impl TryFrom<SerializedSchedule> for Schedule {
    type Error = SchedulerError;

    fn try_from(serialized: SerializedSchedule) -> Result<Self, Self::Error> {
        let schedule = match serialized.kind.as_str() {
            "interval" => {
                let interval = serialized.interval.ok_or_else(|| {
                    SchedulerError::InvalidSchedule("interval schedule without interval".to_string())
                })?;
                let interval = humantime::parse_duration(&interval).map_err(|e| {
                    SchedulerError::InvalidSchedule(format!("failed to parse interval {interval:?}: {e}"))
                })?;
                Schedule::Interval(interval)
            }
            "once" => Schedule::Once(serialized.times.ok_or_else(|| {
                SchedulerError::InvalidSchedule("once schedule without times".to_string())
            })?),
            "cron" => {
                let spec = serialized.cron_spec.ok_or_else(|| {
                    SchedulerError::InvalidSchedule("cron schedule without cron_spec".to_string())
                })?;
                Schedule::Cron(CronSchedule::parse(&spec)?)
            }
            other => {
                return Err(SchedulerError::InvalidSchedule(format!(
                    "unknown schedule type: {other}"
                )));
            }
        };
        schedule.validate()?;
        Ok(schedule)
    }
}

/// A [`Task`] without its handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedTask {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub schedule: SerializedSchedule,
    pub enabled: bool,
    pub priority: i32,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub run_count: u64,
    #[serde(default)]
    pub error_count: u64,
}

impl SerializedTask {
    pub fn from_task(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            name: task.name.clone(),
            description: task.description.clone(),
            schedule: SerializedSchedule::from(&task.schedule),
            enabled: task.enabled,
            priority: task.priority,
            dependencies: task.dependencies.clone(),
            last_run: task.last_run,
            next_run: task.next_run,
            run_count: task.run_count,
            error_count: task.error_count,
        }
    }

    /// Rebuilds the task. The result has no handler attached.
    pub fn into_task(self) -> Result<Task, SchedulerError> {
        if self.id.is_empty() {
            return Err(SchedulerError::EmptyTaskId);
        }
        let schedule = Schedule::try_from(self.schedule)?;
        Ok(Task {
            id: self.id,
            name: self.name,
            description: self.description,
            handler: None,
            schedule,
            enabled: self.enabled,
            priority: self.priority,
            dependencies: self.dependencies,
            last_run: self.last_run,
            next_run: self.next_run,
            run_count: self.run_count,
            error_count: self.error_count,
            last_error: None,
        })
    }
}

pub struct TaskPersistence {
    path: PathBuf,
    lock: Mutex<()>,
}

impl TaskPersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the snapshot to a sibling temp file, then renames it over the
    /// target so readers never observe a partial file.
    pub async fn save(&self, tasks: &HashMap<String, Task>) -> Result<(), SchedulerError> {
        let mut serialized: Vec<SerializedTask> = tasks.values().map(SerializedTask::from_task).collect();
        serialized.sort_by(|a, b| a.id.cmp(&b.id));
        let data = serde_json::to_vec_pretty(&serialized)?;

        let _guard = self.lock.lock().await;

        if let Some(dir) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir).await?;
        }

        let mut temp_name = self.path.file_name().unwrap_or_default().to_os_string();
        temp_name.push(".tmp");
        let temp_path = self.path.with_file_name(temp_name);

        fs::write(&temp_path, &data).await?;
        if let Err(e) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        Ok(())
    }

    /// Returns an empty list when no snapshot exists yet.
    pub async fn load(&self) -> Result<Vec<SerializedTask>, SchedulerError> {
        let _guard = self.lock.lock().await;

        let data = match fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        Ok(serde_json::from_slice(&data)?)
    }

    pub async fn delete(&self) -> Result<(), SchedulerError> {
        let _guard = self.lock.lock().await;

        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
