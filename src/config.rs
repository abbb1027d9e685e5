use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use crate::RetryPolicy;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Scheduler settings. Durations are written as humantime strings
/// (`"100ms"`, `"5s"`) when serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How often the poll loop looks for ready tasks.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    /// Snapshot file. Persistence is off when unset.
    pub persistence_path: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_retries: retry.max_retries,
            retry_delay: retry.delay,
            persistence_path: None,
        }
    }
}

impl SchedulerConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            delay: self.retry_delay,
        }
    }

    pub(crate) fn normalized(mut self) -> Self {
        if self.poll_interval.is_zero() {
            self.poll_interval = DEFAULT_POLL_INTERVAL;
        }
        self
    }
}

pub(crate) mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert!(config.persistence_path.is_none());
    }

    #[test]
    fn deserializes_humantime_durations() {
        let config: SchedulerConfig = serde_json::from_str(
            r#"{"poll_interval": "250ms", "retry_delay": "1m 30s", "persistence_path": "/tmp/tasks.json"}"#,
        )
        .unwrap();
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.retry_delay, Duration::from_secs(90));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.persistence_path, Some(PathBuf::from("/tmp/tasks.json")));
    }

    #[test]
    fn rejects_bad_duration() {
        assert!(serde_json::from_str::<SchedulerConfig>(r#"{"retry_delay": "soon"}"#).is_err());
    }

    #[test]
    fn zero_poll_interval_is_normalized() {
        let config = SchedulerConfig {
            poll_interval: Duration::ZERO,
            ..Default::default()
        }
        .normalized();
        assert_eq!(config.poll_interval, DEFAULT_POLL_INTERVAL);
    }

    #[test]
    fn serializes_durations_as_strings() {
        let value = serde_json::to_value(SchedulerConfig::default()).unwrap();
        assert_eq!(value["poll_interval"], "100ms");
        assert_eq!(value["retry_delay"], "5s");
    }
}
