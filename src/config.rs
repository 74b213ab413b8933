//! Facade configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Configuration for an [`AsyncJournal`](crate::AsyncJournal).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    /// Entries buffered between the producer thread and the consumer.
    /// `1` turns the bridge into a strict handoff.
    /// Default: 256
    pub capacity: usize,

    /// Upper bound on how long a parked producer waits before it re-checks
    /// for a close request.
    /// Default: 100 ms
    pub poll_interval_ms: u64,

    /// What `follow()` does when the journal is invalidated.
    /// Default: report
    pub invalidation: InvalidationPolicy,

    /// Where blocking reader calls run.
    /// Default: the runtime's blocking pool
    pub executor: ExecutorKind,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            poll_interval_ms: 100,
            invalidation: InvalidationPolicy::Report,
            executor: ExecutorKind::Shared,
        }
    }
}

impl JournalConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::InvalidConfig("capacity must be at least 1".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "poll_interval_ms must be at least 1".into(),
            ));
        }
        if let ExecutorKind::Dedicated { threads: 0 } = self.executor {
            return Err(Error::InvalidConfig(
                "dedicated executor needs threads".into(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX).max(1);
        self
    }

    pub fn with_invalidation(mut self, policy: InvalidationPolicy) -> Self {
        self.invalidation = policy;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationPolicy {
    /// Surface `Error::Invalidated` and stop; the caller reopens.
    #[default]
    Report,
    /// Reopen the last target, re-seek to the last delivered entry and keep
    /// following.
    Reopen,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutorKind {
    #[default]
    Shared,
    Dedicated { threads: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config: JournalConfig =
            serde_json::from_str(r#"{"capacity": 8, "invalidation": "reopen"}"#).unwrap();
        assert_eq!(config.capacity, 8);
        assert_eq!(config.poll_interval_ms, 100);
        assert_eq!(config.invalidation, InvalidationPolicy::Reopen);
        assert_eq!(config.executor, ExecutorKind::Shared);
    }

    #[test]
    fn dedicated_executor_parses() {
        let config: JournalConfig =
            serde_json::from_str(r#"{"executor": {"type": "dedicated", "threads": 4}}"#).unwrap();
        assert_eq!(config.executor, ExecutorKind::Dedicated { threads: 4 });
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let config = JournalConfig::default().with_capacity(0);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn load_reads_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.json");
        std::fs::write(&path, r#"{"capacity": 1, "poll_interval_ms": 5}"#).unwrap();
        let config = JournalConfig::load(&path).unwrap();
        assert_eq!(config.capacity, 1);
        assert_eq!(config.poll_interval(), Duration::from_millis(5));
    }
}
