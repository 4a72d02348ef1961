use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{WorkerError, WorkerResult};

/// Poll intervals below this are raised to it
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Configuration for the worker pool
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Number of concurrent polling loops
    pub workers: usize,
    /// Base delay between polls
    pub poll_interval: Duration,
    /// Share of workers (0-100) that poll at a constant interval
    pub active_poll_percent: f64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            poll_interval: Duration::from_secs(1),
            active_poll_percent: 20.0,
        }
    }
}

impl WorkerConfig {
    /// Read `WORKER_COUNT`, `WORKER_POLL_INTERVAL_MS` and
    /// `WORKER_ACTIVE_POLL_PERCENT`, falling back to defaults.
    pub fn from_env() -> WorkerResult<Self> {
        let defaults = Self::default();
        let config = Self {
            workers: env_parse("WORKER_COUNT", defaults.workers)?,
            poll_interval: Duration::from_millis(env_parse(
                "WORKER_POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )?),
            active_poll_percent: env_parse("WORKER_ACTIVE_POLL_PERCENT", defaults.active_poll_percent)?,
        };
        config.sanitize()
    }

    /// Clamp values into their valid ranges.
    pub fn sanitize(mut self) -> WorkerResult<Self> {
        if !(0.0..=100.0).contains(&self.active_poll_percent) {
            return Err(WorkerError::InvalidConfig(format!(
                "active poll percent must be within 0-100, got {}",
                self.active_poll_percent
            )));
        }

        self.workers = self.workers.max(1);
        self.poll_interval = self.poll_interval.max(MIN_POLL_INTERVAL);
        Ok(self)
    }

    /// Number of workers that use the constant poll interval
    pub fn active_poll_workers(&self) -> usize {
        let active = (self.workers as f64 * self.active_poll_percent / 100.0).ceil() as usize;
        active.min(self.workers)
    }
}

#[cfg(feature = "postgres")]
pub(crate) fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> WorkerResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| WorkerError::InvalidConfig(format!("{key}: {e}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_clamps_values() {
        let config = WorkerConfig {
            workers: 0,
            poll_interval: Duration::from_millis(5),
            active_poll_percent: 20.0,
        }
        .sanitize()
        .unwrap();

        assert_eq!(config.workers, 1);
        assert_eq!(config.poll_interval, MIN_POLL_INTERVAL);
    }

    #[test]
    fn sanitize_rejects_bad_percent() {
        let err = WorkerConfig {
            active_poll_percent: 150.0,
            ..WorkerConfig::default()
        }
        .sanitize()
        .unwrap_err();
        assert!(matches!(err, WorkerError::InvalidConfig(_)));
    }

    #[test]
    fn active_poll_workers_rounds_up() {
        let config = |workers, pct| WorkerConfig {
            workers,
            poll_interval: Duration::from_secs(1),
            active_poll_percent: pct,
        };

        assert_eq!(config(1, 20.0).active_poll_workers(), 1);
        assert_eq!(config(10, 20.0).active_poll_workers(), 2);
        assert_eq!(config(3, 50.0).active_poll_workers(), 2);
        assert_eq!(config(4, 0.0).active_poll_workers(), 0);
        assert_eq!(config(4, 100.0).active_poll_workers(), 4);
    }

    #[test]
    fn env_parse_reports_key() {
        std::env::set_var("DOG_WORKER_TEST_BAD_COUNT", "many");
        let err = env_parse::<usize>("DOG_WORKER_TEST_BAD_COUNT", 1).unwrap_err();
        assert!(err.to_string().contains("DOG_WORKER_TEST_BAD_COUNT"));
        assert_eq!(env_parse::<usize>("DOG_WORKER_TEST_UNSET", 7).unwrap(), 7);
    }
}
