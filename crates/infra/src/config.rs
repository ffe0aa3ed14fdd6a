//! Runtime configuration.
//!
//! Each background component takes its own config struct with defaults and
//! `with_*` builders. [`DuraqConfig::from_env`] assembles all of them from the
//! process environment for the worker binary.

use std::path::PathBuf;
use std::time::Duration;

use duraq_core::DEFAULT_MAX_ATTEMPTS;

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: `{value}` ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Consumer pool configuration.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Sleep between claim attempts when nothing is due.
    pub poll_interval: Duration,
    /// Ceiling on concurrently running handlers across all registrations.
    pub max_concurrency: usize,
    /// How long `stop` waits for in-flight handlers.
    pub shutdown_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_concurrency: 10,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl ConsumerConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Cron scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    /// Maximum jobs fired per tick.
    pub batch_size: usize,
    pub stop_timeout: Duration,
    /// Attempts granted to emitted tasks.
    pub default_max_attempts: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            batch_size: 100,
            stop_timeout: Duration::from_secs(10),
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl SchedulerConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn with_default_max_attempts(mut self, attempts: u32) -> Self {
        self.default_max_attempts = attempts;
        self
    }
}

/// Stuck-task reaper configuration.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub interval: Duration,
    /// Running tasks last attempted longer ago than this are reset.
    pub stuck_timeout: Duration,
    pub stop_timeout: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stuck_timeout: Duration::from_secs(600),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

impl ReaperConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_stuck_timeout(mut self, timeout: Duration) -> Self {
        self.stuck_timeout = timeout;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }
}

/// Whole-process configuration.
#[derive(Debug, Clone)]
pub struct DuraqConfig {
    pub database_url: String,
    pub max_connections: u32,
    /// Settings for a [`ConsumerPool`](crate::ConsumerPool) built by the
    /// embedding application. `duraq-worker` registers no handlers and
    /// never reads this.
    pub consumer: ConsumerConfig,
    pub scheduler: SchedulerConfig,
    pub reaper: ReaperConfig,
    /// JSON file with cron job definitions to register at startup.
    pub cron_file: Option<PathBuf>,
}

impl DuraqConfig {
    /// Read configuration from the process environment.
    ///
    /// | Variable | Meaning | Default |
    /// |----------|---------|---------|
    /// | `DATABASE_URL` | Postgres connection string | required |
    /// | `DURAQ_MAX_CONNECTIONS` | pool size | 10 |
    /// | `DURAQ_CONSUMER_POLL_MS` | consumer idle poll (embedders) | 1000 |
    /// | `DURAQ_MAX_CONCURRENCY` | handler ceiling (embedders) | 10 |
    /// | `DURAQ_SHUTDOWN_TIMEOUT_SECS` | consumer drain timeout (embedders) | 30 |
    /// | `DURAQ_SCHEDULER_POLL_MS` | scheduler tick | 10000 |
    /// | `DURAQ_SCHEDULER_BATCH` | jobs per tick | 100 |
    /// | `DURAQ_DEFAULT_MAX_ATTEMPTS` | attempts for emitted tasks | 3 |
    /// | `DURAQ_REAPER_INTERVAL_SECS` | reaper pass interval | 60 |
    /// | `DURAQ_STUCK_TIMEOUT_SECS` | stuck threshold | 600 |
    /// | `DURAQ_CRON_FILE` | cron job definitions | none |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_url = lookup("DATABASE_URL")
            .filter(|url| !url.trim().is_empty())
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let consumer_defaults = ConsumerConfig::default();
        let scheduler_defaults = SchedulerConfig::default();
        let reaper_defaults = ReaperConfig::default();

        let consumer = ConsumerConfig::default()
            .with_poll_interval(millis(&lookup, "DURAQ_CONSUMER_POLL_MS", consumer_defaults.poll_interval)?)
            .with_max_concurrency(number(&lookup, "DURAQ_MAX_CONCURRENCY", consumer_defaults.max_concurrency)?)
            .with_shutdown_timeout(secs(&lookup, "DURAQ_SHUTDOWN_TIMEOUT_SECS", consumer_defaults.shutdown_timeout)?);

        let scheduler = SchedulerConfig::default()
            .with_poll_interval(millis(&lookup, "DURAQ_SCHEDULER_POLL_MS", scheduler_defaults.poll_interval)?)
            .with_batch_size(number(&lookup, "DURAQ_SCHEDULER_BATCH", scheduler_defaults.batch_size)?)
            .with_default_max_attempts(number(
                &lookup,
                "DURAQ_DEFAULT_MAX_ATTEMPTS",
                scheduler_defaults.default_max_attempts,
            )?);

        let reaper = ReaperConfig::default()
            .with_interval(secs(&lookup, "DURAQ_REAPER_INTERVAL_SECS", reaper_defaults.interval)?)
            .with_stuck_timeout(secs(&lookup, "DURAQ_STUCK_TIMEOUT_SECS", reaper_defaults.stuck_timeout)?);

        Ok(Self {
            database_url,
            max_connections: number(&lookup, "DURAQ_MAX_CONNECTIONS", 10)?,
            consumer,
            scheduler,
            reaper,
            cron_file: lookup("DURAQ_CRON_FILE").map(PathBuf::from),
        })
    }
}

fn number<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
            value,
        }),
    }
}

fn millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    number(lookup, key, default_ms).map(Duration::from_millis)
}

fn secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    number(lookup, key, default.as_secs()).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = DuraqConfig::from_lookup(env(&[("DATABASE_URL", "postgres://localhost/duraq")])).unwrap();
        assert_eq!(config.consumer.poll_interval, Duration::from_secs(1));
        assert_eq!(config.consumer.max_concurrency, 10);
        assert_eq!(config.scheduler.poll_interval, Duration::from_secs(10));
        assert_eq!(config.scheduler.batch_size, 100);
        assert_eq!(config.scheduler.default_max_attempts, 3);
        assert_eq!(config.reaper.interval, Duration::from_secs(60));
        assert_eq!(config.reaper.stuck_timeout, Duration::from_secs(600));
        assert!(config.cron_file.is_none());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = DuraqConfig::from_lookup(env(&[
            ("DATABASE_URL", "postgres://db/duraq"),
            ("DURAQ_CONSUMER_POLL_MS", "250"),
            ("DURAQ_MAX_CONCURRENCY", "2"),
            ("DURAQ_SCHEDULER_BATCH", "5"),
            ("DURAQ_STUCK_TIMEOUT_SECS", "120"),
            ("DURAQ_CRON_FILE", "/etc/duraq/cron.json"),
        ]))
        .unwrap();
        assert_eq!(config.consumer.poll_interval, Duration::from_millis(250));
        assert_eq!(config.consumer.max_concurrency, 2);
        assert_eq!(config.scheduler.batch_size, 5);
        assert_eq!(config.reaper.stuck_timeout, Duration::from_secs(120));
        assert_eq!(config.cron_file, Some(PathBuf::from("/etc/duraq/cron.json")));
    }

    #[tokio::test]
    async fn consumer_settings_configure_an_embedded_pool() {
        let config = DuraqConfig::from_lookup(env(&[
            ("DATABASE_URL", "postgres://db/duraq"),
            ("DURAQ_MAX_CONCURRENCY", "4"),
            ("DURAQ_SHUTDOWN_TIMEOUT_SECS", "5"),
        ]))
        .unwrap();
        assert_eq!(config.consumer.max_concurrency, 4);
        assert_eq!(config.consumer.shutdown_timeout, Duration::from_secs(5));

        let queue = crate::Queue::new(crate::InMemoryStore::arc());
        let mut pool = crate::ConsumerPool::new(queue, config.consumer);
        pool.register("jobs.>", |_ctx: crate::TaskContext, _payload: Vec<u8>| async {
            Ok::<(), crate::HandlerError>(())
        })
        .unwrap();
        pool.start().unwrap();
        pool.stop().await.unwrap();
        assert_eq!(pool.stats().processed, 0);
    }

    #[test]
    fn missing_database_url_is_an_error() {
        let err = DuraqConfig::from_lookup(env(&[])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("DATABASE_URL"));
    }

    #[test]
    fn malformed_number_is_an_error() {
        let err = DuraqConfig::from_lookup(env(&[
            ("DATABASE_URL", "postgres://db/duraq"),
            ("DURAQ_MAX_CONCURRENCY", "lots"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "DURAQ_MAX_CONCURRENCY", .. }));
    }

    #[test]
    fn zero_concurrency_is_clamped() {
        let config = ConsumerConfig::default().with_max_concurrency(0);
        assert_eq!(config.max_concurrency, 1);
    }
}
