//! Worker configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use domain::{DomainError, WindowPolicy};
use event_log::LogConfig;
use pipeline::{ConsumerConfig, RetryPolicy, SchedulerConfig};

/// Worker configuration with sensible defaults.
///
/// Reads from environment variables (and a `.env` file, if present):
///
/// | Variable | Default |
/// |---|---|
/// | `HOST` / `PORT` | `0.0.0.0` / `3000` |
/// | `DATABASE_URL` | unset: in-memory log and store |
/// | `DATABASE_MAX_CONNECTIONS` | `10` |
/// | `REDIS_URL` | unset: in-memory cache |
/// | `MATCHER_URL` | unset: in-memory round-robin matcher |
/// | `MATCHER_TUTORS` | `5` (in-memory matcher only) |
/// | `MATCHER_TIMEOUT_MS` | `5000` |
/// | `LOG_PARTITIONS` | `8` |
/// | `CONSUMER_ID` | `worker-<pid>` |
/// | `POLL_TIMEOUT_MS` / `POLL_BATCH_SIZE` | `1000` / `16` |
/// | `LEASE_TTL_SECS` | `30` |
/// | `MAX_PARTITIONS_PER_MEMBER` | unset: all |
/// | `LOW_WATER_MARK` / `HIGH_WATER_MARK` | `3` / `7` |
/// | `MATERIALIZER_MAX_ATTEMPTS` | `3` |
/// | `ALLOCATOR_MAX_ATTEMPTS` | `5` |
/// | `SCHEDULER_MAX_ATTEMPTS` | `3` |
/// | `CACHE_MAX_ATTEMPTS` | `2` |
/// | `RETRY_INITIAL_DELAY_MS` | `100` |
/// | `TOP_UP_INTERVAL_SECS` | `10800` |
/// | `REPUBLISH_INTERVAL_SECS` | `30` |
/// | `LOG_FORMAT` | `text` (`json` for structured output) |
/// | `RUST_LOG` | `info` |
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,

    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub redis_url: Option<String>,
    pub matcher_url: Option<String>,
    pub matcher_tutors: usize,
    pub matcher_timeout: Duration,

    pub log_partitions: u32,
    pub consumer_id: String,
    pub poll_timeout: Duration,
    pub poll_batch_size: usize,
    pub lease_ttl: Duration,
    pub max_partitions_per_member: Option<u32>,

    pub low_water_mark: u32,
    pub high_water_mark: u32,
    pub materializer_max_attempts: u32,
    pub allocator_max_attempts: u32,
    pub scheduler_max_attempts: u32,
    pub cache_max_attempts: u32,
    pub retry_initial_delay: Duration,

    pub top_up_interval: Duration,
    pub republish_interval: Duration,
}

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

impl Config {
    /// Loads configuration from environment variables, falling back to
    /// defaults. A `.env` file is loaded first if one exists.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    /// Unparseable values fall back to their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        Self {
            host: non_empty_var(&lookup, "HOST").unwrap_or(defaults.host),
            port: parse_var(&lookup, "PORT").unwrap_or(defaults.port),
            log_level: non_empty_var(&lookup, "RUST_LOG").unwrap_or(defaults.log_level),
            log_format: parse_var(&lookup, "LOG_FORMAT").unwrap_or(defaults.log_format),

            database_url: non_empty_var(&lookup, "DATABASE_URL"),
            database_max_connections: parse_var(&lookup, "DATABASE_MAX_CONNECTIONS")
                .unwrap_or(defaults.database_max_connections),
            redis_url: non_empty_var(&lookup, "REDIS_URL"),
            matcher_url: non_empty_var(&lookup, "MATCHER_URL"),
            matcher_tutors: parse_var(&lookup, "MATCHER_TUTORS").unwrap_or(defaults.matcher_tutors),
            matcher_timeout: parse_var(&lookup, "MATCHER_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.matcher_timeout),

            log_partitions: parse_var(&lookup, "LOG_PARTITIONS").unwrap_or(defaults.log_partitions),
            consumer_id: non_empty_var(&lookup, "CONSUMER_ID").unwrap_or(defaults.consumer_id),
            poll_timeout: parse_var(&lookup, "POLL_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_timeout),
            poll_batch_size: parse_var(&lookup, "POLL_BATCH_SIZE").unwrap_or(defaults.poll_batch_size),
            lease_ttl: parse_var(&lookup, "LEASE_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.lease_ttl),
            max_partitions_per_member: parse_var(&lookup, "MAX_PARTITIONS_PER_MEMBER"),

            low_water_mark: parse_var(&lookup, "LOW_WATER_MARK").unwrap_or(defaults.low_water_mark),
            high_water_mark: parse_var(&lookup, "HIGH_WATER_MARK").unwrap_or(defaults.high_water_mark),
            materializer_max_attempts: parse_var(&lookup, "MATERIALIZER_MAX_ATTEMPTS")
                .unwrap_or(defaults.materializer_max_attempts),
            allocator_max_attempts: parse_var(&lookup, "ALLOCATOR_MAX_ATTEMPTS")
                .unwrap_or(defaults.allocator_max_attempts),
            scheduler_max_attempts: parse_var(&lookup, "SCHEDULER_MAX_ATTEMPTS")
                .unwrap_or(defaults.scheduler_max_attempts),
            cache_max_attempts: parse_var(&lookup, "CACHE_MAX_ATTEMPTS").unwrap_or(defaults.cache_max_attempts),
            retry_initial_delay: parse_var(&lookup, "RETRY_INITIAL_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_initial_delay),

            top_up_interval: parse_var(&lookup, "TOP_UP_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.top_up_interval),
            republish_interval: parse_var(&lookup, "REPUBLISH_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.republish_interval),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            partitions: self.log_partitions,
            lease_ttl: self.lease_ttl,
            max_partitions_per_member: self.max_partitions_per_member,
            ..LogConfig::default()
        }
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            member_id: self.consumer_id.clone(),
            batch_size: self.poll_batch_size,
            poll_timeout: self.poll_timeout,
            ..ConsumerConfig::default()
        }
    }

    /// Retry policy with the configured initial delay.
    pub fn retry_policy(&self, max_attempts: u32) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(max_attempts)
            .initial_delay(self.retry_initial_delay)
            .build()
    }

    /// Fails if the water marks are inconsistent.
    pub fn scheduler_config(&self) -> Result<SchedulerConfig, DomainError> {
        Ok(SchedulerConfig {
            window: WindowPolicy::new(self.low_water_mark, self.high_water_mark)?,
            retry: self.retry_policy(self.scheduler_max_attempts),
        })
    }
}

/// Parses a variable, ignoring unset and unparseable values.
fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}

fn non_empty_var(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key).filter(|v| !v.trim().is_empty())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,

            database_url: None,
            database_max_connections: 10,
            redis_url: None,
            matcher_url: None,
            matcher_tutors: 5,
            matcher_timeout: Duration::from_millis(5000),

            log_partitions: 8,
            consumer_id: format!("worker-{}", std::process::id()),
            poll_timeout: Duration::from_millis(1000),
            poll_batch_size: 16,
            lease_ttl: Duration::from_secs(30),
            max_partitions_per_member: None,

            low_water_mark: 3,
            high_water_mark: 7,
            materializer_max_attempts: 3,
            allocator_max_attempts: 5,
            scheduler_max_attempts: 3,
            cache_max_attempts: 2,
            retry_initial_delay: Duration::from_millis(100),

            top_up_interval: Duration::from_secs(10_800),
            republish_interval: Duration::from_secs(30),
        }
    }
}
