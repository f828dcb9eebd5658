//! Configuration surface of all components
//!
//! Every struct can be (de)serialized with serde, durations are expressed in milliseconds. The
//! structopt option structs at the bottom allow binaries to flatten the same settings into their
//! command line, with every flag also being readable from the environment.

use crate::handler::ErrorKind;
use crate::helpers::{duration_millis, parse_millis, Backoff};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use structopt::StructOpt;
use thiserror::Error;

/// Invalid combinations of configuration values
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    /// Zero sized connection pool
    #[error("connection pool size must be at least one")]
    PoolSize,
    /// Zero sized read batches
    #[error("batch size must be at least one")]
    BatchSize,
    /// No concurrent processing allowed at all
    #[error("concurrency must be at least one")]
    Concurrency,
    /// Zero attempts would never run the handler
    #[error("max attempts must be at least one")]
    MaxAttempts,
    /// Shrinking delays between retries
    #[error("multiplier {0} is below 1.0")]
    Multiplier(f64),
    /// Initial delay larger than its cap
    #[error("initial interval {initial:?} exceeds max interval {max:?}")]
    Intervals {
        /// Configured initial interval
        initial: Duration,
        /// Configured maximum interval
        max: Duration,
    },
    /// Suffix would produce invalid stream names
    #[error("dead-letter suffix '{0}' is empty or contains characters not allowed in topics")]
    DlqSuffix(String),
}

/// Connection settings for the backing store
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct BackendConfig {
    /// Server URL, e.g. `redis://localhost:6379/0`
    pub url: String,
    /// Username for ACL based authentication
    pub username: Option<String>,
    /// Password, overrides one given in the URL
    pub password: Option<String>,
    /// Maximum number of idle dedicated connections kept around for blocking reads
    pub pool_size: usize,
    /// Deadline for establishing a connection
    #[serde(with = "duration_millis")]
    pub connect_timeout: Duration,
    /// Deadline for a response to a non-blocking command
    #[serde(with = "duration_millis")]
    pub response_timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1/".into(),
            username: None,
            password: None,
            pool_size: 10,
            connect_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(5),
        }
    }
}

/// Bounded exponential backoff applied to failing handler invocations
///
/// Immutable once a subscription has been created.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Whether failed attempts are retried at all
    pub enabled: bool,
    /// Total number of attempts including the first one
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,
    /// Upper bound for any delay
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,
    /// Growth factor applied per attempt
    pub multiplier: f64,
    /// Spread delays randomly by up to ±10%
    pub jitter: bool,
    /// Explicit list of retryable error kinds, replacing the default classification
    pub retryable_kinds: Option<Vec<ErrorKind>>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: false,
            retryable_kinds: None,
        }
    }
}

impl RetryPolicy {
    /// Policy which never retries
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Backoff iterator yielding the delays between attempts
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.initial_interval, self.multiplier, self.max_interval)
            .with_limit(self.max_attempts.saturating_sub(1))
            .with_jitter(self.jitter)
    }

    /// Delay to wait after the given failed attempt (1-based):
    /// `min(initial_interval * multiplier^(attempt-1), max_interval)`
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff().delay(attempt)
    }

    /// Whether errors of the given kind are worth another attempt
    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        match &self.retryable_kinds {
            Some(kinds) => kinds.contains(&kind),
            None => kind.is_retryable(),
        }
    }

    /// Rejects policies which could never succeed or would shrink delays
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            Err(ConfigError::MaxAttempts)
        } else if !(self.multiplier >= 1.0) {
            Err(ConfigError::Multiplier(self.multiplier))
        } else if self.initial_interval > self.max_interval {
            Err(ConfigError::Intervals {
                initial: self.initial_interval,
                max: self.max_interval,
            })
        } else {
            Ok(())
        }
    }
}

/// Dead-letter queue settings
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct DlqConfig {
    /// Whether terminal failures are moved into the dead-letter queue
    pub enabled: bool,
    /// Appended to the topic to form the name of its dead-letter stream
    pub suffix: String,
    /// Approximate number of entries retained per dead-letter stream, unbounded if absent
    pub max_length: Option<usize>,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            suffix: ".dlq".into(),
            max_length: None,
        }
    }
}

impl DlqConfig {
    /// Name of the dead-letter stream for a topic
    pub fn stream_for(&self, topic: &str) -> String {
        format!("{}{}", topic, self.suffix)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let legal = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || "._-".contains(c);

        if self.suffix.is_empty() || !self.suffix.chars().all(legal) {
            Err(ConfigError::DlqSuffix(self.suffix.clone()))
        } else {
            Ok(())
        }
    }
}

/// Settings of a consumer-group subscription loop
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Maximum number of entries fetched per read
    pub batch_size: usize,
    /// How long a read waits for new entries
    #[serde(with = "duration_millis")]
    pub block_time: Duration,
    /// Deadline for a single handler invocation including its retries
    #[serde(with = "duration_millis")]
    pub process_timeout: Duration,
    /// Number of entries processed concurrently
    pub concurrency: usize,
    /// Acknowledge entries on receipt instead of after successful processing
    pub auto_ack: bool,
    /// Stable consumer name which allows resuming pending entries after a restart,
    /// a random one is generated if absent
    pub consumer_name: Option<String>,
    /// Pause after a failed read before trying again
    #[serde(with = "duration_millis")]
    pub read_error_backoff: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            block_time: Duration::from_secs(2),
            process_timeout: Duration::from_secs(30),
            concurrency: 1,
            auto_ack: false,
            consumer_name: None,
            read_error_backoff: Duration::from_secs(1),
        }
    }
}

impl ConsumerConfig {
    /// Checks for values which would prevent the loop from making progress
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            Err(ConfigError::BatchSize)
        } else if self.concurrency == 0 {
            Err(ConfigError::Concurrency)
        } else {
            Ok(())
        }
    }
}

/// Publisher settings
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(default)]
pub struct PublisherConfig {
    /// Approximate number of entries retained per topic stream, unbounded if absent
    pub max_stream_length: Option<usize>,
    /// Name written into the `source_service` metadata of every message
    pub service_name: Option<String>,
    /// Content type written into messages that do not carry one
    pub content_type: Option<String>,
}

/// Aggregate configuration of a [`Client`](crate::client::Client)
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Backing store connection
    pub backend: BackendConfig,
    /// Publishing behaviour
    pub publisher: PublisherConfig,
    /// Default settings for subscriptions
    pub consumer: ConsumerConfig,
    /// Default retry policy for subscriptions
    pub retry: RetryPolicy,
    /// Dead-letter queue settings
    pub dlq: DlqConfig,
    /// Whether metrics are additionally persisted into the backing Redis instance
    pub persist_metrics: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            publisher: PublisherConfig::default(),
            consumer: ConsumerConfig::default(),
            retry: RetryPolicy::default(),
            dlq: DlqConfig::default(),
            persist_metrics: true,
        }
    }
}

impl ClientConfig {
    /// Rejects nonsensical values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend.pool_size == 0 {
            return Err(ConfigError::PoolSize);
        }

        self.consumer.validate()?;
        self.retry.validate()?;
        self.dlq.validate()
    }
}

/// Options for connecting to the Redis server
#[derive(Debug, StructOpt)]
pub struct RedisOptions {
    /// Redis database server URL
    #[structopt(
        short = "r",
        long = "redis",
        env = "REDIS",
        global = true,
        default_value = "redis://127.0.0.1/",
        value_name = "url"
    )]
    pub url: String,

    /// Username for ACL authentication
    #[structopt(long = "redis-username", env = "REDIS_USERNAME", global = true)]
    pub username: Option<String>,

    /// Password for authentication
    #[structopt(long = "redis-password", env = "REDIS_PASSWORD", global = true, hide_env_values = true)]
    pub password: Option<String>,

    /// Maximum number of idle dedicated connections
    #[structopt(long, env, global = true, default_value = "10")]
    pub pool_size: usize,

    /// Connection timeout in milliseconds
    #[structopt(long, env, global = true, default_value = "5000", parse(try_from_str = parse_millis), value_name = "ms")]
    pub connect_timeout: Duration,

    /// Response timeout in milliseconds
    #[structopt(long, env, global = true, default_value = "5000", parse(try_from_str = parse_millis), value_name = "ms")]
    pub response_timeout: Duration,
}

impl From<RedisOptions> for BackendConfig {
    fn from(options: RedisOptions) -> Self {
        Self {
            url: options.url,
            username: options.username,
            password: options.password,
            pool_size: options.pool_size,
            connect_timeout: options.connect_timeout,
            response_timeout: options.response_timeout,
        }
    }
}

/// Options controlling the retry behaviour of handlers
#[derive(Debug, StructOpt)]
pub struct RetryOptions {
    /// Disable retries
    #[structopt(long, env)]
    pub no_retry: bool,

    /// Total number of attempts per delivery
    #[structopt(long, env, default_value = "3")]
    pub max_attempts: u32,

    /// Delay after the first failure in milliseconds
    #[structopt(long, env, default_value = "100", parse(try_from_str = parse_millis), value_name = "ms")]
    pub initial_interval: Duration,

    /// Upper bound for delays in milliseconds
    #[structopt(long, env, default_value = "10000", parse(try_from_str = parse_millis), value_name = "ms")]
    pub max_interval: Duration,

    /// Growth factor of delays
    #[structopt(long, env, default_value = "2.0")]
    pub multiplier: f64,

    /// Randomly spread delays by up to ±10%
    #[structopt(long, env)]
    pub jitter: bool,
}

impl From<RetryOptions> for RetryPolicy {
    fn from(options: RetryOptions) -> Self {
        Self {
            enabled: !options.no_retry,
            max_attempts: options.max_attempts,
            initial_interval: options.initial_interval,
            max_interval: options.max_interval,
            multiplier: options.multiplier,
            jitter: options.jitter,
            retryable_kinds: None,
        }
    }
}

/// Options of a consumer-group subscription
#[derive(Debug, StructOpt)]
pub struct ConsumerOptions {
    /// Unique and stable identifier for this consumer.
    /// It is used to resume pending work after a crash
    /// or deliberate restart, thus it should not change
    /// across executions!
    #[structopt(long = "consumer", env = "CONSUMER_NAME")]
    pub consumer_name: Option<String>,

    /// Maximum number of entries fetched at once
    #[structopt(long, env, default_value = "10")]
    pub batch_size: usize,

    /// Time a read waits for new entries in milliseconds
    #[structopt(long, env, default_value = "2000", parse(try_from_str = parse_millis), value_name = "ms")]
    pub block_time: Duration,

    /// Deadline for processing one entry in milliseconds
    #[structopt(long, env, default_value = "30000", parse(try_from_str = parse_millis), value_name = "ms")]
    pub process_timeout: Duration,

    /// Number of entries processed concurrently
    #[structopt(long, env, default_value = "1")]
    pub concurrency: usize,

    /// Acknowledge entries on receipt, risking loss on failure
    #[structopt(long, env)]
    pub auto_ack: bool,
}

impl From<ConsumerOptions> for ConsumerConfig {
    fn from(options: ConsumerOptions) -> Self {
        Self {
            batch_size: options.batch_size,
            block_time: options.block_time,
            process_timeout: options.process_timeout,
            concurrency: options.concurrency,
            auto_ack: options.auto_ack,
            consumer_name: options.consumer_name,
            ..Default::default()
        }
    }
}

/// Options of the dead-letter queue
#[derive(Debug, StructOpt)]
pub struct DlqOptions {
    /// Do not move failed messages into the dead-letter queue
    #[structopt(long, env)]
    pub no_dlq: bool,

    /// Suffix forming the dead-letter stream name from a topic
    #[structopt(long, env, global = true, default_value = ".dlq")]
    pub dlq_suffix: String,

    /// Approximate number of entries kept per dead-letter stream
    #[structopt(long, env)]
    pub dlq_max_length: Option<usize>,
}

impl From<DlqOptions> for DlqConfig {
    fn from(options: DlqOptions) -> Self {
        Self {
            enabled: !options.no_dlq,
            suffix: options.dlq_suffix,
            max_length: options.dlq_max_length,
        }
    }
}
