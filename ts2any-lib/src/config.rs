//! Streamer configuration

use crate::error::{Result, StreamerError};
use crate::retry::RetryConfig;
use std::time::Duration;

/// Configuration for the event streamer
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string for the catalog side channel
    pub connection_string: String,

    /// Publication tracked tables are attached to
    pub publication_name: String,

    /// Logical replication slot name
    pub slot_name: String,

    /// Prefix for generated topic names
    pub topic_prefix: String,

    /// Table filter include patterns (`namespace.table`)
    pub include_patterns: Vec<String>,

    /// Table filter exclude patterns
    pub exclude_patterns: Vec<String>,

    /// Decision for tables no pattern matches
    pub accepted_by_default: bool,

    /// Emit a value-less tombstone event after every delete
    pub tombstones: bool,

    /// Path of the durable state file
    pub state_path: String,

    /// Whether the stats HTTP service runs
    pub stats_enabled: bool,

    /// Port of the stats HTTP service
    pub stats_port: u16,

    /// Dispatcher queue capacity; a full queue backpressures the reader
    pub dispatch_queue_size: usize,

    /// Rows per snapshot batch
    pub snapshot_batch_size: i64,

    /// Snapshot worker count
    pub snapshot_workers: usize,

    /// Maximum sink retries per event
    pub max_sink_retries: u32,

    /// Initial sink retry delay
    pub initial_retry_delay: Duration,

    /// Maximum sink retry delay
    pub max_retry_delay: Duration,

    /// Retry multiplier for exponential backoff
    pub retry_multiplier: f64,

    /// Whether to add jitter to retry delays
    pub retry_jitter: bool,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_sink_retries,
            initial_delay: self.initial_retry_delay,
            max_delay: self.max_retry_delay,
            multiplier: self.retry_multiplier,
            jitter: self.retry_jitter,
        }
    }
}

/// Builder for [`Config`]
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    connection_string: Option<String>,
    publication_name: Option<String>,
    slot_name: Option<String>,
    topic_prefix: Option<String>,
    include_patterns: Vec<String>,
    exclude_patterns: Vec<String>,
    accepted_by_default: Option<bool>,
    tombstones: Option<bool>,
    state_path: Option<String>,
    stats_enabled: Option<bool>,
    stats_port: Option<u16>,
    dispatch_queue_size: Option<usize>,
    snapshot_batch_size: Option<i64>,
    snapshot_workers: Option<usize>,
    max_sink_retries: Option<u32>,
    initial_retry_delay: Option<Duration>,
    max_retry_delay: Option<Duration>,
    retry_multiplier: Option<f64>,
    retry_jitter: Option<bool>,
}

impl ConfigBuilder {
    pub fn connection_string(mut self, value: impl Into<String>) -> Self {
        self.connection_string = Some(value.into());
        self
    }

    pub fn publication_name(mut self, value: impl Into<String>) -> Self {
        self.publication_name = Some(value.into());
        self
    }

    pub fn slot_name(mut self, value: impl Into<String>) -> Self {
        self.slot_name = Some(value.into());
        self
    }

    pub fn topic_prefix(mut self, value: impl Into<String>) -> Self {
        self.topic_prefix = Some(value.into());
        self
    }

    pub fn include_patterns(mut self, value: Vec<String>) -> Self {
        self.include_patterns = value;
        self
    }

    pub fn exclude_patterns(mut self, value: Vec<String>) -> Self {
        self.exclude_patterns = value;
        self
    }

    pub fn accepted_by_default(mut self, value: bool) -> Self {
        self.accepted_by_default = Some(value);
        self
    }

    pub fn tombstones(mut self, value: bool) -> Self {
        self.tombstones = Some(value);
        self
    }

    pub fn state_path(mut self, value: impl Into<String>) -> Self {
        self.state_path = Some(value.into());
        self
    }

    pub fn stats_enabled(mut self, value: bool) -> Self {
        self.stats_enabled = Some(value);
        self
    }

    pub fn stats_port(mut self, value: u16) -> Self {
        self.stats_port = Some(value);
        self
    }

    pub fn dispatch_queue_size(mut self, value: usize) -> Self {
        self.dispatch_queue_size = Some(value);
        self
    }

    pub fn snapshot_batch_size(mut self, value: i64) -> Self {
        self.snapshot_batch_size = Some(value);
        self
    }

    pub fn snapshot_workers(mut self, value: usize) -> Self {
        self.snapshot_workers = Some(value);
        self
    }

    pub fn max_sink_retries(mut self, value: u32) -> Self {
        self.max_sink_retries = Some(value);
        self
    }

    pub fn initial_retry_delay(mut self, value: Duration) -> Self {
        self.initial_retry_delay = Some(value);
        self
    }

    pub fn max_retry_delay(mut self, value: Duration) -> Self {
        self.max_retry_delay = Some(value);
        self
    }

    pub fn retry_multiplier(mut self, value: f64) -> Self {
        self.retry_multiplier = Some(value);
        self
    }

    pub fn retry_jitter(mut self, value: bool) -> Self {
        self.retry_jitter = Some(value);
        self
    }

    pub fn build(self) -> Result<Config> {
        let connection_string = self
            .connection_string
            .ok_or_else(|| StreamerError::config("connection string is required"))?;
        let topic_prefix = self.topic_prefix.unwrap_or_else(|| "ts2any".to_string());
        if topic_prefix.is_empty() {
            return Err(StreamerError::config("topic prefix must not be empty"));
        }

        Ok(Config {
            connection_string,
            publication_name: self
                .publication_name
                .unwrap_or_else(|| "ts2any_pub".to_string()),
            slot_name: self.slot_name.unwrap_or_else(|| "ts2any_slot".to_string()),
            topic_prefix,
            include_patterns: self.include_patterns,
            exclude_patterns: self.exclude_patterns,
            accepted_by_default: self.accepted_by_default.unwrap_or(true),
            tombstones: self.tombstones.unwrap_or(false),
            state_path: self
                .state_path
                .unwrap_or_else(|| "./ts2any_state.bin".to_string()),
            stats_enabled: self.stats_enabled.unwrap_or(true),
            stats_port: self.stats_port.unwrap_or(8081),
            dispatch_queue_size: self.dispatch_queue_size.unwrap_or(1024),
            snapshot_batch_size: self.snapshot_batch_size.unwrap_or(1000),
            snapshot_workers: self.snapshot_workers.unwrap_or(2),
            max_sink_retries: self.max_sink_retries.unwrap_or(8),
            initial_retry_delay: self
                .initial_retry_delay
                .unwrap_or_else(|| Duration::from_millis(500)),
            max_retry_delay: self
                .max_retry_delay
                .unwrap_or_else(|| Duration::from_secs(60)),
            retry_multiplier: self.retry_multiplier.unwrap_or(1.5),
            retry_jitter: self.retry_jitter.unwrap_or(true),
        })
    }
}
