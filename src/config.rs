//! Configuration for the pub/sub client

use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{PubSubError, Result};

/// Default delay between reconnection attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Default interval between periodic lock re-acquire attempts
pub const DEFAULT_ACQUIRE_INTERVAL: Duration = Duration::from_secs(30);

/// Default grace window for releasing locks on shutdown
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default schema holding the lock table and functions
pub const DEFAULT_SCHEMA: &str = "pgip_lock";

/// Default buffer size for the inbound notification channel
pub const DEFAULT_NOTIFY_BUFFER_SIZE: usize = 1024;

/// Configuration for pub/sub behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PubSubConfig {
    /// PostgreSQL connection string, passed through to the transport
    pub conn_str: String,

    /// Delay between reconnection attempts
    pub retry_delay: Duration,

    /// Maximum reconnection attempts before a terminal error; `None` retries forever
    pub retry_limit: Option<u32>,

    /// Interval between periodic lock re-acquire attempts
    pub acquire_interval: Duration,

    /// Enable the inter-process single-listener lock
    pub single_listener: bool,

    /// Drop notifications this connection itself produced
    pub filtered: bool,

    /// Listener-everywhere, execute-once variant: all instances receive
    /// notifications, lock state stays queryable but never gates delivery
    pub execution_lock: bool,

    /// Schema holding the lock table and functions
    pub schema: String,

    /// Grace window for releasing locks on shutdown
    pub shutdown_timeout: Duration,

    /// Bounded buffer size for the inbound notification channel
    pub notify_buffer_size: usize,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            conn_str: String::new(),
            retry_delay: DEFAULT_RETRY_DELAY,
            retry_limit: None,
            acquire_interval: DEFAULT_ACQUIRE_INTERVAL,
            single_listener: true,
            filtered: false,
            execution_lock: false,
            schema: DEFAULT_SCHEMA.to_string(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            notify_buffer_size: DEFAULT_NOTIFY_BUFFER_SIZE,
        }
    }
}

impl PubSubConfig {
    /// Create a configuration for the given connection string
    pub fn new(conn_str: impl Into<String>) -> Self {
        Self {
            conn_str: conn_str.into(),
            ..Self::default()
        }
    }

    /// Create a configuration with environment overrides applied.
    ///
    /// `PGIP_SCHEMA_NAME` (legacy `SCHEMA_NAME`) overrides the lock schema;
    /// `PGIP_SHUTDOWN_TIMEOUT` (legacy `SHUTDOWN_TIMEOUT`) overrides the
    /// shutdown grace window in milliseconds.
    pub fn from_env(conn_str: impl Into<String>) -> Self {
        let mut config = Self::new(conn_str);

        if let Some(schema) = env_string("PGIP_SCHEMA_NAME").or_else(|| env_string("SCHEMA_NAME")) {
            config.schema = schema;
        }

        if let Some(ms) = env_string("PGIP_SHUTDOWN_TIMEOUT")
            .or_else(|| env_string("SHUTDOWN_TIMEOUT"))
            .and_then(|s| s.parse::<u64>().ok())
        {
            config.shutdown_timeout = Duration::from_millis(ms);
        }

        config
    }

    /// Set the delay between reconnection attempts
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Set the maximum number of reconnection attempts
    pub fn with_retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = Some(limit);
        self
    }

    /// Set the interval between periodic lock re-acquire attempts
    pub fn with_acquire_interval(mut self, interval: Duration) -> Self {
        self.acquire_interval = interval;
        self
    }

    /// Enable or disable the single-listener guarantee
    pub fn with_single_listener(mut self, enabled: bool) -> Self {
        self.single_listener = enabled;
        self
    }

    /// Enable or disable dropping of self-produced notifications
    pub fn with_filtered(mut self, enabled: bool) -> Self {
        self.filtered = enabled;
        self
    }

    /// Enable or disable the execution-lock variant
    pub fn with_execution_lock(mut self, enabled: bool) -> Self {
        self.execution_lock = enabled;
        self
    }

    /// Set the schema holding the lock table and functions
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    /// Set the shutdown grace window
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the notification channel buffer size
    pub fn with_notify_buffer_size(mut self, size: usize) -> Self {
        self.notify_buffer_size = size;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.conn_str.is_empty() {
            return Err(PubSubError::configuration("conn_str must not be empty"));
        }

        let ident = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("schema pattern is valid");
        if !ident.is_match(&self.schema) {
            return Err(PubSubError::configuration(format!(
                "schema must be a plain identifier, got {:?}",
                self.schema
            )));
        }

        if self.retry_delay.is_zero() {
            return Err(PubSubError::configuration("retry_delay must be non-zero"));
        }

        if self.acquire_interval.is_zero() {
            return Err(PubSubError::configuration(
                "acquire_interval must be non-zero",
            ));
        }

        if self.notify_buffer_size == 0 {
            return Err(PubSubError::configuration(
                "notify_buffer_size must be non-zero",
            ));
        }

        Ok(())
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PubSubConfig::new("postgresql://localhost/test");
        assert!(config.validate().is_ok());
        assert_eq!(config.retry_delay, Duration::from_millis(100));
        assert_eq!(config.retry_limit, None);
        assert_eq!(config.acquire_interval, Duration::from_secs(30));
        assert!(config.single_listener);
        assert!(!config.filtered);
        assert!(!config.execution_lock);
        assert_eq!(config.schema, "pgip_lock");
        assert_eq!(config.shutdown_timeout, Duration::from_millis(1000));
    }

    #[test]
    fn test_builder_chain() {
        let config = PubSubConfig::new("postgresql://localhost/test")
            .with_retry_delay(Duration::from_millis(250))
            .with_retry_limit(5)
            .with_single_listener(false)
            .with_filtered(true)
            .with_schema("my_locks");

        assert!(config.validate().is_ok());
        assert_eq!(config.retry_delay, Duration::from_millis(250));
        assert_eq!(config.retry_limit, Some(5));
        assert!(!config.single_listener);
        assert!(config.filtered);
        assert_eq!(config.schema, "my_locks");
    }

    #[test]
    fn test_validation() {
        let config = PubSubConfig::default();
        assert!(config.validate().is_err());

        let config = PubSubConfig::new("postgresql://localhost/test").with_schema("bad-schema");
        assert!(config.validate().is_err());

        let config = PubSubConfig::new("postgresql://localhost/test").with_schema("1starts_digit");
        assert!(config.validate().is_err());

        let config =
            PubSubConfig::new("postgresql://localhost/test").with_retry_delay(Duration::ZERO);
        assert!(config.validate().is_err());

        let config = PubSubConfig::new("postgresql://localhost/test").with_notify_buffer_size(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("PGIP_SCHEMA_NAME", "env_locks");
        std::env::set_var("PGIP_SHUTDOWN_TIMEOUT", "2500");

        let config = PubSubConfig::from_env("postgresql://localhost/test");
        assert_eq!(config.schema, "env_locks");
        assert_eq!(config.shutdown_timeout, Duration::from_millis(2500));

        std::env::remove_var("PGIP_SCHEMA_NAME");
        std::env::remove_var("PGIP_SHUTDOWN_TIMEOUT");
    }
}
