//! Connection and pool configuration.

use std::time::Duration;

use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

use crate::error::{DbError, Result};

/// Default number of connections opened by [`Pool::init`](crate::Pool::init).
pub const DEFAULT_INITIAL_SIZE: usize = 10;

/// Default ceiling on connections managed by a pool.
pub const DEFAULT_MAX_SIZE: usize = 64;

/// Settings for opening a single connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    pub connection_string: String,

    /// Time allowed for a connection attempt, passed to the driver.
    #[serde(default, deserialize_with = "seconds")]
    pub connection_timeout: Option<Duration>,

    /// Time allowed for the login phase, passed to the driver.
    #[serde(default, deserialize_with = "seconds")]
    pub login_timeout: Option<Duration>,
}

impl ConnectionConfig {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            connection_timeout: None,
            login_timeout: None,
        }
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = Some(timeout);
        self
    }

    pub fn login_timeout(mut self, timeout: Duration) -> Self {
        self.login_timeout = Some(timeout);
        self
    }

    /// Parses a config object such as `{"connectionString": "...", "connectionTimeout": 5}`.
    pub fn from_object(object: Map<String, Value>) -> Result<Self> {
        let config: Self = serde_json::from_value(Value::Object(object))
            .map_err(|e| DbError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.connection_string.trim().is_empty() {
            return Err(DbError::Configuration(
                "connectionString must not be empty".into(),
            ));
        }
        Ok(())
    }
}

impl From<&str> for ConnectionConfig {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ConnectionConfig {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Configuration for the connection pool.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    pub connection_string: String,

    /// Connections opened by `init()`, and the floor kept free when
    /// `shrink` is enabled.
    #[serde(default = "default_initial_size")]
    pub initial_size: usize,

    /// Connections added per growth step. `None` means `initial_size`.
    #[serde(default)]
    pub increment_size: Option<usize>,

    /// Maximum number of connections the pool manages.
    #[serde(default = "default_max_size")]
    pub max_size: usize,

    #[serde(default, deserialize_with = "seconds")]
    pub connection_timeout: Option<Duration>,

    #[serde(default, deserialize_with = "seconds")]
    pub login_timeout: Option<Duration>,

    /// Free connections idle longer than this are closed, down to
    /// `initial_size`. Only applies when `shrink` is enabled.
    #[serde(default, deserialize_with = "seconds")]
    pub idle_timeout: Option<Duration>,

    /// When false, every returned connection is replaced.
    #[serde(default = "default_shrink")]
    pub shrink: bool,
}

fn default_initial_size() -> usize {
    DEFAULT_INITIAL_SIZE
}

fn default_max_size() -> usize {
    DEFAULT_MAX_SIZE
}

fn default_shrink() -> bool {
    true
}

fn seconds<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
}

impl PoolConfig {
    /// Create a pool configuration with default sizing.
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            initial_size: DEFAULT_INITIAL_SIZE,
            increment_size: None,
            max_size: DEFAULT_MAX_SIZE,
            connection_timeout: None,
            login_timeout: None,
            idle_timeout: None,
            shrink: true,
        }
    }

    pub fn initial_size(mut self, count: usize) -> Self {
        self.initial_size = count;
        self
    }

    pub fn increment_size(mut self, count: usize) -> Self {
        self.increment_size = Some(count);
        self
    }

    pub fn max_size(mut self, count: usize) -> Self {
        self.max_size = count;
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = Some(timeout);
        self
    }

    pub fn login_timeout(mut self, timeout: Duration) -> Self {
        self.login_timeout = Some(timeout);
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn shrink(mut self, enabled: bool) -> Self {
        self.shrink = enabled;
        self
    }

    /// Growth step actually used.
    pub fn effective_increment_size(&self) -> usize {
        self.increment_size.unwrap_or(self.initial_size)
    }

    /// The per-connection settings every pooled connection is opened with.
    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            connection_string: self.connection_string.clone(),
            connection_timeout: self.connection_timeout,
            login_timeout: self.login_timeout,
        }
    }

    /// Parses a config object such as `{"connectionString": "...", "initialSize": 4}`.
    pub fn from_object(object: Map<String, Value>) -> Result<Self> {
        let config: Self = serde_json::from_value(Value::Object(object))
            .map_err(|e| DbError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.connection_string.trim().is_empty() {
            return Err(DbError::Configuration(
                "connectionString must not be empty".into(),
            ));
        }
        if self.max_size == 0 {
            return Err(DbError::Configuration(
                "maxSize must be greater than 0".into(),
            ));
        }
        if self.initial_size > self.max_size {
            return Err(DbError::Configuration(
                "initialSize cannot be greater than maxSize".into(),
            ));
        }
        if self.effective_increment_size() == 0 {
            return Err(DbError::Configuration(
                "incrementSize must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new(String::new())
    }
}

impl From<&str> for PoolConfig {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for PoolConfig {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}
