//! Connection configuration.
//!
//! ```rust
//! use sluice_core::ConnectionConfig;
//! use std::time::Duration;
//!
//! let config = ConnectionConfig::builder()
//!     .connect_timeout(Duration::from_secs(5))
//!     .request_timeout(Duration::from_secs(2))
//!     .expect_response(false)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.idle_time, Duration::from_secs(60));
//! ```

use crate::error::{ConnectionError, Result};
use crate::tuning::TcpConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for a single connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Time allowed for a connect to complete.
    #[serde(with = "duration_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    /// Deadline covering a write and its response. None = no deadline.
    #[serde(with = "duration_serde::option", default)]
    pub request_timeout: Option<Duration>,
    /// Idle time before a free connection is probed.
    #[serde(with = "duration_serde", default = "default_idle_time")]
    pub idle_time: Duration,
    /// Keep-alive tick period.
    #[serde(with = "duration_serde", default = "default_detection_interval")]
    pub detection_interval: Duration,
    /// Whether writes wait for a response frame unless told otherwise.
    #[serde(default = "default_expect_response")]
    pub expect_response: bool,
    /// Initial receive block size in bytes.
    #[serde(default = "default_receive_block_size")]
    pub receive_block_size: usize,
    /// Largest response frame accepted.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// Time after a failure before the connection may be retried.
    #[serde(with = "duration_serde", default = "default_retry_interval")]
    pub retry_interval: Duration,
    /// Socket options.
    #[serde(default)]
    pub tcp: TcpConfig,
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(20)
}

fn default_idle_time() -> Duration {
    Duration::from_secs(60)
}

fn default_detection_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_expect_response() -> bool {
    true
}

fn default_receive_block_size() -> usize {
    64 * 1024
}

fn default_max_frame_size() -> usize {
    4 * 1024 * 1024
}

fn default_retry_interval() -> Duration {
    Duration::from_secs(1)
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            request_timeout: None,
            idle_time: default_idle_time(),
            detection_interval: default_detection_interval(),
            expect_response: default_expect_response(),
            receive_block_size: default_receive_block_size(),
            max_frame_size: default_max_frame_size(),
            retry_interval: default_retry_interval(),
            tcp: TcpConfig::default(),
        }
    }
}

impl ConnectionConfig {
    /// Create a builder.
    pub fn builder() -> ConnectionConfigBuilder {
        ConnectionConfigBuilder::new()
    }

    /// Create a builder seeded from `SLUICE_*` environment variables.
    ///
    /// Unset or unparsable variables keep their defaults.
    pub fn from_env() -> ConnectionConfigBuilder {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ConnectionConfigBuilder {
        let millis = |key: &str| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
        };
        let size = |key: &str| lookup(key).and_then(|v| v.trim().parse::<usize>().ok());

        let mut builder = ConnectionConfigBuilder::new();

        if let Some(d) = millis("SLUICE_CONNECT_TIMEOUT_MS") {
            builder = builder.connect_timeout(d);
        }
        if let Some(d) = millis("SLUICE_REQUEST_TIMEOUT_MS") {
            builder = builder.request_timeout(d);
        }
        if let Some(d) = millis("SLUICE_IDLE_TIME_MS") {
            builder = builder.idle_time(d);
        }
        if let Some(d) = millis("SLUICE_DETECTION_INTERVAL_MS") {
            builder = builder.detection_interval(d);
        }
        if let Some(n) = size("SLUICE_RECEIVE_BLOCK_SIZE") {
            builder = builder.receive_block_size(n);
        }
        if let Some(n) = size("SLUICE_MAX_FRAME_SIZE") {
            builder = builder.max_frame_size(n);
        }
        if let Some(d) = millis("SLUICE_RETRY_INTERVAL_MS") {
            builder = builder.retry_interval(d);
        }
        if let Some(v) = lookup("SLUICE_EXPECT_RESPONSE")
            && let Some(flag) = parse_bool(&v)
        {
            builder = builder.expect_response(flag);
        }

        builder
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ConnectionError::Config(format!("Failed to parse TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConnectionError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Check the configuration for values the connection cannot run with.
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("connect_timeout", self.connect_timeout),
            ("idle_time", self.idle_time),
            ("detection_interval", self.detection_interval),
        ];
        for (name, value) in nonzero {
            if value.is_zero() {
                return Err(ConnectionError::Config(format!("{name} must be non-zero")));
            }
        }
        if self.request_timeout.is_some_and(|d| d.is_zero()) {
            return Err(ConnectionError::Config(
                "request_timeout must be non-zero when set".into(),
            ));
        }
        if self.receive_block_size == 0 {
            return Err(ConnectionError::Config(
                "receive_block_size must be non-zero".into(),
            ));
        }
        if self.max_frame_size < self.receive_block_size {
            return Err(ConnectionError::Config(format!(
                "max_frame_size ({}) is smaller than receive_block_size ({})",
                self.max_frame_size, self.receive_block_size
            )));
        }
        Ok(())
    }
}

/// Durations as `"500ms"`, `"20s"`, `"1m"`, `"1h"`, or a bare number of
/// seconds. `"us"` and `"ns"` cover sub-millisecond values.
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer, de};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    impl Raw {
        fn into_duration<E: de::Error>(self) -> Result<Duration, E> {
            match self {
                Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
                Raw::Text(text) => parse(&text).map_err(E::custom),
            }
        }
    }

    pub(crate) fn parse(text: &str) -> Result<Duration, String> {
        let text = text.trim();
        let split = text.find(|c: char| !c.is_ascii_digit()).unwrap_or(text.len());
        let (number, unit) = text.split_at(split);
        let value: u64 = number
            .parse()
            .map_err(|_| format!("invalid duration `{text}`"))?;
        match unit.trim() {
            "ns" => Ok(Duration::from_nanos(value)),
            "us" => Ok(Duration::from_micros(value)),
            "ms" => Ok(Duration::from_millis(value)),
            "" | "s" => Ok(Duration::from_secs(value)),
            "m" => Ok(Duration::from_secs(value.saturating_mul(60))),
            "h" => Ok(Duration::from_secs(value.saturating_mul(3600))),
            other => Err(format!("unknown duration unit `{other}` in `{text}`")),
        }
    }

    pub(crate) fn format(duration: Duration) -> String {
        let ns = duration.as_nanos();
        if ns % 1000 != 0 {
            return format!("{ns}ns");
        }
        let us = duration.as_micros();
        if us % 1000 != 0 {
            return format!("{us}us");
        }
        let ms = duration.as_millis();
        if ms % 1000 != 0 {
            return format!("{ms}ms");
        }
        let secs = ms / 1000;
        if secs != 0 && secs % 3600 == 0 {
            format!("{}h", secs / 3600)
        } else if secs != 0 && secs % 60 == 0 {
            format!("{}m", secs / 60)
        } else {
            format!("{secs}s")
        }
    }

    pub(crate) fn serialize<S: Serializer>(
        duration: &Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(*duration))
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Duration, D::Error> {
        Raw::deserialize(deserializer)?.into_duration()
    }

    pub(crate) mod option {
        use super::{Raw, format};
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub(crate) fn serialize<S: Serializer>(
            duration: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match duration {
                Some(d) => serializer.serialize_some(&format(*d)),
                None => serializer.serialize_none(),
            }
        }

        pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<Raw>::deserialize(deserializer)?
                .map(Raw::into_duration)
                .transpose()
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Builder for [`ConnectionConfig`].
#[derive(Debug, Clone, Default)]
pub struct ConnectionConfigBuilder {
    config: ConnectionConfig,
}

impl ConnectionConfigBuilder {
    /// Create a builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the request deadline.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = Some(timeout);
        self
    }

    /// Set the idle threshold.
    pub fn idle_time(mut self, idle: Duration) -> Self {
        self.config.idle_time = idle;
        self
    }

    /// Set the keep-alive tick period.
    pub fn detection_interval(mut self, interval: Duration) -> Self {
        self.config.detection_interval = interval;
        self
    }

    /// Set the default response expectation.
    pub fn expect_response(mut self, expect: bool) -> Self {
        self.config.expect_response = expect;
        self
    }

    /// Set the initial receive block size.
    pub fn receive_block_size(mut self, size: usize) -> Self {
        self.config.receive_block_size = size;
        self
    }

    /// Set the largest accepted response frame.
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Set the retry interval.
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.config.retry_interval = interval;
        self
    }

    /// Set socket options.
    pub fn tcp(mut self, tcp: TcpConfig) -> Self {
        self.config.tcp = tcp;
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<ConnectionConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
