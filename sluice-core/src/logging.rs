//! Logging setup for applications embedding the SDK.
//!
//! The connection core only emits `tracing` events. Installing a subscriber
//! is left to the application; [`LogConfig`] is a ready-made one.
//!
//! Events carry structured fields:
//!
//! | Field | Meaning |
//! |-------|---------|
//! | `conn` | client info of the connection (`local -> remote`) |
//! | `from`, `to`, `event` | status transition |
//! | `error` | failure cause |
//!
//! Transitions are logged at `debug`, failures at `warn`, close at `info`.
//!
//! # Examples
//!
//! ```no_run
//! use sluice_core::logging::{LogConfig, LogFormat, LogLevel};
//!
//! let _guard = LogConfig::new()
//!     .level(LogLevel::Debug)
//!     .format(LogFormat::Compact)
//!     .with_env_filter("sluice_core=debug")
//!     .init()
//!     .expect("logging");
//! ```

use crate::error::{ConnectionError, Result};
use std::io;
use tracing::Level;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

/// Log verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Convert to a tracing level.
    pub fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }

    /// Level name, as accepted by `EnvFilter`.
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per line.
    Json,
    /// Human readable single line.
    Plain,
    /// Multi-line, indented.
    Pretty,
    /// Abbreviated single line.
    Compact,
}

/// Log destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    Stderr,
    /// Append to a single file.
    File(String),
    /// Daily rotated files under `directory`.
    DailyFile { directory: String, prefix: String },
}

/// Subscriber configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    pub output: LogOutput,
    /// Include the module path.
    pub targets: bool,
    pub thread_ids: bool,
    pub file_line: bool,
    /// Log span close events.
    pub spans: bool,
    pub colors: bool,
    /// Filter directives; overrides `level` and `RUST_LOG`.
    pub env_filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Json,
            output: LogOutput::Stdout,
            targets: true,
            thread_ids: false,
            file_line: false,
            spans: false,
            colors: false,
            env_filter: None,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }

    pub fn with_targets(mut self, enable: bool) -> Self {
        self.targets = enable;
        self
    }

    pub fn with_thread_ids(mut self, enable: bool) -> Self {
        self.thread_ids = enable;
        self
    }

    pub fn with_file_line(mut self, enable: bool) -> Self {
        self.file_line = enable;
        self
    }

    pub fn with_spans(mut self, enable: bool) -> Self {
        self.spans = enable;
        self
    }

    pub fn with_colors(mut self, enable: bool) -> Self {
        self.colors = enable;
        self
    }

    /// Set filter directives such as `"sluice_core=debug,tokio=warn"`.
    pub fn with_env_filter(mut self, filter: impl Into<String>) -> Self {
        self.env_filter = Some(filter.into());
        self
    }

    /// Build the level filter.
    ///
    /// Explicit directives win, then `RUST_LOG`, then `level`.
    pub fn filter(&self) -> Result<EnvFilter> {
        match &self.env_filter {
            Some(directives) => EnvFilter::try_new(directives).map_err(|e| {
                ConnectionError::Config(format!("Invalid log filter '{directives}': {e}"))
            }),
            None => Ok(EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(self.level.as_str()))),
        }
    }

    /// Install the global subscriber.
    ///
    /// Keep the returned guard alive; dropping it flushes buffered lines. A
    /// log file that cannot be opened falls back to stderr with a warning.
    /// Fails if the filter is invalid or a subscriber is already installed.
    pub fn init(self) -> Result<WorkerGuard> {
        let filter = self.filter()?;
        let (writer, guard, fallback) = self.writer();

        tracing_subscriber::registry()
            .with(self.layer(writer))
            .with(filter)
            .try_init()
            .map_err(|e| ConnectionError::Config(format!("Failed to install subscriber: {e}")))?;

        if let Some(err) = fallback {
            tracing::warn!(error = %err, "Log file unavailable, logging to stderr");
        }
        Ok(guard)
    }

    fn writer(&self) -> (NonBlocking, WorkerGuard, Option<io::Error>) {
        match &self.output {
            LogOutput::Stdout => {
                let (w, g) = tracing_appender::non_blocking(io::stdout());
                (w, g, None)
            }
            LogOutput::Stderr => {
                let (w, g) = tracing_appender::non_blocking(io::stderr());
                (w, g, None)
            }
            LogOutput::File(path) => {
                match std::fs::OpenOptions::new().create(true).append(true).open(path) {
                    Ok(file) => {
                        let (w, g) = tracing_appender::non_blocking(file);
                        (w, g, None)
                    }
                    Err(e) => {
                        let (w, g) = tracing_appender::non_blocking(io::stderr());
                        (w, g, Some(e))
                    }
                }
            }
            LogOutput::DailyFile { directory, prefix } => {
                let appender = tracing_appender::rolling::daily(directory, prefix);
                let (w, g) = tracing_appender::non_blocking(appender);
                (w, g, None)
            }
        }
    }

    fn layer(&self, writer: NonBlocking) -> Box<dyn Layer<Registry> + Send + Sync> {
        let span_events = if self.spans {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        let base = fmt::layer()
            .with_writer(writer)
            .with_target(self.targets)
            .with_thread_ids(self.thread_ids)
            .with_span_events(span_events);

        match self.format {
            LogFormat::Json => base
                .json()
                .with_current_span(self.spans)
                .with_span_list(self.spans)
                .with_file(self.file_line)
                .with_line_number(self.file_line)
                .boxed(),
            LogFormat::Plain => base
                .with_ansi(self.colors)
                .with_file(self.file_line)
                .with_line_number(self.file_line)
                .boxed(),
            LogFormat::Pretty => base
                .pretty()
                .with_ansi(self.colors)
                .with_file(self.file_line)
                .with_line_number(self.file_line)
                .boxed(),
            LogFormat::Compact => base.compact().with_ansi(self.colors).boxed(),
        }
    }
}
