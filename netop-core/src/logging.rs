//! Structured logging setup.
//!
//! The engine itself only emits `tracing` events and spans:
//!
//! - `operation_attempt` span per attempt (`operation_id`, `attempt`, `method`, `url`)
//! - `debug` for stage transitions, `warn` for retried failures, `error` for
//!   terminal failures
//!
//! Applications that do not bring their own subscriber can install one here.
//! `RUST_LOG` overrides the configured level.

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};

/// Crates whose events the default filter lets through.
const LOG_TARGETS: [&str; 2] = ["netop_core", "netop"];

/// Log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Per-event detail, including stale attempt reports and helper teardown.
    Trace,
    /// Stage transitions.
    Debug,
    /// Operation start and finish.
    Info,
    /// Retried failures.
    Warn,
    /// Terminal failures.
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(name)
    }
}

/// Log format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line human-readable output.
    Pretty,
    /// Single-line output.
    Compact,
    /// JSON lines.
    Json,
}

/// Log configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level.
    pub level: LogLevel,
    /// Log format.
    pub format: LogFormat,
    /// Whether to show thread IDs. Useful since transports and helpers
    /// report from arbitrary threads.
    pub show_thread_ids: bool,
    /// Whether to show target module.
    pub show_target: bool,
    /// Whether to log span enter/close, e.g. around each attempt.
    pub show_span_events: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Pretty,
            show_thread_ids: false,
            show_target: true,
            show_span_events: false,
        }
    }
}

impl LogConfig {
    /// Debug level with attempt spans.
    pub fn development() -> Self {
        Self {
            level: LogLevel::Debug,
            show_span_events: true,
            ..Self::default()
        }
    }

    /// JSON at info level with thread IDs.
    pub fn production() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Json,
            show_thread_ids: true,
            ..Self::default()
        }
    }

    /// Compact warnings only.
    pub fn test() -> Self {
        Self {
            level: LogLevel::Warn,
            format: LogFormat::Compact,
            show_thread_ids: false,
            show_target: false,
            show_span_events: false,
        }
    }

    /// The filter directive used when `RUST_LOG` is unset.
    pub fn filter_directive(&self) -> String {
        LOG_TARGETS
            .iter()
            .map(|target| format!("{target}={}", self.level))
            .collect::<Vec<_>>()
            .join(",")
    }

    fn layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.filter_directive()));
        let span_events = if self.show_span_events {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        let base = fmt::layer()
            .with_thread_ids(self.show_thread_ids)
            .with_target(self.show_target)
            .with_span_events(span_events);

        match self.format {
            LogFormat::Pretty => base.pretty().with_filter(env_filter).boxed(),
            LogFormat::Compact => base.compact().with_filter(env_filter).boxed(),
            LogFormat::Json => base.json().with_filter(env_filter).boxed(),
        }
    }
}

/// Installs a global subscriber.
///
/// # Panics
///
/// Panics if a global subscriber is already installed; use
/// [`try_init_logging`] where that can happen.
///
/// ```no_run
/// use netop_core::logging::{init_logging, LogConfig};
///
/// init_logging(&LogConfig::development());
/// ```
pub fn init_logging(config: &LogConfig) {
    tracing_subscriber::registry().with(config.layer()).init();
}

/// Installs a global subscriber unless one is already installed.
///
/// # Errors
///
/// Returns the initialization error when a subscriber already exists.
pub fn try_init_logging(config: &LogConfig) -> Result<(), TryInitError> {
    tracing_subscriber::registry().with(config.layer()).try_init()
}
