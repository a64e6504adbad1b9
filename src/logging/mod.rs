//! Logging configuration and initialization
//!
//! Centralized `tracing` setup for replicaforge. Output is human-readable
//! or JSON on stderr, optionally mirrored as JSON into a log file.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Standard tracing filter (e.g., "info", "debug,replicaforge=trace")
//! - `REPLICAFORGE_LOG_LEVEL`: Simple log level (error, warn, info, debug, trace)
//! - `REPLICAFORGE_LOG_FORMAT`: Output format ("human" or "json")
//! - `REPLICAFORGE_LOG_FILE`: Optional file path for log output (JSON format)

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing::Subscriber;
use tracing_subscriber::{
    fmt::{
        self,
        format::{FmtSpan, Format, Json, JsonFields},
    },
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Set once the global subscriber is installed
static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Environment variable for log level override
pub const LOG_LEVEL_ENV: &str = "REPLICAFORGE_LOG_LEVEL";

/// Environment variable for log format (json/human)
pub const LOG_FORMAT_ENV: &str = "REPLICAFORGE_LOG_FORMAT";

/// Environment variable for log file path
pub const LOG_FILE_ENV: &str = "REPLICAFORGE_LOG_FILE";

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter: {0}")]
    InvalidFilter(String),

    #[error("failed to create log directory: {0}")]
    DirectoryCreationFailed(String),

    #[error("failed to open log file: {0}")]
    FileOpenFailed(String),

    /// Another global subscriber was installed first
    #[error("failed to install subscriber: {0}")]
    InstallFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "error" => Some(LogLevel::Error),
            "warn" | "warning" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    pub fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable colored output
    #[default]
    Human,
    /// JSON structured output
    Json,
}

impl LogFormat {
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "human" | "pretty" | "console" => Some(LogFormat::Human),
            "json" | "structured" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    /// Include file/line in console output
    pub with_file_info: bool,
    /// Emit an event when each span closes
    pub with_span_events: bool,
    /// Mirror output as JSON into this file
    pub log_file: Option<PathBuf>,
}

impl LoggingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration described by the `REPLICAFORGE_LOG_*` variables;
    /// unset or unparsable values keep their defaults
    pub fn from_env() -> Self {
        let mut config = Self::new();
        if let Some(level) = std::env::var(LOG_LEVEL_ENV)
            .ok()
            .and_then(|s| LogLevel::from_str(&s))
        {
            config.level = level;
        }
        if let Some(format) = std::env::var(LOG_FORMAT_ENV)
            .ok()
            .and_then(|s| LogFormat::from_str(&s))
        {
            config.format = format;
        }
        config.log_file = std::env::var_os(LOG_FILE_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        config
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file_info(mut self, with_file_info: bool) -> Self {
        self.with_file_info = with_file_info;
        self
    }

    pub fn with_span_events(mut self, with_span_events: bool) -> Self {
        self.with_span_events = with_span_events;
        self
    }

    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }
}

/// Initialize logging from the environment, ignoring failures.
///
/// Idempotent: only the first successful call installs a subscriber.
pub fn init_logging_default() {
    init_logging(&LoggingConfig::from_env()).ok();
}

/// Install the global subscriber described by `config`.
///
/// Idempotent: once a subscriber is installed, later calls return `Ok`
/// without changing anything.
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingError> {
    TRACING_INITIALIZED
        .get_or_try_init(|| install(config))
        .map(|_| ())
}

pub fn is_initialized() -> bool {
    TRACING_INITIALIZED.get().is_some()
}

fn install(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = build_env_filter(config.level)?;
    let result = match config.format {
        LogFormat::Json => {
            let console = fmt::layer()
                .json()
                .with_target(false)
                .with_file(config.with_file_info)
                .with_line_number(config.with_file_info)
                .with_span_events(span_events(config.with_span_events));
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(file_layer(config)?)
                .try_init()
        }
        LogFormat::Human => {
            let console = fmt::layer()
                .with_target(true)
                .with_thread_names(true)
                .with_file(config.with_file_info)
                .with_line_number(config.with_file_info)
                .with_span_events(span_events(config.with_span_events));
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(file_layer(config)?)
                .try_init()
        }
    };
    result.map_err(|e| LoggingError::InstallFailed(e.to_string()))
}

fn span_events(enabled: bool) -> FmtSpan {
    if enabled {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    }
}

type FileLayer<S> = fmt::Layer<S, JsonFields, Format<Json>, Mutex<File>>;

/// JSON layer writing to the configured log file, if any
fn file_layer<S>(config: &LoggingConfig) -> Result<Option<FileLayer<S>>, LoggingError>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let Some(path) = &config.log_file else {
        return Ok(None);
    };
    let file = open_log_file(path)?;
    Ok(Some(
        fmt::layer()
            .json()
            .with_writer(Mutex::new(file))
            .with_target(false)
            .with_file(true)
            .with_line_number(true)
            .with_thread_names(true)
            .with_ansi(false)
            .with_span_events(span_events(config.with_span_events)),
    ))
}

/// Open `path` for appending, creating parent directories as needed
fn open_log_file(path: &Path) -> Result<File, LoggingError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| LoggingError::DirectoryCreationFailed(e.to_string()))?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| LoggingError::FileOpenFailed(format!("{}: {}", path.display(), e)))
}

/// `RUST_LOG` wins; otherwise `REPLICAFORGE_LOG_LEVEL`, then `default_level`
fn build_env_filter(default_level: LogLevel) -> Result<EnvFilter, LoggingError> {
    if let Ok(rust_log) = std::env::var("RUST_LOG") {
        return EnvFilter::try_new(rust_log).map_err(|e| LoggingError::InvalidFilter(e.to_string()));
    }
    let level = std::env::var(LOG_LEVEL_ENV)
        .ok()
        .and_then(|s| LogLevel::from_str(&s))
        .unwrap_or(default_level);
    Ok(EnvFilter::new(level.as_filter_str()))
}
