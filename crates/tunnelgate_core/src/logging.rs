//! Structured logging setup with console and optional file output.
//!
//! Provides:
//! - Console logging on stderr, so stdout stays free for query output
//! - Optional daily rotating log files
//! - Build-type conditional log levels
//! - Console-only fallback when file logging fails
//! - Environment variable override via TUNNELGATE_LOG or RUST_LOG

use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

/// Logging configuration.
pub struct LogConfig {
    /// Directory for log files; console only when unset
    pub log_dir: Option<PathBuf>,
    /// Whether stderr is a terminal (enables ANSI colors)
    pub is_tty: bool,
    /// Optional custom log filter
    pub log_filter: Option<String>,
}

impl LogConfig {
    /// Console-only logging.
    pub fn console() -> Self {
        Self { log_dir: None, is_tty: atty::is(atty::Stream::Stderr), log_filter: None }
    }

    /// Console logging plus daily files under `log_dir`.
    pub fn with_log_dir(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(log_dir.into());
        self
    }

    /// Set custom log filter.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = Some(filter.into());
        self
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::console()
    }
}

/// Guard that must be held for the lifetime of the application.
///
/// Dropping this guard flushes pending log entries.
pub struct LoggingGuard {
    _worker_guard: Option<WorkerGuard>,
}

/// Initialize logging with the given configuration.
///
/// If file logging initialization fails, falls back to console only.
pub fn init_logging(config: LogConfig) -> LoggingGuard {
    let Some(log_dir) = &config.log_dir else {
        return init_console_logging(&config);
    };

    match init_file_logging(log_dir, &config) {
        Ok(guard) => LoggingGuard { _worker_guard: Some(guard) },
        Err(e) => {
            eprintln!("Warning: Failed to initialize file logging: {}. Using console only.", e);
            init_console_logging(&config)
        }
    }
}

/// Initialize console-only logging.
fn init_console_logging(config: &LogConfig) -> LoggingGuard {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(build_env_filter(config.log_filter.as_deref()))
        .with_ansi(config.is_tty)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    LoggingGuard { _worker_guard: None }
}

/// Initialize file + console logging.
fn init_file_logging(
    log_dir: &Path,
    config: &LogConfig,
) -> Result<WorkerGuard, Box<dyn std::error::Error>> {
    std::fs::create_dir_all(log_dir)?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("tunnelgate")
        .filename_suffix("log")
        .build(log_dir)?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let console = std::io::stderr.with_max_level(tracing::Level::INFO);
    let combined = console.and(non_blocking);

    tracing_subscriber::fmt()
        .with_writer(combined)
        .with_env_filter(build_env_filter(config.log_filter.as_deref()))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .init();

    Ok(guard)
}

/// Build the environment filter from config or defaults.
fn build_env_filter(custom_filter: Option<&str>) -> EnvFilter {
    // Priority: custom filter > TUNNELGATE_LOG > RUST_LOG > default
    if let Some(filter) = custom_filter {
        return EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new(default_log_filter()));
    }

    EnvFilter::try_from_env("TUNNELGATE_LOG")
        .or_else(|_| EnvFilter::try_from_env("RUST_LOG"))
        .unwrap_or_else(|_| EnvFilter::new(default_log_filter()))
}

/// Get the default log filter based on build type.
pub fn default_log_filter() -> &'static str {
    #[cfg(debug_assertions)]
    {
        "debug,tunnelgate=trace,tunnelgate_core=trace,tokio_postgres=warn,russh=warn"
    }
    #[cfg(not(debug_assertions))]
    {
        "info,tunnelgate=info,tunnelgate_core=info,tokio_postgres=warn,russh=warn"
    }
}
