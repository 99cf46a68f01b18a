//! Logging for the wgkit engine.
//!
//! Structured logging through `tracing`. The host logger bridge is always
//! installed as a layer; stdout and rolling file output are optional and
//! mostly useful when debugging the engine outside a host application.

pub mod bridge;

pub use bridge::{LogBridge, LogLevel, LogSink, NullSink};

use tracing::Level;
use tracing_appender::{
    non_blocking::{NonBlocking, WorkerGuard},
    rolling::{RollingFileAppender, Rotation},
};
use tracing_log::LogTracer;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::EngineConfig;

/// Log initialization options.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Log level (default: INFO)
    pub level: Level,

    /// Whether to log to stdout (default: false)
    pub log_to_stdout: bool,

    /// Whether to log to a file (default: false)
    pub log_to_file: bool,

    /// Directory to store log files (default: "./logs")
    pub log_dir: String,

    /// Base filename for log files (default: "wgkit")
    pub log_file_name: String,

    /// Whether to use JSON format for stdout/file logs (default: false)
    pub json_format: bool,

    /// Capacity of the host bridge queue (default: 1024)
    pub queue_capacity: usize,
}

impl Default for LogOptions {
    fn default() -> Self {
        LogOptions {
            level: Level::INFO,
            log_to_stdout: false,
            log_to_file: false,
            log_dir: "./logs".to_string(),
            log_file_name: "wgkit".to_string(),
            json_format: false,
            queue_capacity: bridge::DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Initialize logging with the given options.
///
/// Returns a guard that must be kept alive while file logging is wanted.
/// Installing the global subscriber is attempted once per process; later
/// calls leave the existing subscriber in place.
pub fn init_logging(options: LogOptions) -> Option<WorkerGuard> {
    // Bridge `log` crate records into `tracing`
    let _ = LogTracer::init();

    let filter = EnvFilter::from_default_env().add_directive(options.level.into());
    let host = LogBridge::install_global(options.queue_capacity);

    let mut layers = vec![host.layer().boxed()];
    let mut guard = None;

    if options.log_to_stdout {
        let stdout_layer = fmt::layer().with_target(true);
        let stdout_layer = if options.json_format {
            stdout_layer.json().boxed()
        } else {
            stdout_layer.boxed()
        };
        layers.push(stdout_layer);
    }

    if options.log_to_file {
        let file_appender =
            RollingFileAppender::new(Rotation::DAILY, &options.log_dir, &options.log_file_name);

        let (non_blocking, worker_guard) = NonBlocking::new(file_appender);
        guard = Some(worker_guard);

        let file_layer = fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .with_writer(non_blocking);

        let file_layer = if options.json_format {
            file_layer.json().boxed()
        } else {
            file_layer.boxed()
        };
        layers.push(file_layer);
    }

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(layers)
        .try_init();

    guard
}

/// Map a config level name onto a `tracing` level; unknown names mean INFO.
pub fn parse_level(name: &str) -> Level {
    match name.to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Initialize logging from the engine configuration.
pub fn init_logging_from_config(config: &EngineConfig) -> Option<WorkerGuard> {
    let options = LogOptions {
        level: parse_level(&config.log_level),
        log_to_stdout: config.logging.log_to_stdout,
        log_to_file: config.logging.log_to_file,
        log_dir: config.logging.log_dir.clone(),
        json_format: config.logging.json_format,
        queue_capacity: config.logging.queue_capacity,
        ..Default::default()
    };

    init_logging(options)
}
