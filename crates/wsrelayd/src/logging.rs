//! Tracing subscriber setup.
//!
//! Records always go to stdout. When `log.directory` is set they are also
//! written to a rolling file through a non-blocking writer; the returned
//! [`LogGuard`] must be kept alive for the lifetime of the process so the
//! writer can flush on exit.

use std::io;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::EnvFilter;

use wsrelay_core::{LogConfig, LogRotation};

/// Keeps the background log writer alive.
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Errors that can occur while installing the subscriber.
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Invalid log filter {filter:?}: {error}")]
    Filter { filter: String, error: String },

    #[error("Failed to create log file appender: {0}")]
    Appender(String),

    #[error("Failed to install tracing subscriber: {0}")]
    Install(String),
}

/// Builds the filter: `RUST_LOG` when set, otherwise the configured level.
pub fn build_filter(config: &LogConfig) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.level).map_err(|e| LoggingError::Filter {
        filter: config.level.clone(),
        error: e.to_string(),
    })
}

fn rotation_for(rotation: LogRotation) -> Rotation {
    match rotation {
        LogRotation::Minutely => Rotation::MINUTELY,
        LogRotation::Hourly => Rotation::HOURLY,
        LogRotation::Daily => Rotation::DAILY,
        LogRotation::Never => Rotation::NEVER,
    }
}

/// Creates the rolling file appender described by `config`, if any.
pub fn file_appender(config: &LogConfig) -> Result<Option<RollingFileAppender>, LoggingError> {
    let Some(directory) = &config.directory else {
        return Ok(None);
    };

    let mut builder = RollingFileAppender::builder()
        .rotation(rotation_for(config.rotation))
        .filename_prefix(&config.file_prefix);
    if let Some(max_files) = config.max_files {
        builder = builder.max_log_files(max_files);
    }

    builder
        .build(directory)
        .map(Some)
        .map_err(|e| LoggingError::Appender(e.to_string()))
}

/// Installs the global tracing subscriber.
pub fn init(config: &LogConfig) -> Result<LogGuard, LoggingError> {
    let filter = build_filter(config)?;

    let (writer, guard) = match file_appender(config)? {
        Some(appender) => {
            let (file, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(io::stdout.and(file)), Some(guard))
        }
        None => (BoxMakeWriter::new(io::stdout), None),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);

    let installed = if config.json {
        builder.json().flatten_event(true).try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| LoggingError::Install(e.to_string()))?;

    Ok(LogGuard { _file: guard })
}
