//! Tracing setup shared by the binary and the integration tests.
//!
//! Two sinks: a console layer filtered at the configured level and an
//! optional session log file that always records DEBUG and above.

use crate::config::EnvParser;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Console output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Some(Self::Compact),
            "pretty" => Some(Self::Pretty),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log level `{0}`")]
    InvalidLevel(String),

    #[error("cannot open log file {}: {source}", .path.display())]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("a global tracing subscriber is already installed")]
    AlreadyInitialized,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
    pub stderr: bool,
    pub file: Option<PathBuf>,
}

impl LogConfig {
    /// Start from `default_level`, overridden by `VXFUZZ_LOG` and
    /// `VXFUZZ_LOG_FORMAT` when set to something valid.
    pub fn from_env(default_level: &str) -> Self {
        let mut env = EnvParser::new();
        let level = env
            .get_log_level("LOG")
            .unwrap_or_else(|| default_level.to_string());
        let format = env
            .get_string("LOG_FORMAT")
            .and_then(|f| LogFormat::parse(&f))
            .unwrap_or_default();
        Self {
            level,
            format,
            stderr: false,
            file: None,
        }
    }

    #[must_use]
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    #[must_use]
    pub fn with_stderr(mut self) -> Self {
        self.stderr = true;
        self
    }

    #[must_use]
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    fn level_filter(&self) -> Result<LevelFilter, LoggingError> {
        self.level
            .trim()
            .parse::<LevelFilter>()
            .map_err(|_| LoggingError::InvalidLevel(self.level.clone()))
    }
}

/// Keeps the non-blocking file writer flushing until dropped.
#[must_use = "dropping the guards stops the session log writer"]
pub struct LoggingGuards {
    _file: Option<WorkerGuard>,
}

fn open_log_file(path: &Path) -> Result<std::fs::File, LoggingError> {
    let wrap = |source| LoggingError::File {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(wrap)?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(wrap)
}

/// Install the global subscriber described by `config`.
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuards, LoggingError> {
    let console_level = config.level_filter()?;
    // Keep noisy dependencies at warn unless explicitly asked for.
    let console_filter = EnvFilter::builder()
        .with_default_directive(console_level.into())
        .parse_lossy("tokio=warn");

    let console = if config.stderr {
        let layer = fmt::layer().with_writer(std::io::stderr).with_target(false);
        match config.format {
            LogFormat::Compact => layer.compact().with_filter(console_filter).boxed(),
            LogFormat::Pretty => layer.pretty().with_filter(console_filter).boxed(),
            LogFormat::Json => layer.json().with_filter(console_filter).boxed(),
        }
    } else {
        let layer = fmt::layer().with_target(false);
        match config.format {
            LogFormat::Compact => layer.compact().with_filter(console_filter).boxed(),
            LogFormat::Pretty => layer.pretty().with_filter(console_filter).boxed(),
            LogFormat::Json => layer.json().with_filter(console_filter).boxed(),
        }
    };

    let (file_layer, file_guard) = match &config.file {
        Some(path) => {
            let file = open_log_file(path)?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(LevelFilter::DEBUG);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .try_init()
        .map_err(|_| LoggingError::AlreadyInitialized)?;

    Ok(LoggingGuards { _file: file_guard })
}
