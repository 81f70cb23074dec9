//! Process logging setup for the controller and engine binaries.
//!
//! Console output goes to stderr (pretty or JSON). When `FINJ_LOG_FILE` is set,
//! a second JSON layer writes to that file through a non-blocking appender.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::EnvParser;

/// Console log format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging settings resolved from the environment and CLI flags.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
    pub stderr: bool,
    pub file: Option<PathBuf>,
}

impl LogConfig {
    /// Read `FINJ_LOG_LEVEL`, `FINJ_LOG_FORMAT` and `FINJ_LOG_FILE`.
    pub fn from_env(default_level: &str) -> Self {
        let mut env = EnvParser::new();
        let level = env.get_log_level("LOG_LEVEL", default_level).into_inner();
        let format = match env.get_string("LOG_FORMAT", "pretty").value.as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        };
        let file = env
            .get_optional_string("LOG_FILE", None)
            .into_inner()
            .map(PathBuf::from);
        for err in env.take_errors() {
            eprintln!("warning: {err}");
        }
        Self {
            level,
            format,
            stderr: false,
            file,
        }
    }

    pub fn with_stderr(mut self) -> Self {
        self.stderr = true;
        self
    }

    pub fn with_level(mut self, level: &str) -> Self {
        self.level = level.to_string();
        self
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "finj_common={0},finj_engine={0},finj_controller={0},warn",
                self.level
            ))
        })
    }
}

/// Keeps background log writers alive; drop it at process exit.
#[must_use]
pub struct LoggingGuards {
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber.
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuards> {
    let console = config.stderr.then(|| match config.format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed(),
    });

    let (file_layer, guard) = match &config.file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating log directory {}", parent.display()))?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            let layer = fmt::layer().json().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(config.filter())
        .with(console)
        .with(file_layer)
        .try_init()
        .context("installing tracing subscriber")?;

    Ok(LoggingGuards { _file: guard })
}
