use std::{fmt, fs, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Registry, fmt as tracing_fmt, prelude::*};

/// Target used for the one-line-per-fan-out JSON report.
pub const DELIVERY_TARGET: &str = "delivery";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_directive())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "critical" => Ok(LogLevel::Critical),
            other => Err(format!("unknown log level `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct LogConfig {
    pub log_level: LogLevel,
    pub log_dir: Option<PathBuf>,
}

impl LogConfig {
    pub fn new(log_level: LogLevel, log_dir: Option<PathBuf>) -> Self {
        Self { log_level, log_dir }
    }
}

/// Installs the global subscriber.
///
/// - stdout gets human-readable lines filtered by `RUST_LOG` or the level.
/// - with a `log_dir`, a daily-rolling `nodeboard.log` gets the same lines
///   and `delivery.json` gets newline-delimited JSON for
///   `target = "delivery"` events.
///
/// Returns false when a subscriber was already installed.
pub fn init_tracing(config: &LogConfig) -> anyhow::Result<bool> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_directive()));

    let stdout_layer = tracing_fmt::layer().with_target(false);

    let (txt_layer, json_layer) = match &config.log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            let txt_appender = RollingFileAppender::new(Rotation::DAILY, dir, "nodeboard.log");
            let txt_layer = tracing_fmt::layer()
                .with_writer(txt_appender)
                .with_ansi(false);

            let json_appender = RollingFileAppender::new(Rotation::DAILY, dir, "delivery.json");
            let json_layer = tracing_fmt::layer()
                .json()
                .with_writer(json_appender)
                .with_target(true)
                .with_filter(EnvFilter::new(format!("{DELIVERY_TARGET}=info")));
            (Some(txt_layer), Some(json_layer))
        }
        None => (None, None),
    };

    let installed = Registry::default()
        .with(env_filter)
        .with(stdout_layer)
        .with(txt_layer)
        .with(json_layer)
        .try_init()
        .is_ok();
    Ok(installed)
}
