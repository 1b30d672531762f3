use std::fmt;

use clap::ValueEnum;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{reload, EnvFilter, Registry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_level_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Error => f.write_str("error"),
            LogLevel::Warn => f.write_str("warn"),
            LogLevel::Info => f.write_str("info"),
            LogLevel::Debug => f.write_str("debug"),
            LogLevel::Trace => f.write_str("trace"),
        }
    }
}

pub type ReloadHandle = reload::Handle<EnvFilter, Registry>;

pub struct Logging {
    handle: ReloadHandle,
    /// Set when the filter came from the command line or `RUST_LOG`.
    pinned: bool,
}

impl Logging {
    /// Adopts the config file's directive unless a stronger source already
    /// chose the filter.
    pub fn apply_configured(&self, directive: Option<&str>) -> Result<(), String> {
        let Some(directive) = directive else {
            return Ok(());
        };
        if self.pinned {
            return Ok(());
        }
        let filter = EnvFilter::try_new(directive).map_err(|error| error.to_string())?;
        self.handle
            .modify(|current| *current = filter)
            .map_err(|error| error.to_string())
    }
}

/// Installs the global subscriber. Events go to stderr so stdout stays JSON.
pub fn init_logging(level: Option<LogLevel>) -> Logging {
    let (env_filter, pinned) = match level {
        Some(level) => (level_filter(level), true),
        None => match EnvFilter::try_from_default_env() {
            Ok(filter) => (filter, true),
            Err(_) => (level_filter(LogLevel::default()), false),
        },
    };
    let (reload_layer, handle) = reload::Layer::new(env_filter);

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_ansi(false)
        .with_writer(std::io::stderr);

    let subscriber = Registry::default().with(reload_layer).with(fmt_layer);

    let _ = tracing::subscriber::set_global_default(subscriber);

    Logging { handle, pinned }
}

fn level_filter(level: LogLevel) -> EnvFilter {
    EnvFilter::default().add_directive(level.to_level_filter().into())
}
