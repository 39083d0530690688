//! Tracing subscriber setup for hosts embedding the filter.

use std::{
    fs::{self, File, OpenOptions},
    path::Path,
    sync::Mutex,
};

use {
    tracing::Subscriber,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use crate::{Error, Result, config::LoggingConfig};

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `config.level`. Output always goes to stdout; when
/// `config.file` is set it is also appended there without ANSI colors. Fails
/// if a global subscriber is already installed.
pub fn init(config: &LoggingConfig) -> Result<()> {
    subscriber(config)?
        .try_init()
        .map_err(|e| Error::message(format!("failed to install tracing subscriber: {e}")))?;
    tracing::info!(level = %config.level, file = ?config.file, "logging initialized");
    Ok(())
}

fn subscriber(config: &LoggingConfig) -> Result<impl Subscriber + Send + Sync + 'static> {
    let filter = env_filter(&config.level)?;
    let file_layer = match &config.file {
        Some(path) => Some(
            fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(open_log_file(path)?)),
        ),
        None => None,
    };
    Ok(tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer))
}

fn open_log_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

fn env_filter(level: &str) -> Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| Error::message(format!("invalid log level {level:?}: {e}")))
}
