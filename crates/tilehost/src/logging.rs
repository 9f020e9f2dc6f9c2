//! Logging setup.
//!
//! `RUST_LOG` wins over the configured level. Output goes to stdout, or to
//! `[logging] file_path` when set, as plain text or JSON.

use std::fs::OpenOptions;
use std::sync::Mutex;

use tilehost_config::LoggingSettings;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::TilehostError;

/// Command-line overrides for the `[logging]` table.
#[derive(Debug, Default, Clone)]
pub struct LoggingOverrides {
    pub level: Option<String>,
    pub json: bool,
}

/// The level actually used: CLI override first, then the file.
pub fn effective_level<'a>(settings: &'a LoggingSettings, overrides: &'a LoggingOverrides) -> &'a str {
    overrides.level.as_deref().unwrap_or(settings.level.as_str())
}

/// Installs the global subscriber.
///
/// # Errors
/// [`TilehostError::Startup`] if the log file cannot be opened or a
/// subscriber is already installed.
pub fn setup_logging(settings: &LoggingSettings, overrides: &LoggingOverrides) -> Result<(), TilehostError> {
    let level = effective_level(settings, overrides);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let json = overrides.json || settings.json_format;

    let registry = tracing_subscriber::registry().with(filter);
    let result = match (&settings.file_path, json) {
        (Some(path), json) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| TilehostError::Startup(format!("log file {}: {e}", path.display())))?;
            let writer = Mutex::new(file);
            if json {
                registry
                    .with(fmt::layer().json().with_writer(writer).with_thread_ids(true))
                    .try_init()
            } else {
                registry
                    .with(fmt::layer().with_ansi(false).with_writer(writer).with_thread_ids(true))
                    .try_init()
            }
        }
        (None, true) => registry
            .with(fmt::layer().json().with_thread_ids(true))
            .try_init(),
        (None, false) => registry
            .with(fmt::layer().with_thread_ids(true))
            .try_init(),
    };
    result.map_err(|e| TilehostError::Startup(format!("logging: {e}")))?;

    info!(level, json, "logging initialized");
    Ok(())
}
