//! Logging setup with a reloadable filter.
//!
//! Console output plus a daily rolling file, both stamped in local time.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    reload::{self, Handle},
    util::SubscriberInitExt,
};

use crate::{Error, Result};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "notify_hub=info,reqwest=warn";

/// File name prefix of the rolling log.
pub const LOG_FILE_NAME: &str = "notify-hub.log";

/// RFC 3339 with milliseconds and the local UTC offset.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f%:z";

/// Stamps console and file lines with the host's wall clock, so replayed
/// signals line up with the dashboards' local times.
#[derive(Debug, Clone, Copy, Default)]
struct HostClock;

impl FormatTime for HostClock {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format(TIMESTAMP_FORMAT))
    }
}

type ReloadHandle = Handle<EnvFilter, tracing_subscriber::Registry>;

/// Runtime control over the installed subscriber.
pub struct LoggingConfig {
    filter: ReloadHandle,
    log_dir: PathBuf,
}

impl LoggingConfig {
    /// Get the filter directive currently in effect.
    pub fn get_filter(&self) -> String {
        self.filter
            .with_current(|filter| filter.to_string())
            .unwrap_or_default()
    }

    /// Swap the filter without restarting.
    ///
    /// # Arguments
    /// * `directive` - Filter string (e.g., "notify_hub=debug,reqwest=warn")
    ///
    /// # Returns
    /// `Error::Configuration` if the directive does not parse; the previous
    /// filter stays active in that case.
    pub fn set_filter(&self, directive: &str) -> Result<()> {
        let new_filter = EnvFilter::try_new(directive)
            .map_err(|e| Error::config(format!("Invalid filter directive: {}", e)))?;

        self.filter
            .reload(new_filter)
            .map_err(|e| Error::Other(format!("Failed to reload filter: {}", e)))?;

        info!(directive = %directive, "Log filter updated");
        Ok(())
    }

    /// Directory holding the rolling `notify-hub.log.*` files.
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }
}

/// Install the global subscriber.
///
/// # Arguments
/// * `log_dir` - Directory for the daily rolling file; created if missing
///
/// # Returns
/// The runtime handle and the file writer's guard. `RUST_LOG` wins over
/// [`DEFAULT_LOG_FILTER`]. Keep the guard alive for as long as file output
/// is wanted.
pub fn init_logging(log_dir: &str) -> Result<(Arc<LoggingConfig>, WorkerGuard)> {
    let log_path = PathBuf::from(log_dir);
    std::fs::create_dir_all(&log_path)?;

    let file_appender = tracing_appender::rolling::daily(&log_path, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let initial_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let (filter_layer, filter_handle) = reload::Layer::new(initial_filter);

    // Console goes to stderr; stdout carries the replay output.
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(true)
                .with_timer(HostClock),
        )
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_timer(HostClock),
        )
        .try_init()
        .map_err(|e| Error::Other(format!("Failed to set global default subscriber: {}", e)))?;

    let config = Arc::new(LoggingConfig {
        filter: filter_handle,
        log_dir: log_path,
    });

    Ok((config, guard))
}
