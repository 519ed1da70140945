//! Hub configuration.

use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{Error, Result};

/// Prefix of every environment variable the hub reads.
pub const ENV_PREFIX: &str = "NOTIFY_HUB_";

/// Default identifier shape: a 24-digit hex object id.
pub const DEFAULT_ID_PATTERN: &str = "^[0-9a-fA-F]{24}$";

/// Runtime configuration of the notification engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Maximum notifications held in memory.
    pub capacity: usize,
    /// Maximum notifications requested per backfill.
    pub backfill_limit: usize,
    /// Minimum spacing between two backfills, in milliseconds.
    pub backfill_debounce_ms: u64,
    /// Base URL of the REST notification store. No remote store when unset.
    pub store_url: Option<String>,
    /// Bearer token for the store.
    pub store_token: Option<String>,
    /// Request timeout for store calls, in seconds.
    pub store_timeout_secs: u64,
    /// Shape a notification id must match before a mark-read is attempted.
    pub id_pattern: String,
    /// Collapse id-less events with identical content seen within this many
    /// seconds. Off when unset.
    pub content_dedup_window_secs: Option<u64>,
    /// Capacity of the hub event broadcast channel.
    pub event_buffer: usize,
    /// Directory for rolling log files.
    pub log_dir: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            backfill_limit: 100,
            backfill_debounce_ms: 1000,
            store_url: None,
            store_token: None,
            store_timeout_secs: 15,
            id_pattern: DEFAULT_ID_PATTERN.to_string(),
            content_dedup_window_secs: None,
            event_buffer: 256,
            log_dir: "logs".to_string(),
        }
    }
}

impl HubConfig {
    /// Load from `NOTIFY_HUB_*` environment variables (after reading a
    /// `.env` file if one exists), falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` to resolve variable names.
    ///
    /// Supported keys (all prefixed with `NOTIFY_HUB_`): `CAPACITY`,
    /// `BACKFILL_LIMIT`, `BACKFILL_DEBOUNCE_MS`, `STORE_URL`, `STORE_TOKEN`,
    /// `STORE_TIMEOUT_SECS`, `ID_PATTERN`, `CONTENT_DEDUP_WINDOW_SECS`,
    /// `EVENT_BUFFER`, `LOG_DIR`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(&format!("{}{}", ENV_PREFIX, name))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut config = Self::default();

        if let Some(value) = get("CAPACITY") {
            config.capacity = parse_number("CAPACITY", &value)?;
        }
        if let Some(value) = get("BACKFILL_LIMIT") {
            config.backfill_limit = parse_number("BACKFILL_LIMIT", &value)?;
        }
        if let Some(value) = get("BACKFILL_DEBOUNCE_MS") {
            config.backfill_debounce_ms = parse_number("BACKFILL_DEBOUNCE_MS", &value)?;
        }
        if let Some(value) = get("STORE_URL") {
            config.store_url = Some(value);
        }
        if let Some(value) = get("STORE_TOKEN") {
            config.store_token = Some(value);
        }
        if let Some(value) = get("STORE_TIMEOUT_SECS") {
            config.store_timeout_secs = parse_number("STORE_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = get("ID_PATTERN") {
            config.id_pattern = value;
        }
        if let Some(value) = get("CONTENT_DEDUP_WINDOW_SECS") {
            let secs: u64 = parse_number("CONTENT_DEDUP_WINDOW_SECS", &value)?;
            config.content_dedup_window_secs = (secs > 0).then_some(secs);
        }
        if let Some(value) = get("EVENT_BUFFER") {
            config.event_buffer = parse_number("EVENT_BUFFER", &value)?;
        }
        if let Some(value) = get("LOG_DIR") {
            config.log_dir = value;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::config("capacity must be at least 1"));
        }
        if self.event_buffer == 0 {
            return Err(Error::config("event_buffer must be at least 1"));
        }
        if self.backfill_limit == 0 {
            warn!("backfill_limit is 0, backfills will fetch nothing");
        }
        self.id_regex()?;
        Ok(())
    }

    pub fn id_regex(&self) -> Result<Regex> {
        Regex::new(&self.id_pattern)
            .map_err(|e| Error::config(format!("Invalid id_pattern {}: {}", self.id_pattern, e)))
    }

    pub fn backfill_debounce(&self) -> Duration {
        Duration::from_millis(self.backfill_debounce_ms)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }

    pub fn content_dedup_window(&self) -> Option<Duration> {
        self.content_dedup_window_secs.map(Duration::from_secs)
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::config(format!("{}{} is not a valid number: {}", ENV_PREFIX, name, value)))
}
