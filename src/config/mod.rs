//! Engine configuration.
//!
//! Configuration is pure data: it can be loaded from a JSON document or
//! built programmatically, and nothing touches the filesystem or the
//! database until [`crate::storage::Store::open`] consumes it.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// SQLite journal mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JournalMode {
    Delete,
    /// Recommended: concurrent readers do not block the writer.
    #[default]
    Wal,
    Memory,
}

impl JournalMode {
    /// Pragma value for this mode.
    #[must_use]
    pub const fn as_pragma(&self) -> &'static str {
        match self {
            Self::Delete => "DELETE",
            Self::Wal => "WAL",
            Self::Memory => "MEMORY",
        }
    }
}

/// Retry policy configuration.
///
/// `max_attempts` counts retries after the first attempt; zero means one
/// attempt and no retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// One attempt, no retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            enabled: false,
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Tuned for databases on network-attached storage: fewer, slower
    /// retries with a generous ceiling.
    #[must_use]
    pub fn network_storage() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
        }
    }

    /// Tuned for many local writers fighting over short locks.
    #[must_use]
    pub fn high_contention() -> Self {
        Self {
            enabled: true,
            max_attempts: 10,
            initial_delay_ms: 50,
            max_delay_ms: 2_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Backend storage path.
    pub db_file: PathBuf,
    /// How long the backend waits on a held lock before raising BUSY.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Per-statement deadline.
    #[serde(default = "default_command_timeout_s")]
    pub command_timeout_s: u64,
    #[serde(default)]
    pub journal_mode: JournalMode,
    /// Backend page-cache size; negative values are kibibytes per the
    /// SQLite convention.
    #[serde(default)]
    pub cache_size_pages: Option<i64>,
    #[serde(default)]
    pub retry: RetryConfig,
}

const fn default_busy_timeout_ms() -> u64 {
    5_000
}

const fn default_command_timeout_s() -> u64 {
    30
}

impl EngineConfig {
    /// Configuration with defaults for the given database file.
    #[must_use]
    pub fn new(db_file: impl Into<PathBuf>) -> Self {
        Self {
            db_file: db_file.into(),
            busy_timeout_ms: default_busy_timeout_ms(),
            command_timeout_s: default_command_timeout_s(),
            journal_mode: JournalMode::default(),
            cache_size_pages: None,
            retry: RetryConfig::default(),
        }
    }

    /// Parse a configuration from a JSON document.
    ///
    /// # Errors
    ///
    /// Returns a `config` error when the document is malformed or the
    /// database path is empty.
    pub fn from_json(document: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(document)
            .map_err(|e| Error::Config(format!("invalid configuration document: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration document from disk.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let document = std::fs::read_to_string(path)?;
        Self::from_json(&document)
    }

    fn validate(&self) -> Result<()> {
        if self.db_file.as_os_str().is_empty() {
            return Err(Error::Config("db_file must not be empty".to_string()));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(Error::Config(
                "retry.backoff_multiplier must be at least 1.0".to_string(),
            ));
        }
        Ok(())
    }
}
