//! Configuration file parser for ~/.config/feedstore/config.toml.
//!
//! The config file is optional; a missing file yields `Config::default()`.
//! Unknown keys are accepted but logged as warnings since they are most
//! likely typos.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::storage::StoreOptions;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds the maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration
// ============================================================================

/// Store configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Database file. Defaults to `feeds.db` next to the config file.
    pub database_path: Option<PathBuf>,

    /// Pooled connections; SQLite still admits a single writer at a time.
    pub max_connections: u32,

    /// How long a statement waits on a locked database.
    pub busy_timeout_ms: u64,

    /// How long a caller waits for a free connection.
    pub acquire_timeout_secs: u64,

    /// Rows a query stream reads ahead of its consumer.
    pub row_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        let store = StoreOptions::default();
        Self {
            database_path: None,
            max_connections: store.max_connections,
            busy_timeout_ms: store.busy_timeout.as_millis() as u64,
            acquire_timeout_secs: store.acquire_timeout.as_secs(),
            row_buffer: store.row_buffer,
        }
    }
}

impl Config {
    /// Maximum config file size (64 KB).
    const MAX_FILE_SIZE: u64 = 65_536;

    const KNOWN_KEYS: [&'static str; 5] = [
        "database_path",
        "max_connections",
        "busy_timeout_ms",
        "acquire_timeout_secs",
        "row_buffer",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        Self::parse(&content, path)
    }

    fn parse(content: &str, path: &Path) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(content)?;
        tracing::info!(
            path = %path.display(),
            max_connections = config.max_connections,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Pool options for [`crate::storage::Database::open_with`].
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            max_connections: self.max_connections.max(1),
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
            acquire_timeout: Duration::from_secs(self.acquire_timeout_secs),
            row_buffer: self.row_buffer.max(1),
        }
    }

    /// The configured database path, or `feeds.db` inside `config_dir`.
    pub fn database_path_or(&self, config_dir: &Path) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| config_dir.join("feeds.db"))
    }
}

// ============================================================================
// Tests
// ============================================================================
