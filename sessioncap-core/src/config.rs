//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/sessioncap/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/sessioncap/` (~/.config/sessioncap/)
//! - Data: `$XDG_DATA_HOME/sessioncap/` (~/.local/share/sessioncap/)
//! - State/Logs: `$XDG_STATE_HOME/sessioncap/` (~/.local/state/sessioncap/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Ingest service used when none is configured.
pub const DEFAULT_INGEST_POINT: &str = "https://api.openreplay.com/ingest";

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Tracker options
    #[serde(default)]
    pub tracker: TrackerConfig,

    /// Persisted key names
    #[serde(default)]
    pub storage: StorageKeys,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Options for a single tracker instance
#[derive(Debug, Deserialize, Clone)]
pub struct TrackerConfig {
    /// Project key issued by the ingest service
    #[serde(default)]
    pub project_key: String,

    /// Base URL of the ingest service
    #[serde(default = "default_ingest_point")]
    pub ingest_point: String,

    /// Revision of the instrumented application
    #[serde(default)]
    pub rev_id: String,

    /// Connection attempts the worker makes before giving up on a batch
    #[serde(default = "default_conn_attempt_count")]
    pub conn_attempt_count: u32,

    /// Milliseconds between worker connection attempts
    #[serde(default = "default_conn_attempt_gap_ms")]
    pub conn_attempt_gap_ms: u64,

    /// Milliseconds between commits of the pending message buffer
    #[serde(default = "default_commit_interval_ms")]
    pub commit_interval_ms: u64,

    /// Milliseconds between worker flushes to the ingest service
    #[serde(default = "default_worker_flush_interval_ms")]
    pub worker_flush_interval_ms: u64,

    /// Log lifecycle notices at info level
    #[serde(default)]
    pub verbose: bool,

    /// Reported to the ingest service as `isSnippet`
    #[serde(default)]
    pub is_snippet: bool,

    /// Optional endpoint receiving `{context, error}` debug reports
    #[serde(default)]
    pub debug_report_endpoint: Option<String>,

    /// Overrides the document base when resolving resource URLs
    #[serde(default)]
    pub resource_base_href: Option<String>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            project_key: String::new(),
            ingest_point: default_ingest_point(),
            rev_id: String::new(),
            conn_attempt_count: default_conn_attempt_count(),
            conn_attempt_gap_ms: default_conn_attempt_gap_ms(),
            commit_interval_ms: default_commit_interval_ms(),
            worker_flush_interval_ms: default_worker_flush_interval_ms(),
            verbose: false,
            is_snippet: false,
            debug_report_endpoint: None,
            resource_base_href: None,
        }
    }
}

fn default_ingest_point() -> String {
    DEFAULT_INGEST_POINT.to_string()
}

fn default_conn_attempt_count() -> u32 {
    10
}

fn default_conn_attempt_gap_ms() -> u64 {
    8000
}

fn default_commit_interval_ms() -> u64 {
    30
}

fn default_worker_flush_interval_ms() -> u64 {
    10_000
}

impl TrackerConfig {
    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.project_key.trim().is_empty() {
            return Err(Error::Config("tracker.project_key is required".to_string()));
        }
        reqwest::Url::parse(&self.ingest_point).map_err(|e| {
            Error::Config(format!(
                "tracker.ingest_point is not a valid URL ({}): {}",
                self.ingest_point, e
            ))
        })?;
        if self.conn_attempt_count == 0 {
            return Err(Error::Config(
                "tracker.conn_attempt_count must be at least 1".to_string(),
            ));
        }
        if self.commit_interval_ms == 0 {
            return Err(Error::Config(
                "tracker.commit_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Gap between worker connection attempts
    pub fn conn_attempt_gap(&self) -> Duration {
        Duration::from_millis(self.conn_attempt_gap_ms)
    }

    /// Interval of the commit ticker
    pub fn commit_interval(&self) -> Duration {
        Duration::from_millis(self.commit_interval_ms)
    }

    /// Interval of the worker's periodic flush
    pub fn worker_flush_interval(&self) -> Duration {
        Duration::from_millis(self.worker_flush_interval_ms)
    }
}

/// Names of the persisted identity keys.
///
/// Every key is stored as `{key_prefix}{SCHEMA_VERSION}_{name}` so that a
/// change to what is written under a key can be rolled out by bumping the
/// schema version instead of silently reading stale data.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageKeys {
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_token_key")]
    pub token_key: String,
    #[serde(default = "default_page_no_key")]
    pub page_no_key: String,
    #[serde(default = "default_reset_key")]
    pub reset_key: String,
    #[serde(default = "default_uuid_key")]
    pub uuid_key: String,
}

impl StorageKeys {
    /// Version of the persisted layout
    pub const SCHEMA_VERSION: u32 = 1;

    /// Fully qualified storage key for a short name
    pub fn qualify(&self, name: &str) -> String {
        format!("{}v{}_{}", self.key_prefix, Self::SCHEMA_VERSION, name)
    }
}

impl Default for StorageKeys {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            token_key: default_token_key(),
            page_no_key: default_page_no_key(),
            reset_key: default_reset_key(),
            uuid_key: default_uuid_key(),
        }
    }
}

fn default_key_prefix() -> String {
    "__sessioncap_".to_string()
}

fn default_token_key() -> String {
    "token".to_string()
}

fn default_page_no_key() -> String {
    "pageno".to_string()
}

fn default_reset_key() -> String {
    "reset".to_string()
}

fn default_uuid_key() -> String {
    "uuid".to_string()
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/sessioncap/config.toml` (~/.config/sessioncap/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("sessioncap").join("config.toml")
    }

    /// Returns the data directory path (durable identity)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("sessioncap")
    }

    /// Returns the state directory path (logs, session-scoped identity)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("sessioncap")
    }

    /// Durable store file (user UUID)
    pub fn durable_store_path() -> PathBuf {
        Self::data_dir().join("durable.json")
    }

    /// Session-scoped store file (token, page counter, reset flag)
    pub fn session_store_path() -> PathBuf {
        Self::state_dir().join("session.json")
    }

    /// Returns the log file path
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("sessioncap.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_tracker() -> TrackerConfig {
        TrackerConfig {
            project_key: "pk".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.tracker.ingest_point, DEFAULT_INGEST_POINT);
        assert_eq!(config.tracker.conn_attempt_count, 10);
        assert_eq!(config.tracker.conn_attempt_gap_ms, 8000);
        assert_eq!(config.logging.level, "info");
        assert!(config.tracker.debug_report_endpoint.is_none());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[tracker]
project_key = "abc123"
ingest_point = "https://ingest.example.com"
conn_attempt_count = 3
verbose = true

[storage]
key_prefix = "__test_"

[logging]
level = "debug"
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(config.tracker.project_key, "abc123");
        assert_eq!(config.tracker.ingest_point, "https://ingest.example.com");
        assert_eq!(config.tracker.conn_attempt_count, 3);
        assert!(config.tracker.verbose);
        assert_eq!(config.storage.key_prefix, "__test_");
        assert_eq!(config.storage.token_key, "token");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_tracker_validation() {
        assert!(TrackerConfig::default().validate().is_err());
        assert!(valid_tracker().validate().is_ok());

        let config = TrackerConfig {
            ingest_point: "not a url".to_string(),
            ..valid_tracker()
        };
        assert!(config.validate().is_err());

        let config = TrackerConfig {
            conn_attempt_count: 0,
            ..valid_tracker()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_storage_keys_are_versioned() {
        let keys = StorageKeys::default();
        assert_eq!(keys.qualify(&keys.token_key), "__sessioncap_v1_token");
    }
}
