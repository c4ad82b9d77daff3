//! Configuration types for NewsViews components.
//!
//! Every section has working defaults. A TOML file at
//! `$XDG_CONFIG_HOME/newsviews/config.toml` overrides any subset of them:
//!
//! ```toml
//! [sync]
//! interval_secs = 300
//! duplicate_policy = "reject"
//!
//! [sheet]
//! spreadsheet_id = "1AbC...xyz"
//! ```
//!
//! Secrets (database URL, API keys) never live here; the CLI reads them from
//! the environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::duplicate::DEFAULT_THRESHOLD;
use crate::gate::{DuplicatePolicy, DEFAULT_MIN_DESCRIPTION_LENGTH};

/// Configuration loading and validation failures.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Database connection pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    pub max_connections: u32,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self { max_connections: 5 }
    }
}

/// HTTP client configuration for external API calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_retries: 3,
            retry_base_delay_ms: 500,
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

/// Reconciliation and scheduling configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Base interval between scheduled passes.
    pub interval_secs: u64,
    pub duplicate_threshold: f64,
    pub min_description_length: usize,
    /// The first fetched row of a fresh cursor is a header row.
    pub has_header_row: bool,
    /// Upper bound on any single source or moderation call.
    pub external_timeout_secs: u64,
    /// How long `stop` waits for an in-flight pass.
    pub join_timeout_secs: u64,
    pub duplicate_policy: DuplicatePolicy,
    /// Key under which the cursor is persisted.
    pub source_name: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 150,
            duplicate_threshold: DEFAULT_THRESHOLD,
            min_description_length: DEFAULT_MIN_DESCRIPTION_LENGTH,
            has_header_row: true,
            external_timeout_secs: 30,
            join_timeout_secs: 10,
            duplicate_policy: DuplicatePolicy::Label,
            source_name: "google_form".to_string(),
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn external_timeout(&self) -> Duration {
        Duration::from_secs(self.external_timeout_secs)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }
}

/// Google Sheet holding the form responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SheetConfig {
    pub spreadsheet_id: String,
    pub sheet_name: String,
    /// Last column fetched for each row.
    pub last_column: String,
    pub duplicate_column: String,
    pub inappropriate_column: String,
    pub invalid_column: String,
}

impl Default for SheetConfig {
    fn default() -> Self {
        Self {
            spreadsheet_id: String::new(),
            sheet_name: "Form Responses 1".to_string(),
            last_column: "Z".to_string(),
            duplicate_column: "I".to_string(),
            inappropriate_column: "J".to_string(),
            invalid_column: "K".to_string(),
        }
    }
}

/// Image moderation service settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModerationConfig {
    pub enabled: bool,
    /// OpenAI-compatible chat completions endpoint.
    pub endpoint: String,
    pub model: String,
    pub max_file_size_mb: u64,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            max_file_size_mb: 20,
        }
    }
}

impl ModerationConfig {
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }
}

/// Root of the configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub sync: SyncConfig,
    pub sheet: SheetConfig,
    pub moderation: ModerationConfig,
    pub http: HttpConfig,
    pub db: DbConfig,
}

impl AppConfig {
    /// Checks the values every command relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let threshold = self.sync.duplicate_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "sync.duplicate_threshold must be in (0, 1], got {}",
                threshold
            )));
        }
        if self.sync.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "sync.interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.sync.external_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "sync.external_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.sync.source_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "sync.source_name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Additional checks for commands that read the sheet.
    pub fn validate_for_sync(&self) -> Result<(), ConfigError> {
        self.validate()?;
        if self.sheet.spreadsheet_id.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "sheet.spreadsheet_id is required to sync".to_string(),
            ));
        }
        Ok(())
    }
}

/// Returns `$XDG_CONFIG_HOME/newsviews/config.toml`, if a config directory exists.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("newsviews").join("config.toml"))
}

/// Loads the configuration.
///
/// An explicit `path` must exist. Without one, the default path is used when
/// present and built-in defaults otherwise.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => match default_config_path() {
            Some(p) if p.exists() => p,
            _ => return Ok(AppConfig::default()),
        },
    };

    let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;

    toml::from_str(&content).map_err(|source| ConfigError::Parse { path, source })
}
