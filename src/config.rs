// ⚙️ Configuration
// Defaults < TOML file < SALES_SYNC_* environment variables.

use crate::decoder::RecordLayout;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const ENV_CONFIG_PATH: &str = "SALES_SYNC_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

fn invalid(key: &str, value: impl fmt::Display, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

// ============================================================================
// UPDATE MODE
// ============================================================================

/// How a file contribution is folded into the durable total
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateMode {
    /// read_total, add, write_total. Concurrent invocations can lose updates.
    ReadModifyWrite,
    /// One store-side increment per identity
    #[default]
    AtomicIncrement,
}

impl UpdateMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateMode::ReadModifyWrite => "read-modify-write",
            UpdateMode::AtomicIncrement => "atomic-increment",
        }
    }
}

impl fmt::Display for UpdateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpdateMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "read-modify-write" | "rmw" => Ok(UpdateMode::ReadModifyWrite),
            "atomic-increment" | "atomic" => Ok(UpdateMode::AtomicIncrement),
            _ => Err(invalid(
                "update_mode",
                s,
                "expected read-modify-write or atomic-increment",
            )),
        }
    }
}

// ============================================================================
// RETRY SETTINGS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 10_000,
            multiplier: 2.0,
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
        }
    }
}

// ============================================================================
// SYNC CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Name reported in invocation results
    pub table_name: String,
    pub identity_column: String,
    pub amount_column: String,
    pub delimiter: char,
    pub archive_prefix: String,
    pub update_mode: UpdateMode,
    pub retry: RetrySettings,
    /// Root directory of the filesystem object store
    pub object_root: PathBuf,
    pub database_path: PathBuf,
    pub busy_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            table_name: "sales-totals".to_string(),
            identity_column: "id".to_string(),
            amount_column: "amount".to_string(),
            delimiter: ',',
            archive_prefix: crate::relocator::DEFAULT_ARCHIVE_PREFIX.to_string(),
            update_mode: UpdateMode::default(),
            retry: RetrySettings::default(),
            object_root: PathBuf::from("data/objects"),
            database_path: PathBuf::from("data/sales-totals.db"),
            busy_timeout_ms: 5_000,
        }
    }
}

impl SyncConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// File named by SALES_SYNC_CONFIG (or defaults), then env overrides
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match env::var_os(ENV_CONFIG_PATH) {
            Some(path) => Self::load(Path::new(&path))?,
            None => SyncConfig::default(),
        };
        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `SALES_SYNC_*` overrides from any lookup (env in production)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SALES_SYNC_TABLE") {
            self.table_name = v;
        }
        if let Some(v) = lookup("SALES_SYNC_IDENTITY_COLUMN") {
            self.identity_column = v;
        }
        if let Some(v) = lookup("SALES_SYNC_AMOUNT_COLUMN") {
            self.amount_column = v;
        }
        if let Some(v) = lookup("SALES_SYNC_ARCHIVE_PREFIX") {
            self.archive_prefix = v;
        }
        if let Some(v) = lookup("SALES_SYNC_UPDATE_MODE") {
            self.update_mode = v.parse()?;
        }
        if let Some(v) = lookup("SALES_SYNC_OBJECT_ROOT") {
            self.object_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("SALES_SYNC_DB") {
            self.database_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("SALES_SYNC_MAX_ATTEMPTS") {
            self.retry.max_attempts = v
                .parse()
                .map_err(|_| invalid("SALES_SYNC_MAX_ATTEMPTS", &v, "expected an integer"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", 0, "must be at least 1"));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(invalid(
                "retry.initial_delay_ms",
                self.retry.initial_delay_ms,
                "must not exceed retry.max_delay_ms",
            ));
        }
        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            return Err(invalid("retry.multiplier", self.retry.multiplier, "must be >= 1.0"));
        }
        if !self.delimiter.is_ascii() || self.delimiter == '"' || self.delimiter == '\n' {
            return Err(invalid(
                "delimiter",
                self.delimiter.escape_default(),
                "must be a single ASCII byte other than quote or newline",
            ));
        }
        if self.identity_column.is_empty() || self.amount_column.is_empty() {
            return Err(invalid("identity_column/amount_column", "", "must not be empty"));
        }
        if self.identity_column == self.amount_column {
            return Err(invalid(
                "amount_column",
                &self.amount_column,
                "must differ from identity_column",
            ));
        }
        if self.archive_prefix.trim_matches('/').is_empty() {
            return Err(invalid("archive_prefix", &self.archive_prefix, "must not be empty"));
        }
        Ok(())
    }

    pub fn layout(&self) -> RecordLayout {
        RecordLayout::new(
            self.delimiter as u8,
            &self.identity_column,
            &self.amount_column,
        )
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}
