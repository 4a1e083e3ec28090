//! Realm configuration.
//!
//! All bounds are fixed for the lifetime of a realm and checked at every
//! allocation. Values can be loaded from JSON; missing fields take defaults.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::control::TABLE_NAME_LEN;
use crate::error::{AccountError, Result};
use crate::handle::RECORD_SIZE;

/// Default number of table slots per realm.
pub const DEFAULT_MAX_TABLES: usize = 128;

/// Default number of handle slots per realm.
pub const DEFAULT_MAX_HANDLES: usize = 10;

/// Default export scratch buffer size (one page).
pub const DEFAULT_EXPORT_BUFFER_SIZE: usize = 4096;

/// Default minimum spacing between dropped-update warnings.
pub const DEFAULT_OOM_LOG_INTERVAL_MS: u64 = 1000;

/// Configuration for one accounting realm.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AccountConfig {
    /// Maximum number of simultaneously active tables.
    pub max_tables: usize,
    /// Capacity of the handle slot array.
    pub max_handles: usize,
    /// Maximum table name length in bytes.
    pub max_name_len: usize,
    /// Size of the scratch buffer used while exporting records.
    pub export_buffer_size: usize,
    /// Upper bound on allocated counter blocks, if any.
    pub max_blocks: Option<usize>,
    /// Minimum spacing between dropped-update warnings.
    pub oom_log_interval_ms: u64,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            max_tables: DEFAULT_MAX_TABLES,
            max_handles: DEFAULT_MAX_HANDLES,
            max_name_len: TABLE_NAME_LEN - 1,
            export_buffer_size: DEFAULT_EXPORT_BUFFER_SIZE,
            max_blocks: None,
            oom_log_interval_ms: DEFAULT_OOM_LOG_INTERVAL_MS,
        }
    }
}

impl AccountConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: AccountConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(AccountError::ConfigIo)?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_tables == 0 {
            return Err(AccountError::InvalidConfig(
                "max_tables must be at least 1".into(),
            ));
        }
        if self.max_handles == 0 || self.max_handles > u32::MAX as usize {
            return Err(AccountError::InvalidConfig(format!(
                "max_handles must be between 1 and {}",
                u32::MAX
            )));
        }
        // Names travel NUL-terminated in a fixed wire field.
        if self.max_name_len == 0 || self.max_name_len >= TABLE_NAME_LEN {
            return Err(AccountError::InvalidConfig(format!(
                "max_name_len must be between 1 and {}",
                TABLE_NAME_LEN - 1
            )));
        }
        if self.export_buffer_size < RECORD_SIZE {
            return Err(AccountError::InvalidConfig(format!(
                "export_buffer_size must hold at least one {RECORD_SIZE}-byte record"
            )));
        }
        if self.max_blocks == Some(0) {
            return Err(AccountError::InvalidConfig(
                "max_blocks must be at least 1 when set".into(),
            ));
        }
        Ok(())
    }

    pub fn oom_log_interval(&self) -> Duration {
        Duration::from_millis(self.oom_log_interval_ms)
    }
}
