//! # Table Options
//!
//! Callers describe how to open a table with [`TableOptions`], where every
//! field is optional. [`TableOptions::resolve`] fills in defaults once, at
//! open time, producing a [`TableConfig`] whose fields are all set.
//!
//! | Option | Default |
//! |--------|---------|
//! | `create` | `false` |
//! | `read_only` | `false` |
//! | `key` | none (taken from the file header) |
//! | `auto_reload` | `true` |
//! | `lock_timeout` | 5000 ms |

use std::time::Duration;

use crate::error::{Error, Result};
use crate::key::KeySpecifier;

/// Default time to wait for the write lock.
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5000;

/// Caller-facing open options. Unset fields take their defaults.
///
/// ```rust
/// use jsonlt::TableOptions;
///
/// let options = TableOptions::new().create(true).key("id");
/// let config = options.resolve().unwrap();
/// assert!(config.create);
/// assert!(config.auto_reload);
/// ```
#[derive(Debug, Clone, Default)]
pub struct TableOptions {
    pub create: Option<bool>,
    pub read_only: Option<bool>,
    pub key: Option<KeySpecifier>,
    pub auto_reload: Option<bool>,
    pub lock_timeout: Option<Duration>,
}

impl TableOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the file if it does not exist.
    pub fn create(mut self, create: bool) -> Self {
        self.create = Some(create);
        self
    }

    /// Reject every mutating call.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = Some(read_only);
        self
    }

    /// Key specifier; must match the header's if the file has one.
    pub fn key(mut self, key: impl Into<KeySpecifier>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Check for external changes before every read.
    pub fn auto_reload(mut self, auto_reload: bool) -> Self {
        self.auto_reload = Some(auto_reload);
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// Applies defaults and checks option combinations.
    pub fn resolve(&self) -> Result<TableConfig> {
        let config = TableConfig {
            create: self.create.unwrap_or(false),
            read_only: self.read_only.unwrap_or(false),
            key: self.key.clone(),
            auto_reload: self.auto_reload.unwrap_or(true),
            lock_timeout: self
                .lock_timeout
                .unwrap_or(Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS)),
        };

        if config.create && config.read_only {
            return Err(Error::Validation(
                "`create` and `read_only` cannot both be set".to_string(),
            ));
        }
        if let Some(key) = &config.key {
            key.validate()?;
        }
        Ok(config)
    }
}

/// Fully resolved options, fixed for the lifetime of an open table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableConfig {
    pub create: bool,
    pub read_only: bool,
    /// Caller's key specifier; the header's wins when both are present and equal.
    pub key: Option<KeySpecifier>,
    pub auto_reload: bool,
    pub lock_timeout: Duration,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            create: false,
            read_only: false,
            key: None,
            auto_reload: true,
            lock_timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
        }
    }
}
