//! # Error Handling for JSONLT Tables
//!
//! This module defines the error type used throughout the crate. A single
//! error enum ([`Error`]) represents every failure mode, so callers can match
//! on one type regardless of which layer (codec, replay, lock, transaction)
//! detected the problem.
//!
//! ## Error Categories
//!
//! | Category | Variant | Typical Response |
//! |----------|---------|------------------|
//! | Malformed file | [`Error::Parse`] | Fix the file by hand, reopen |
//! | Bad key | [`Error::InvalidKey`] | Fix the caller's record or key |
//! | Bad record / misuse | [`Error::Validation`] | Fix the caller |
//! | Ceiling exceeded | [`Error::LimitExceeded`] | Shrink the record or key |
//! | Filesystem | [`Error::Io`] | Log and investigate |
//! | Contention | [`Error::LockTimeout`] | Retry later |
//! | Concurrent write | [`Error::Conflict`] | Re-read and retry the transaction |
//! | Transaction misuse | [`Error::Transaction`] | Fix the caller |
//!
//! Nothing in the engine retries on its own. Retrying after a conflict or a
//! lock timeout is caller policy; [`Error::is_retryable`] tells the two apart
//! from permanent failures.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::key::Key;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in table operations.
///
/// # Example
///
/// ```rust,ignore
/// use jsonlt::{Error, Result};
///
/// fn example(table: &mut jsonlt::Table) -> Result<()> {
///     match table.put(serde_json::json!({"id": "u1"})) {
///         Err(Error::LockTimeout { timeout, .. }) => {
///             eprintln!("lock busy for {:?}, try again later", timeout);
///             Ok(())
///         }
///         other => other,
///     }
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Format Errors
    // =========================================================================

    /// A line of the log could not be parsed.
    ///
    /// Covers malformed JSON, invalid UTF-8, duplicate object fields, blank
    /// lines, excessive nesting, a header anywhere but line 1, and an
    /// unsupported header version. `line` is 1-based; `column` comes from the
    /// JSON parser when it can pinpoint the failure.
    #[error("parse error at line {line}{}: {message}", column.map(|c| format!(", column {c}")).unwrap_or_default())]
    Parse {
        /// 1-based line number in the file
        line: u64,
        /// 1-based column, when known
        column: Option<u64>,
        /// What went wrong
        message: String,
    },

    /// A key, key field, or key specifier is invalid.
    ///
    /// Raised for missing key fields, keys of the wrong JSON type, non-integer
    /// or out-of-range numbers, empty tuples, and a header/caller specifier
    /// mismatch.
    #[error("invalid key {subject}: {reason}")]
    InvalidKey {
        /// The offending key, field name, or specifier
        subject: String,
        /// Why it was rejected
        reason: String,
    },

    /// A record or call is not acceptable.
    ///
    /// `$`-prefixed fields in a record, non-object records, and mutations on a
    /// read-only table all end up here.
    #[error("validation error: {0}")]
    Validation(String),

    /// A fixed ceiling from [`crate::limits`] was exceeded.
    #[error("limit '{limit}' exceeded: {actual} > {maximum}")]
    LimitExceeded {
        /// Name of the limit (`key_length`, `record_size`, ...)
        limit: &'static str,
        /// Observed size
        actual: usize,
        /// Allowed maximum
        maximum: usize,
    },

    // =========================================================================
    // Environment Errors
    // =========================================================================

    /// A filesystem operation failed.
    #[error("i/o error on '{}': {source}", path.display())]
    Io {
        /// The file the operation concerned
        path: PathBuf,
        /// The underlying error
        #[source]
        source: io::Error,
    },

    /// The exclusive file lock could not be taken in time.
    ///
    /// Another process (or another handle in this process) is holding the
    /// lock. The file was not touched.
    #[error("timed out after {timeout:?} waiting for lock on '{}'", path.display())]
    LockTimeout {
        /// The lock file
        path: PathBuf,
        /// How long we waited
        timeout: Duration,
    },

    // =========================================================================
    // Transaction Errors
    // =========================================================================

    /// Optimistic concurrency conflict: keys touched by a transaction were
    /// written by someone else before it committed.
    ///
    /// # Recovery
    ///
    /// 1. Start a new transaction
    /// 2. Re-read the conflicting keys
    /// 3. Re-apply the business logic and commit again
    #[error("conflict on keys [{}]", keys.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "))]
    Conflict {
        /// Keys whose version changed underneath the transaction
        keys: Vec<Key>,
    },

    /// A transaction was used in a state that does not allow the call.
    #[error("transaction error: {0}")]
    Transaction(String),

    /// The thread owning an async table handle has stopped.
    #[error("table owner has shut down")]
    Closed,
}

impl Error {
    /// Wraps an I/O error together with the path it concerns.
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        Error::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Builds an [`Error::InvalidKey`].
    pub(crate) fn invalid_key(subject: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidKey {
            subject: subject.into(),
            reason: reason.into(),
        }
    }

    /// Builds an [`Error::Parse`] without a column.
    pub(crate) fn parse(line: u64, message: impl Into<String>) -> Self {
        Error::Parse {
            line,
            column: None,
            message: message.into(),
        }
    }

    /// Returns `true` if this is a transaction conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// Returns `true` if retrying the same call later may succeed.
    ///
    /// Only conflicts and lock timeouts qualify; everything else needs the
    /// caller or the file to change first.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Conflict { .. } | Error::LockTimeout { .. })
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
