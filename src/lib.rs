//! # jsonlt - Append-Only JSON Tables
//!
//! A JSONLT table is a key-value store kept in one newline-delimited JSON
//! file. Every write appends a line; the current contents are whatever the
//! log says after replaying it from the top.
//!
//! ```text
//! {"$jsonlt":{"version":1,"key":"id"}}       ← optional header (line 1)
//! {"id":"alice","role":"admin"}              ← upsert
//! {"id":"bob","role":"user"}                 ← upsert
//! {"id":"alice","role":"owner"}              ← later line wins
//! {"id":"bob","$deleted":true}               ← tombstone
//! ```
//!
//! Replaying that file gives one live record, `alice` with role `owner`.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │           TableHandle (async, owner thread over channel)        │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │     Table  ─ reads, writes, reload, transactions, compaction    │
//! │                                                                 │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────────┐  │
//! │  │ TableState  │  │  FileLock   │  │  codec / key / json     │  │
//! │  │ (replayed)  │  │ (<f>.lock)  │  │  (one line ↔ one op)    │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────────┘  │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               ▼
//!                     table file (append-only)
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Replay defines state**: the in-memory view always equals a replay of
//!    the lines consumed so far
//! 2. **Whole-line appends**: a write appends complete lines under the lock,
//!    or nothing
//! 3. **Last write wins**: for each key, only its latest line counts
//! 4. **Validate before writing**: malformed records and oversized lines are
//!    rejected before the file is touched
//!
//! ## Module Organization
//!
//! - [`error`]: error enum shared by every operation
//! - [`limits`]: format version and size limits
//! - [`key`]: keys, key specifiers, key ordering
//! - [`json`]: strict JSON parsing (no duplicate fields, bounded depth)
//! - [`codec`]: one line of the file to and from an operation
//! - [`replay`]: folding operations into table state
//! - [`lock`]: cross-process write lock
//! - [`config`]: open options
//! - [`table`]: the [`Table`] façade
//! - [`transaction`]: optimistic transactions
//! - [`compact`]: log compaction
//! - [`api`]: async handle

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for table operations.
pub mod error;

/// Format version and hard limits.
pub mod limits;

/// Keys and key specifiers.
///
/// Keys are strings, integers in the JSON-safe range, or tuples of those.
/// Integers sort before strings; tuples compare element by element.
pub mod key;

/// Strict JSON parsing.
pub mod json;

/// Line format: parsing, classification, and serialization.
pub mod codec;

/// Table state and log replay.
pub mod replay;

/// Cross-process advisory locking.
pub mod lock;

/// Table open options.
pub mod config;

/// The table façade.
pub mod table;

/// Optimistic transactions over a table.
///
/// Staged writes become visible to other readers only on commit, as one
/// append. Commit fails with a conflict if any touched key was written by
/// anyone else in the meantime.
pub mod transaction;

/// Log compaction.
pub mod compact;

/// Async handle over a table owned by a background thread.
pub mod api;

// =============================================================================
// Re-exports
// =============================================================================

pub use api::{AsyncTransaction, TableHandle};
pub use codec::{Header, Operation, Record};
pub use compact::CompactionStats;
pub use config::{TableConfig, TableOptions};
pub use error::{Error, Result};
pub use key::{compare_keys, extract_key, Key, KeyElement, KeySpecifier};
pub use lock::FileLock;
pub use table::Table;
pub use transaction::{Transaction, TransactionState, TransactionStatus};
