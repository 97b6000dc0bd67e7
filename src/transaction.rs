//! # Optimistic Transactions
//!
//! A transaction stages puts and deletes in memory and writes them as one
//! batch on commit, or not at all.
//!
//! ## Lifecycle
//!
//! ```text
//!            begin()
//!   Idle ─────────────► Active ──commit() ok──────► Committed
//!                         │
//!                         ├──commit() conflict/err─► Aborted
//!                         └──abort()───────────────► Aborted
//! ```
//!
//! ## Conflict Detection
//!
//! The first time a transaction touches a key (read or write), it records the
//! key's *version*: the file offset of the last operation for that key, or
//! `None` if the key was never written. At commit, under the file lock and
//! after catching up with the file, every touched key's version is compared
//! with the recorded one:
//!
//! ```text
//! touch "x"  → version 120        external writer appends "x" at 480
//! commit     → lock, replay tail → version 480 ≠ 120 → Conflict(["x"])
//! ```
//!
//! Nothing is locked while staging. Retrying after a conflict is up to the
//! caller.

use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, warn};

use crate::codec::{validate_record, Operation, Record};
use crate::error::{Error, Result};
use crate::key::{extract_key, Key};
use crate::table::Table;

/// Where a transaction is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Active,
    Committed,
    Aborted,
}

/// Staged operations and captured versions, independent of any borrow of
/// the table. [`Transaction`] pairs one with `&mut Table`; the async handle
/// keeps one on its owner thread between requests.
#[derive(Debug)]
pub struct TransactionState {
    status: TransactionStatus,

    /// Staged operations in staging order, at most one per key.
    staged: Vec<Operation>,

    /// Key → position in `staged`.
    staged_index: HashMap<Key, usize>,

    /// Key → version seen on first touch.
    snapshot: HashMap<Key, Option<u64>>,
}

impl Default for TransactionState {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionState {
    pub fn new() -> Self {
        Self {
            status: TransactionStatus::Active,
            staged: Vec::new(),
            staged_index: HashMap::new(),
            snapshot: HashMap::new(),
        }
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    /// Number of staged operations.
    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    fn ensure_active(&self) -> Result<()> {
        match self.status {
            TransactionStatus::Active => Ok(()),
            TransactionStatus::Committed => {
                Err(Error::Transaction("transaction already committed".to_string()))
            }
            TransactionStatus::Aborted => {
                Err(Error::Transaction("transaction was aborted".to_string()))
            }
        }
    }

    /// Records the version of `key` the first time it is touched.
    fn touch(&mut self, table: &mut Table, key: &Key) -> Result<()> {
        if !self.snapshot.contains_key(key) {
            let version = table.version_of(key)?;
            self.snapshot.insert(key.clone(), version);
        }
        Ok(())
    }

    fn stage(&mut self, op: Operation) {
        match self.staged_index.get(op.key()) {
            Some(&i) => self.staged[i] = op,
            None => {
                self.staged_index.insert(op.key().clone(), self.staged.len());
                self.staged.push(op);
            }
        }
    }

    /// Reads `key`, seeing this transaction's staged writes first.
    pub fn get(&mut self, table: &mut Table, key: Key) -> Result<Option<Record>> {
        self.ensure_active()?;
        let key = table.check_key(key)?;
        self.touch(table, &key)?;
        match self.staged_index.get(&key).map(|&i| &self.staged[i]) {
            Some(Operation::Upsert { record, .. }) => Ok(Some(record.clone())),
            Some(Operation::Delete { .. }) => Ok(None),
            None => table.get(key),
        }
    }

    pub fn has(&mut self, table: &mut Table, key: Key) -> Result<bool> {
        Ok(self.get(table, key)?.is_some())
    }

    /// Stages an upsert.
    pub fn put(&mut self, table: &mut Table, record: Value) -> Result<()> {
        self.ensure_active()?;
        table.ensure_writable()?;
        let record = validate_record(record)?;
        let key = extract_key(&record, table.require_key()?)?;
        self.touch(table, &key)?;
        self.stage(Operation::Upsert { key, record });
        Ok(())
    }

    /// Stages a delete. Returns `false`, staging nothing, if the key is not
    /// live in this transaction's view.
    pub fn delete(&mut self, table: &mut Table, key: Key) -> Result<bool> {
        self.ensure_active()?;
        table.ensure_writable()?;
        let key = table.check_key(key)?;
        if self.get(table, key.clone())?.is_none() {
            return Ok(false);
        }
        self.stage(Operation::Delete { key });
        Ok(true)
    }

    /// Validates versions and appends all staged operations as one batch.
    ///
    /// On any failure the transaction becomes [`TransactionStatus::Aborted`]
    /// and the file is untouched.
    pub fn commit(&mut self, table: &mut Table) -> Result<()> {
        self.ensure_active()?;
        let staged = std::mem::take(&mut self.staged);
        self.staged_index.clear();
        let snapshot = std::mem::take(&mut self.snapshot);

        let result = if staged.is_empty() {
            Ok(())
        } else {
            commit_batch(table, staged, &snapshot)
        };

        self.status = if result.is_ok() {
            TransactionStatus::Committed
        } else {
            TransactionStatus::Aborted
        };
        result
    }

    /// Discards staged operations.
    pub fn abort(&mut self) -> Result<()> {
        self.ensure_active()?;
        self.staged.clear();
        self.staged_index.clear();
        self.snapshot.clear();
        self.status = TransactionStatus::Aborted;
        Ok(())
    }
}

/// Checks `snapshot` against the file and appends `ops`, all under one lock.
fn commit_batch(
    table: &mut Table,
    ops: Vec<Operation>,
    snapshot: &HashMap<Key, Option<u64>>,
) -> Result<()> {
    table.ensure_writable()?;
    table.write_locked(|table| {
        let mut conflicts: Vec<Key> = snapshot
            .iter()
            .filter(|(key, seen)| table.state.version(key) != **seen)
            .map(|(key, _)| key.clone())
            .collect();

        if !conflicts.is_empty() {
            conflicts.sort();
            warn!(
                path = %table.path.display(),
                keys = conflicts.len(),
                "transaction conflict"
            );
            return Err(Error::Conflict { keys: conflicts });
        }

        let count = ops.len();
        table.append_locked(ops)?;
        debug!(path = %table.path.display(), operations = count, "transaction committed");
        Ok(())
    })
}

// =============================================================================
// Borrowing Transaction
// =============================================================================

/// A transaction holding the table for its whole lifetime.
///
/// Obtained from [`Table::begin`]. Because it borrows the table mutably, no
/// other call (and no second transaction) can run on the same `Table` until
/// it is dropped. Dropping an active transaction aborts it.
///
/// ```rust,no_run
/// use jsonlt::{Error, Table, TableOptions};
/// use serde_json::json;
///
/// # fn main() -> jsonlt::Result<()> {
/// let mut table = Table::open("accounts.jsonlt", TableOptions::new().create(true).key("id"))?;
/// let mut tx = table.begin()?;
/// let balance = tx.get("alice")?.and_then(|r| r["balance"].as_i64()).unwrap_or(0);
/// tx.put(json!({"id": "alice", "balance": balance + 10}))?;
/// match tx.commit() {
///     Err(Error::Conflict { keys }) => eprintln!("retry, changed: {keys:?}"),
///     other => other?,
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Transaction<'a> {
    table: &'a mut Table,
    state: TransactionState,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(table: &'a mut Table) -> Self {
        Self {
            table,
            state: TransactionState::new(),
        }
    }

    pub fn status(&self) -> TransactionStatus {
        self.state.status()
    }

    pub fn get(&mut self, key: impl Into<Key>) -> Result<Option<Record>> {
        self.state.get(self.table, key.into())
    }

    pub fn has(&mut self, key: impl Into<Key>) -> Result<bool> {
        self.state.has(self.table, key.into())
    }

    pub fn put(&mut self, record: impl Into<Value>) -> Result<()> {
        self.state.put(self.table, record.into())
    }

    pub fn delete(&mut self, key: impl Into<Key>) -> Result<bool> {
        self.state.delete(self.table, key.into())
    }

    pub fn commit(&mut self) -> Result<()> {
        self.state.commit(self.table)
    }

    pub fn abort(&mut self) -> Result<()> {
        self.state.abort()
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.state.status() == TransactionStatus::Active && self.state.staged_len() > 0 {
            debug!(
                path = %self.table.path().display(),
                staged = self.state.staged_len(),
                "uncommitted transaction dropped"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableOptions;
    use serde_json::json;
    use std::fs;

    fn temp_table() -> (tempfile::TempDir, Table) {
        let dir = tempfile::tempdir().unwrap();
        let table =
            Table::open(dir.path().join("t.jsonlt"), TableOptions::new().create(true).key("id"))
                .unwrap();
        (dir, table)
    }

    #[test]
    fn test_staging_does_not_touch_file_or_table() {
        let (_dir, mut table) = temp_table();
        let before = fs::read(table.path()).unwrap();

        let mut state = TransactionState::new();
        state.put(&mut table, json!({"id": 1, "v": "a"})).unwrap();

        assert_eq!(fs::read(table.path()).unwrap(), before);
        assert!(!table.has(1).unwrap());
        assert_eq!(state.get(&mut table, Key::from(1)).unwrap().unwrap()["v"], "a");
    }

    #[test]
    fn test_restaging_a_key_keeps_one_operation() {
        let (_dir, mut table) = temp_table();
        let mut state = TransactionState::new();
        state.put(&mut table, json!({"id": 1, "v": "a"})).unwrap();
        state.put(&mut table, json!({"id": 1, "v": "b"})).unwrap();
        assert_eq!(state.staged_len(), 1);
        assert!(state.delete(&mut table, Key::from(1)).unwrap());
        assert_eq!(state.staged_len(), 1);
        assert!(!state.has(&mut table, Key::from(1)).unwrap());
        assert!(!state.delete(&mut table, Key::from(1)).unwrap());
    }

    #[test]
    fn test_commit_appends_in_staging_order() {
        let (_dir, mut table) = temp_table();
        table.put(json!({"id": 9})).unwrap();

        let mut state = TransactionState::new();
        state.put(&mut table, json!({"id": 2})).unwrap();
        assert!(state.delete(&mut table, Key::from(9)).unwrap());
        state.put(&mut table, json!({"id": 1})).unwrap();
        state.commit(&mut table).unwrap();
        assert_eq!(state.status(), TransactionStatus::Committed);

        let text = fs::read_to_string(table.path()).unwrap();
        let body: Vec<&str> = text.lines().skip(2).collect();
        assert_eq!(body, vec!["{\"id\":2}", "{\"id\":9,\"$deleted\":true}", "{\"id\":1}"]);
        assert_eq!(table.len().unwrap(), 2);
    }

    #[test]
    fn test_use_after_commit_or_abort() {
        let (_dir, mut table) = temp_table();

        let mut committed = TransactionState::new();
        committed.commit(&mut table).unwrap();
        assert!(matches!(
            committed.put(&mut table, json!({"id": 1})),
            Err(Error::Transaction(_))
        ));
        assert!(matches!(committed.commit(&mut table), Err(Error::Transaction(_))));

        let mut aborted = TransactionState::new();
        aborted.put(&mut table, json!({"id": 1})).unwrap();
        aborted.abort().unwrap();
        assert_eq!(aborted.status(), TransactionStatus::Aborted);
        assert!(matches!(aborted.commit(&mut table), Err(Error::Transaction(_))));
        assert!(matches!(aborted.abort(), Err(Error::Transaction(_))));
        assert!(!table.has(1).unwrap());
    }

    #[test]
    fn test_local_write_after_touch_conflicts() {
        let (_dir, mut table) = temp_table();
        let mut state = TransactionState::new();
        state.put(&mut table, json!({"id": "x", "v": 1})).unwrap();

        // Any write to the key after it was touched counts, even from this
        // process.
        table.put(json!({"id": "x", "v": 0})).unwrap();

        match state.commit(&mut table).unwrap_err() {
            Error::Conflict { keys } => assert_eq!(keys, vec![Key::from("x")]),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(state.status(), TransactionStatus::Aborted);
        assert_eq!(table.get("x").unwrap().unwrap()["v"], 0);
    }

    #[test]
    fn test_read_only_table_rejects_staged_writes() {
        let (dir, _table) = temp_table();
        let mut ro =
            Table::open(dir.path().join("t.jsonlt"), TableOptions::new().read_only(true)).unwrap();
        let mut tx = ro.begin().unwrap();
        assert!(matches!(tx.put(json!({"id": 1})), Err(Error::Validation(_))));
        assert_eq!(tx.get(1).unwrap(), None);
    }
}
