//! # Async API
//!
//! [`Table`] is blocking: every call may stat, read, lock, and fsync the file.
//! [`TableHandle`] moves the table onto a dedicated thread and talks to it
//! over a channel, so async callers never block their runtime:
//!
//! ```text
//! ┌──────────────┐   Request + oneshot   ┌──────────────────────────┐
//! │ TableHandle  │ ─────────────────────►│ owner thread             │
//! │ (Clone)      │                       │   Table                  │
//! │              │◄───────────────────── │   active transaction     │
//! └──────────────┘        Result<T>      └──────────────────────────┘
//! ```
//!
//! Requests run one at a time in arrival order. Clones share the owner; it
//! stops when the last handle (and the last [`AsyncTransaction`]) is dropped.
//!
//! ## Transactions
//!
//! At most one transaction is active per owner. A second
//! [`TableHandle::begin`] while one is active fails with
//! [`Error::Transaction`]. Dropping an [`AsyncTransaction`] without
//! committing aborts it.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::codec::Record;
use crate::compact::CompactionStats;
use crate::config::TableOptions;
use crate::error::{Error, Result};
use crate::key::Key;
use crate::table::Table;
use crate::transaction::{TransactionState, TransactionStatus};

type Reply<T> = oneshot::Sender<Result<T>>;

// =============================================================================
// Requests
// =============================================================================

enum Request {
    Get { key: Key, reply: Reply<Option<Record>> },
    Has { key: Key, reply: Reply<bool> },
    Put { record: Value, reply: Reply<()> },
    Delete { key: Key, reply: Reply<bool> },
    All { reply: Reply<Vec<Record>> },
    Keys { reply: Reply<Vec<Key>> },
    Len { reply: Reply<usize> },
    Clear { reply: Reply<()> },
    Compact { reply: Reply<CompactionStats> },
    Reload { reply: Reply<()> },

    Begin { reply: Reply<u64> },
    TxGet { id: u64, key: Key, reply: Reply<Option<Record>> },
    TxHas { id: u64, key: Key, reply: Reply<bool> },
    TxPut { id: u64, record: Value, reply: Reply<()> },
    TxDelete { id: u64, key: Key, reply: Reply<bool> },
    TxCommit { id: u64, reply: Reply<()> },
    TxAbort { id: u64, reply: Reply<()> },
    /// Sent from `Drop`; nobody waits for the answer.
    TxRelease { id: u64 },
}

// =============================================================================
// Owner
// =============================================================================

/// State living on the owner thread.
struct Owner {
    table: Table,
    active: Option<(u64, TransactionState)>,
    next_id: u64,
}

impl Owner {
    fn new(table: Table) -> Self {
        Self {
            table,
            active: None,
            next_id: 1,
        }
    }

    fn run(mut self, mut rx: mpsc::UnboundedReceiver<Request>) {
        while let Some(request) = rx.blocking_recv() {
            self.handle(request);
        }
        debug!(path = %self.table.path().display(), "table owner stopped");
    }

    fn handle(&mut self, request: Request) {
        // A send error means the caller stopped waiting; nothing to do.
        match request {
            Request::Get { key, reply } => {
                let _ = reply.send(self.table.get(key));
            }
            Request::Has { key, reply } => {
                let _ = reply.send(self.table.has(key));
            }
            Request::Put { record, reply } => {
                let _ = reply.send(self.table.put(record));
            }
            Request::Delete { key, reply } => {
                let _ = reply.send(self.table.delete(key));
            }
            Request::All { reply } => {
                let _ = reply.send(self.table.all());
            }
            Request::Keys { reply } => {
                let _ = reply.send(self.sorted_keys());
            }
            Request::Len { reply } => {
                let _ = reply.send(self.table.len());
            }
            Request::Clear { reply } => {
                let _ = reply.send(self.table.clear());
            }
            Request::Compact { reply } => {
                let _ = reply.send(self.table.compact());
            }
            Request::Reload { reply } => {
                let _ = reply.send(self.table.reload());
            }
            Request::Begin { reply } => {
                let _ = reply.send(self.begin());
            }
            Request::TxGet { id, key, reply } => {
                let _ = reply.send(self.with_transaction(id, |tx, table| tx.get(table, key)));
            }
            Request::TxHas { id, key, reply } => {
                let _ = reply.send(self.with_transaction(id, |tx, table| tx.has(table, key)));
            }
            Request::TxPut { id, record, reply } => {
                let _ = reply.send(self.with_transaction(id, |tx, table| tx.put(table, record)));
            }
            Request::TxDelete { id, key, reply } => {
                let _ = reply.send(self.with_transaction(id, |tx, table| tx.delete(table, key)));
            }
            Request::TxCommit { id, reply } => {
                let _ = reply.send(self.with_transaction(id, |tx, table| tx.commit(table)));
            }
            Request::TxAbort { id, reply } => {
                let _ = reply.send(self.with_transaction(id, |tx, _| tx.abort()));
            }
            Request::TxRelease { id } => {
                if matches!(self.active, Some((active, _)) if active == id) {
                    debug!(path = %self.table.path().display(), id, "transaction dropped; aborting");
                    self.active = None;
                }
            }
        }
    }

    fn sorted_keys(&mut self) -> Result<Vec<Key>> {
        let mut keys: Vec<Key> = self.table.keys()?.cloned().collect();
        keys.sort();
        Ok(keys)
    }

    fn begin(&mut self) -> Result<u64> {
        if self.active.is_some() {
            return Err(Error::Transaction(
                "a transaction is already active on this table".to_string(),
            ));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.active = Some((id, TransactionState::new()));
        Ok(id)
    }

    /// Runs `f` on transaction `id`, forgetting it once it stops being active.
    fn with_transaction<T>(
        &mut self,
        id: u64,
        f: impl FnOnce(&mut TransactionState, &mut Table) -> Result<T>,
    ) -> Result<T> {
        let (result, finished) = match &mut self.active {
            Some((active, state)) if *active == id => {
                let result = f(state, &mut self.table);
                (result, state.status() != TransactionStatus::Active)
            }
            _ => {
                return Err(Error::Transaction(
                    "transaction is no longer active".to_string(),
                ))
            }
        };
        if finished {
            self.active = None;
        }
        result
    }
}

// =============================================================================
// Table Handle
// =============================================================================

/// Async handle to a table owned by a background thread.
///
/// ```rust,no_run
/// use jsonlt::{TableHandle, TableOptions};
/// use serde_json::json;
///
/// # async fn run() -> jsonlt::Result<()> {
/// let table = TableHandle::open("users.jsonlt", TableOptions::new().create(true).key("id")).await?;
/// table.put(json!({"id": "u1", "name": "Alice"})).await?;
/// assert!(table.has("u1").await?);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct TableHandle {
    tx: mpsc::UnboundedSender<Request>,
    path: PathBuf,
}

impl std::fmt::Debug for TableHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableHandle").field("path", &self.path).finish()
    }
}

impl TableHandle {
    /// Opens the table on a new owner thread.
    ///
    /// Fails with the same errors as [`Table::open`].
    pub async fn open(path: impl AsRef<Path>, options: TableOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let open_path = path.clone();
        std::thread::Builder::new()
            .name("jsonlt-table".to_string())
            .spawn(move || {
                let table = match Table::open(&open_path, options) {
                    Ok(table) => table,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if ready_tx.send(Ok(())).is_ok() {
                    Owner::new(table).run(rx);
                }
            })
            .map_err(|e| Error::io(&path, e))?;

        ready_rx.await.map_err(|_| Error::Closed)??;
        Ok(Self { tx, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn call<T>(&self, request: impl FnOnce(Reply<T>) -> Request) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.tx.send(request(reply)).map_err(|_| Error::Closed)?;
        response.await.map_err(|_| Error::Closed)?
    }

    pub async fn get(&self, key: impl Into<Key>) -> Result<Option<Record>> {
        let key = key.into();
        self.call(|reply| Request::Get { key, reply }).await
    }

    pub async fn has(&self, key: impl Into<Key>) -> Result<bool> {
        let key = key.into();
        self.call(|reply| Request::Has { key, reply }).await
    }

    pub async fn put(&self, record: impl Into<Value>) -> Result<()> {
        let record = record.into();
        self.call(|reply| Request::Put { record, reply }).await
    }

    /// Returns `false` if the key had no live record.
    pub async fn delete(&self, key: impl Into<Key>) -> Result<bool> {
        let key = key.into();
        self.call(|reply| Request::Delete { key, reply }).await
    }

    /// All live records, sorted by key.
    pub async fn all(&self) -> Result<Vec<Record>> {
        self.call(|reply| Request::All { reply }).await
    }

    /// All live keys, sorted.
    pub async fn keys(&self) -> Result<Vec<Key>> {
        self.call(|reply| Request::Keys { reply }).await
    }

    pub async fn len(&self) -> Result<usize> {
        self.call(|reply| Request::Len { reply }).await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    pub async fn clear(&self) -> Result<()> {
        self.call(|reply| Request::Clear { reply }).await
    }

    pub async fn compact(&self) -> Result<CompactionStats> {
        self.call(|reply| Request::Compact { reply }).await
    }

    pub async fn reload(&self) -> Result<()> {
        self.call(|reply| Request::Reload { reply }).await
    }

    /// Starts a transaction.
    ///
    /// # Errors
    ///
    /// [`Error::Transaction`] if another transaction is active on this table.
    pub async fn begin(&self) -> Result<AsyncTransaction> {
        let id = self.call(|reply| Request::Begin { reply }).await?;
        Ok(AsyncTransaction {
            handle: self.clone(),
            id,
            finished: false,
        })
    }
}

// =============================================================================
// Async Transaction
// =============================================================================

/// A transaction running on a [`TableHandle`]'s owner thread.
///
/// `commit` and `abort` consume it. Dropping it first aborts it.
#[derive(Debug)]
pub struct AsyncTransaction {
    handle: TableHandle,
    id: u64,
    finished: bool,
}

impl AsyncTransaction {
    pub async fn get(&self, key: impl Into<Key>) -> Result<Option<Record>> {
        let (id, key) = (self.id, key.into());
        self.handle.call(|reply| Request::TxGet { id, key, reply }).await
    }

    pub async fn has(&self, key: impl Into<Key>) -> Result<bool> {
        let (id, key) = (self.id, key.into());
        self.handle.call(|reply| Request::TxHas { id, key, reply }).await
    }

    pub async fn put(&self, record: impl Into<Value>) -> Result<()> {
        let (id, record) = (self.id, record.into());
        self.handle.call(|reply| Request::TxPut { id, record, reply }).await
    }

    pub async fn delete(&self, key: impl Into<Key>) -> Result<bool> {
        let (id, key) = (self.id, key.into());
        self.handle.call(|reply| Request::TxDelete { id, key, reply }).await
    }

    /// Commits staged operations, or fails with [`Error::Conflict`] and
    /// writes nothing.
    pub async fn commit(mut self) -> Result<()> {
        let id = self.id;
        let result = self.handle.call(|reply| Request::TxCommit { id, reply }).await;
        self.finished = true;
        result
    }

    pub async fn abort(mut self) -> Result<()> {
        let id = self.id;
        let result = self.handle.call(|reply| Request::TxAbort { id, reply }).await;
        self.finished = true;
        result
    }
}

impl Drop for AsyncTransaction {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.handle.tx.send(Request::TxRelease { id: self.id });
        }
    }
}
