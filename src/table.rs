//! # Table
//!
//! [`Table`] is the façade over one table file. It owns the derived
//! [`TableState`], keeps track of how much of the file it has consumed, and
//! routes every mutation through the cross-process lock.
//!
//! ## Read Path
//!
//! ```text
//! get/has/keys/...
//!   └─ auto_reload? ── stat file ── unchanged ───────────────► serve from state
//!                          │
//!                          ├─ grew ─────── replay new suffix ─► serve
//!                          └─ shrank / replaced ── full replay ► serve
//! ```
//!
//! Readers never take the lock. A line another process is still writing has
//! no newline yet and is left for the next reload.
//!
//! ## Write Path
//!
//! ```text
//! put/delete/clear/commit/compact
//!   └─ acquire <file>.lock (timeout)
//!        ├─ catch up with external appends (replay suffix)
//!        ├─ serialize every line up front (nothing written on error)
//!        ├─ one append + fsync
//!        ├─ fold the new lines into state at their offsets
//!        └─ release lock (drop)
//! ```
//!
//! Mutating methods take `&mut self`, so one instance never runs two writes at
//! once; across processes the file lock is the only exclusion.

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde_json::Value;
use tracing::{debug, warn};

use crate::codec::{
    parse_line, resolve_entry, serialize_header, serialize_operation, validate_record, Entry,
    Header, Operation, Record,
};
use crate::config::{TableConfig, TableOptions};
use crate::error::{Error, Result};
use crate::key::{extract_key, Key, KeySpecifier};
use crate::lock::{lock_path_for, FileLock};
use crate::replay::{build_state, decode_lines, read_from, split_lines, TableState};
use crate::transaction::Transaction;

// =============================================================================
// File Bookkeeping
// =============================================================================

/// What the file looked like the last time we read it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FileMarker {
    pub(crate) len: u64,
    modified: Option<SystemTime>,
    /// (device, inode) on Unix; detects replacement by rename.
    file_id: Option<(u64, u64)>,
}

impl FileMarker {
    pub(crate) fn stat(path: &Path) -> Result<Self> {
        let meta = fs::metadata(path).map_err(|e| Error::io(path, e))?;
        Ok(Self {
            len: meta.len(),
            modified: meta.modified().ok(),
            file_id: file_id(&meta),
        })
    }
}

#[cfg(unix)]
fn file_id(meta: &fs::Metadata) -> Option<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    Some((meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn file_id(_meta: &fs::Metadata) -> Option<(u64, u64)> {
    None
}

/// How far into the file the state reflects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Cursor {
    /// Offset just past the last consumed line
    pub(crate) end: u64,
    /// Number the next line will get
    pub(crate) next_line: u64,
    /// Whether the consumed bytes end with a newline
    pub(crate) terminated: bool,
}

impl Cursor {
    const START: Cursor = Cursor {
        end: 0,
        next_line: 1,
        terminated: true,
    };
}

// =============================================================================
// Table
// =============================================================================

/// An open JSONLT table.
///
/// # Example
///
/// ```rust,no_run
/// use jsonlt::{Table, TableOptions};
/// use serde_json::json;
///
/// # fn main() -> jsonlt::Result<()> {
/// let mut table = Table::open("users.jsonlt", TableOptions::new().create(true).key("id"))?;
/// table.put(json!({"id": "u1", "name": "Alice"}))?;
/// assert_eq!(table.get("u1")?.unwrap()["name"], "Alice");
/// assert!(table.delete("u1")?);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Table {
    pub(crate) path: PathBuf,
    pub(crate) lock_path: PathBuf,
    pub(crate) config: TableConfig,

    /// Resolved key specifier (header's, else caller's).
    pub(crate) key: Option<KeySpecifier>,
    pub(crate) header: Option<Header>,
    /// Header line exactly as found in the file, without newline.
    pub(crate) header_line: Option<Vec<u8>>,

    pub(crate) state: TableState,
    pub(crate) cursor: Cursor,
    pub(crate) marker: Option<FileMarker>,
}

impl Table {
    /// Opens the table at `path`.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] if the file is missing and `create` is not set
    /// - [`Error::InvalidKey`] if the caller's key differs from the header's,
    ///   or the file has records but no key specifier is known
    /// - [`Error::Parse`] (and friends) if any line is malformed; no partial
    ///   table is returned
    pub fn open(path: impl AsRef<Path>, options: TableOptions) -> Result<Self> {
        let config = options.resolve()?;
        let path = path.as_ref().to_path_buf();
        let lock_path = lock_path_for(&path);

        match fs::metadata(&path) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound && config.create => {
                create_file(&path, &lock_path, &config)?;
            }
            Err(e) => return Err(Error::io(&path, e)),
        }

        let mut table = Self {
            path,
            lock_path,
            key: config.key.clone(),
            config,
            header: None,
            header_line: None,
            state: TableState::new(),
            cursor: Cursor::START,
            marker: None,
        };
        // Lock-free like any reader: a line still being appended by another
        // process stays invisible until its newline lands.
        table.replay_full(false)?;

        debug!(
            path = %table.path.display(),
            records = table.state.len(),
            bytes = table.cursor.end,
            "table opened"
        );
        Ok(table)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The file header, if the file has one.
    pub fn header(&self) -> Option<&Header> {
        self.header.as_ref()
    }

    /// The key specifier in force, if one is known yet.
    pub fn key_specifier(&self) -> Option<&KeySpecifier> {
        self.key.as_ref()
    }

    pub fn config(&self) -> &TableConfig {
        &self.config
    }

    pub fn is_read_only(&self) -> bool {
        self.config.read_only
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Returns the live record for `key`.
    pub fn get(&mut self, key: impl Into<Key>) -> Result<Option<Record>> {
        let key = self.check_key(key.into())?;
        self.maybe_reload()?;
        Ok(self.state.get(&key).cloned())
    }

    /// Returns `true` if `key` has a live record.
    pub fn has(&mut self, key: impl Into<Key>) -> Result<bool> {
        let key = self.check_key(key.into())?;
        self.maybe_reload()?;
        Ok(self.state.contains(&key))
    }

    /// Number of live records.
    pub fn len(&mut self) -> Result<usize> {
        self.maybe_reload()?;
        Ok(self.state.len())
    }

    pub fn is_empty(&mut self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Live keys, in no particular order.
    pub fn keys(&mut self) -> Result<impl Iterator<Item = &Key> + '_> {
        self.maybe_reload()?;
        Ok(self.state.iter().map(|(k, _)| k))
    }

    /// Live records, in no particular order.
    pub fn values(&mut self) -> Result<impl Iterator<Item = &Record> + '_> {
        self.maybe_reload()?;
        Ok(self.state.iter().map(|(_, r)| r))
    }

    /// Live `(key, record)` pairs, in no particular order.
    pub fn entries(&mut self) -> Result<impl Iterator<Item = (&Key, &Record)> + '_> {
        self.maybe_reload()?;
        Ok(self.state.iter())
    }

    /// All live records, sorted by key.
    pub fn all(&mut self) -> Result<Vec<Record>> {
        self.find(|_| true)
    }

    /// Live records matching `predicate`, sorted by key.
    pub fn find(&mut self, mut predicate: impl FnMut(&Record) -> bool) -> Result<Vec<Record>> {
        self.maybe_reload()?;
        Ok(self
            .state
            .sorted()
            .into_iter()
            .filter(|(_, r)| predicate(r))
            .map(|(_, r)| r.clone())
            .collect())
    }

    /// The first record in key order matching `predicate`.
    pub fn find_one(&mut self, mut predicate: impl FnMut(&Record) -> bool) -> Result<Option<Record>> {
        self.maybe_reload()?;
        Ok(self
            .state
            .sorted()
            .into_iter()
            .find(|(_, r)| predicate(r))
            .map(|(_, r)| r.clone()))
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Inserts or replaces a record.
    ///
    /// The record must be a JSON object without `$`-prefixed fields and must
    /// carry every key field.
    pub fn put(&mut self, record: impl Into<Value>) -> Result<()> {
        self.ensure_writable()?;
        let record = validate_record(record.into())?;
        let key = extract_key(&record, self.require_key()?)?;
        self.write_locked(|table| table.append_locked(vec![Operation::Upsert { key, record }]))
    }

    /// Deletes the record for `key`.
    ///
    /// Returns `false`, without writing anything, if the key has no live
    /// record.
    pub fn delete(&mut self, key: impl Into<Key>) -> Result<bool> {
        self.ensure_writable()?;
        let key = self.check_key(key.into())?;
        self.maybe_reload()?;
        if !self.state.contains(&key) {
            return Ok(false);
        }
        self.write_locked(|table| {
            // Another process may have deleted it while we waited.
            if !table.state.contains(&key) {
                return Ok(false);
            }
            table.append_locked(vec![Operation::Delete { key }])?;
            Ok(true)
        })
    }

    /// Deletes every live record with one multi-line append of tombstones.
    ///
    /// The file is never truncated; history stays until [`Table::compact`].
    pub fn clear(&mut self) -> Result<()> {
        self.ensure_writable()?;
        self.write_locked(|table| {
            let ops: Vec<Operation> = table
                .state
                .sorted()
                .into_iter()
                .map(|(key, _)| Operation::Delete { key: key.clone() })
                .collect();
            if ops.is_empty() {
                return Ok(());
            }
            table.append_locked(ops)
        })
    }

    /// Starts a transaction on this table.
    pub fn begin(&mut self) -> Result<Transaction<'_>> {
        Ok(Transaction::new(self))
    }

    /// Re-reads the file regardless of `auto_reload`.
    pub fn reload(&mut self) -> Result<()> {
        self.refresh(false, true)
    }

    // =========================================================================
    // Internals shared with transaction and compaction
    // =========================================================================

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        if self.config.read_only {
            return Err(Error::Validation("table is read-only".to_string()));
        }
        Ok(())
    }

    pub(crate) fn require_key(&self) -> Result<&KeySpecifier> {
        self.key
            .as_ref()
            .ok_or_else(|| Error::invalid_key("<none>", "table has no key specifier"))
    }

    /// Validates a caller-supplied key against the table's specifier.
    pub(crate) fn check_key(&self, key: Key) -> Result<Key> {
        match &self.key {
            Some(spec) => key.validate_for(spec)?,
            None => key.validate()?,
        }
        Ok(key)
    }

    /// Reloads if `auto_reload` is on and the file changed.
    pub(crate) fn maybe_reload(&mut self) -> Result<()> {
        if self.config.auto_reload {
            self.refresh(false, false)?;
        }
        Ok(())
    }

    /// Version (offset of the last write) of `key` as currently known.
    pub(crate) fn version_of(&mut self, key: &Key) -> Result<Option<u64>> {
        self.maybe_reload()?;
        Ok(self.state.version(key))
    }

    /// Runs `f` holding the file lock, after catching up with the file.
    pub(crate) fn write_locked<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let _lock = FileLock::acquire(&self.lock_path, self.config.lock_timeout)?;
        self.refresh(true, true)?;
        f(self)
    }

    /// Appends `ops` as one write. The lock must be held and state current.
    ///
    /// Every line is serialized before anything touches the file, so a limit
    /// or key error leaves the file unchanged.
    pub(crate) fn append_locked(&mut self, ops: Vec<Operation>) -> Result<()> {
        let spec = self.require_key()?.clone();
        let mut buf = Vec::new();

        if !self.cursor.terminated {
            warn!(path = %self.path.display(), "file ends without newline; terminating it");
            buf.push(b'\n');
        }

        // First write to an empty headerless file records the key.
        let new_header = if self.cursor.end == 0 && self.header.is_none() {
            let header = Header::new(Some(spec.clone()));
            buf.extend_from_slice(&serialize_header(&header)?);
            Some(header)
        } else {
            None
        };

        let mut placed = Vec::with_capacity(ops.len());
        for op in ops {
            let offset = self.cursor.end + buf.len() as u64;
            buf.extend_from_slice(&serialize_operation(&op, &spec)?);
            placed.push((offset, op));
        }

        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| Error::io(&self.path, e))?;
        // Under the lock the file ends exactly at the cursor.
        append_durably(&mut file, &buf, self.cursor.end).map_err(|e| Error::io(&self.path, e))?;

        let lines = placed.len() as u64;
        if let Some(header) = new_header {
            let line = serialize_header(&header)?;
            self.header_line = Some(line[..line.len() - 1].to_vec());
            self.header = Some(header);
            self.cursor.next_line += 1;
        }

        debug!(
            path = %self.path.display(),
            offset = self.cursor.end,
            lines,
            bytes = buf.len(),
            "appended"
        );

        self.state.replay(placed);
        self.cursor.end += buf.len() as u64;
        self.cursor.next_line += lines;
        self.cursor.terminated = true;
        self.marker = Some(FileMarker::stat(&self.path)?);
        Ok(())
    }

    /// Brings state up to date with the file.
    ///
    /// `locked` means the caller holds the write lock, so no writer can be
    /// mid-line and an unterminated tail is taken as final. `force` skips
    /// the unchanged-marker shortcut.
    fn refresh(&mut self, locked: bool, force: bool) -> Result<()> {
        let current = FileMarker::stat(&self.path)?;
        let previous = match self.marker {
            Some(marker) => marker,
            None => return self.replay_full(locked),
        };
        if !force && current == previous {
            return Ok(());
        }

        let replaced = current.file_id != previous.file_id;
        let shrank = current.len < self.cursor.end;
        let rewritten = current.len == self.cursor.end && current.modified != previous.modified;

        if replaced || shrank || rewritten || self.key.is_none() || self.cursor.end == 0 {
            if replaced || shrank {
                warn!(path = %self.path.display(), "file was rewritten externally; full replay");
            }
            return self.replay_full(locked);
        }
        self.replay_tail(locked)
    }

    /// Rebuilds header, key, and state from the whole file.
    ///
    /// On error nothing is changed.
    fn replay_full(&mut self, include_unterminated: bool) -> Result<()> {
        let marker = FileMarker::stat(&self.path)?;
        let buf = read_from(&self.path, 0)?;
        let lines = split_lines(&buf, 0, 1, include_unterminated);

        let mut header = None;
        let mut header_line = None;
        let mut first = None;
        if let Some(line) = lines.lines.first() {
            match parse_line(line.bytes, line.number)? {
                Entry::Header(h) => {
                    header = Some(h);
                    header_line = Some(line.bytes.to_vec());
                }
                entry => first = Some((line.offset, line.number, entry)),
            }
        }

        let key = resolve_key(
            header.as_ref().and_then(|h| h.key.as_ref()),
            self.config.key.as_ref(),
        )?;

        let mut ops = Vec::new();
        if lines.lines.len() > usize::from(header.is_some()) {
            let spec = key.as_ref().ok_or_else(|| {
                Error::invalid_key("<none>", "file has records but no key specifier")
            })?;
            if let Some((offset, number, entry)) = first {
                ops.push((offset, resolve_entry(entry, number, spec)?));
            }
            ops.extend(decode_lines(&lines.lines[1..], spec)?);
        }

        self.state = build_state(ops);
        self.key = key;
        self.header = header;
        self.header_line = header_line;
        self.cursor = Cursor {
            end: lines.end,
            next_line: 1 + lines.lines.len() as u64,
            terminated: lines.terminated,
        };
        self.marker = Some(marker);

        debug!(path = %self.path.display(), records = self.state.len(), "full replay");
        Ok(())
    }

    /// Folds lines appended since the last read into state.
    ///
    /// On error nothing is changed.
    fn replay_tail(&mut self, include_unterminated: bool) -> Result<()> {
        let marker = FileMarker::stat(&self.path)?;
        let buf = read_from(&self.path, self.cursor.end)?;

        let mut skip = 0;
        if !self.cursor.terminated && !buf.is_empty() {
            // The last line we took had no newline; a writer must have added
            // one before appending. Anything else means that line grew.
            if buf[0] != b'\n' {
                return self.replay_full(include_unterminated);
            }
            skip = 1;
        }

        let spec = self.require_key()?.clone();
        let base = self.cursor.end + skip as u64;
        let lines = split_lines(&buf[skip..], base, self.cursor.next_line, include_unterminated);
        let ops = decode_lines(&lines.lines, &spec)?;

        let count = ops.len();
        self.state.replay(ops);
        if lines.end > self.cursor.end {
            self.cursor = Cursor {
                end: lines.end,
                next_line: self.cursor.next_line + lines.lines.len() as u64,
                terminated: lines.terminated,
            };
        }
        self.marker = Some(marker);

        if count > 0 {
            debug!(path = %self.path.display(), lines = count, "incremental replay");
        }
        Ok(())
    }
}

// =============================================================================
// Appending
// =============================================================================

/// The file operations an append needs.
pub(crate) trait AppendTarget: Write {
    fn sync(&mut self) -> io::Result<()>;
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl AppendTarget for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// Writes `buf` and syncs it. On failure the target is cut back to `len`,
/// its length before the write, so no torn line is left at the end.
pub(crate) fn append_durably<T: AppendTarget>(target: &mut T, buf: &[u8], len: u64) -> io::Result<()> {
    let result = target.write_all(buf).and_then(|()| target.sync());
    if let Err(e) = result {
        if let Err(rollback) = target.truncate(len) {
            warn!(error = %rollback, len, "could not roll back partial append");
        }
        return Err(e);
    }
    Ok(())
}

/// Picks the key specifier: the header's if present, else the caller's.
fn resolve_key(
    header: Option<&KeySpecifier>,
    caller: Option<&KeySpecifier>,
) -> Result<Option<KeySpecifier>> {
    match (header, caller) {
        (Some(h), Some(c)) if h != c => Err(Error::invalid_key(
            c.to_string(),
            format!("does not match header key {h}"),
        )),
        (Some(h), _) => Ok(Some(h.clone())),
        (None, c) => Ok(c.cloned()),
    }
}

/// Creates a missing table file, with a header when a key is known.
fn create_file(path: &Path, lock_path: &Path, config: &TableConfig) -> Result<()> {
    let _lock = FileLock::acquire(lock_path, config.lock_timeout)?;
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            if let Some(key) = &config.key {
                let line = serialize_header(&Header::new(Some(key.clone())))?;
                file.write_all(&line).map_err(|e| Error::io(path, e))?;
                file.sync_data().map_err(|e| Error::io(path, e))?;
            }
            debug!(path = %path.display(), "created table file");
            Ok(())
        }
        // Someone else created it first; open what they wrote.
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(Error::io(path, e)),
    }
}

// =============================================================================
// Tests
// =============================================================================
