//! # Replay Engine
//!
//! The file is the source of truth; [`TableState`] is a cache derived from
//! it by folding operations in file order:
//!
//! ```text
//! offset  line                              state after
//! 0       {"id":"a","v":1}                  a → {v:1}
//! 17      {"id":"b","v":1}                  a → {v:1}, b → {v:1}
//! 34      {"id":"a","v":2}                  a → {v:2}, b → {v:1}
//! 51      {"id":"b","$deleted":true}        a → {v:2}
//! ```
//!
//! Alongside the live records the state keeps, for every key ever written,
//! the byte offset of the line that last wrote it (its *version*). A delete
//! is a write: `b` above keeps version 51 even though it is no longer live.
//! Transactions compare versions to detect concurrent writers.
//!
//! ## Incremental Replay
//!
//! Appends never rewrite earlier lines, so after the initial open only the
//! suffix past the last consumed offset needs parsing. [`split_lines`] stops
//! at the last `\n` unless told otherwise: an unterminated tail may be a
//! line another process is still writing, and becomes visible on a later
//! reload once its newline lands.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::codec::{decode_operation, Operation, Record};
use crate::error::{Error, Result};
use crate::key::{compare_keys, Key, KeySpecifier};

// =============================================================================
// Table State
// =============================================================================

/// Live records plus the per-key version side table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableState {
    /// Key → most recent live record.
    records: HashMap<Key, Record>,

    /// Key → offset of the last operation (upsert or delete) for that key.
    versions: HashMap<Key, u64>,
}

impl TableState {
    /// An empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one operation found at byte `offset`.
    pub fn apply(&mut self, op: Operation, offset: u64) {
        match op {
            Operation::Upsert { key, record } => {
                self.versions.insert(key.clone(), offset);
                self.records.insert(key, record);
            }
            Operation::Delete { key } => {
                self.records.remove(&key);
                self.versions.insert(key, offset);
            }
        }
    }

    /// Folds `ops` into this state in order.
    pub fn replay<I>(&mut self, ops: I)
    where
        I: IntoIterator<Item = (u64, Operation)>,
    {
        for (offset, op) in ops {
            self.apply(op, offset);
        }
    }

    pub fn get(&self, key: &Key) -> Option<&Record> {
        self.records.get(key)
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.records.contains_key(key)
    }

    /// Offset of the last operation for `key`, live or deleted.
    pub fn version(&self, key: &Key) -> Option<u64> {
        self.versions.get(key).copied()
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Live entries in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Record)> {
        self.records.iter()
    }

    /// Live entries sorted by key.
    pub fn sorted(&self) -> Vec<(&Key, &Record)> {
        let mut entries: Vec<_> = self.records.iter().collect();
        entries.sort_by(|a, b| compare_keys(a.0, b.0));
        entries
    }

    /// Replaces the version table after the file was rewritten.
    ///
    /// Deleted keys lose their history: their versions go back to `None`.
    pub fn reset_versions(&mut self, versions: HashMap<Key, u64>) {
        self.versions = versions;
    }
}

/// Builds a state from scratch by folding `ops` in order.
pub fn build_state<I>(ops: I) -> TableState
where
    I: IntoIterator<Item = (u64, Operation)>,
{
    let mut state = TableState::new();
    state.replay(ops);
    state
}

// =============================================================================
// Log Scanning
// =============================================================================

/// One line of the file, without its newline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawLine<'a> {
    /// Byte offset of the first byte of the line in the file
    pub offset: u64,
    /// 1-based line number
    pub number: u64,
    pub bytes: &'a [u8],
}

/// The result of splitting a chunk of the file into lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lines<'a> {
    pub lines: Vec<RawLine<'a>>,
    /// File offset just past the last line taken
    pub end: u64,
    /// Whether the taken bytes end with `\n` (or nothing was taken)
    pub terminated: bool,
}

/// Splits `buf`, which starts at file offset `base` and line number
/// `first_line`, into lines.
///
/// A trailing unterminated fragment is only taken when
/// `include_unterminated` is set; otherwise it is left for a later pass.
pub fn split_lines(buf: &[u8], base: u64, first_line: u64, include_unterminated: bool) -> Lines<'_> {
    let mut lines = Vec::new();
    let mut start = 0usize;
    let mut number = first_line;

    while let Some(pos) = buf[start..].iter().position(|&b| b == b'\n') {
        let end = start + pos;
        lines.push(RawLine {
            offset: base + start as u64,
            number,
            bytes: &buf[start..end],
        });
        number += 1;
        start = end + 1;
    }

    let mut terminated = true;
    if start < buf.len() && include_unterminated {
        lines.push(RawLine {
            offset: base + start as u64,
            number,
            bytes: &buf[start..],
        });
        start = buf.len();
        terminated = false;
    }

    Lines {
        lines,
        end: base + start as u64,
        terminated,
    }
}

/// Decodes body lines into offset-tagged operations.
///
/// All-or-nothing: the first bad line fails the whole batch, so a caller
/// folding the result never applies half a reload.
pub fn decode_lines(lines: &[RawLine<'_>], spec: &KeySpecifier) -> Result<Vec<(u64, Operation)>> {
    lines
        .iter()
        .map(|line| Ok((line.offset, decode_operation(line.bytes, line.number, spec)?)))
        .collect()
}

/// Reads the file from byte `offset` to its current end.
pub fn read_from(path: &Path, offset: u64) -> Result<Vec<u8>> {
    let mut file = File::open(path).map_err(|e| Error::io(path, e))?;
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| Error::io(path, e))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).map_err(|e| Error::io(path, e))?;
    Ok(buf)
}

// =============================================================================
// Tests
// =============================================================================
