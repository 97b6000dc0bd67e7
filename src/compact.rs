//! # Compaction
//!
//! The log only grows: every update and every delete adds a line. Compaction
//! rewrites the file down to the header plus one record per live key, in key
//! order:
//!
//! ```text
//! before                                   after
//! {"$jsonlt":{"version":1,"key":"id"}}     {"$jsonlt":{"version":1,"key":"id"}}
//! {"id":"b","v":1}                         {"id":"a","v":2}
//! {"id":"a","v":1}                         {"id":"b","v":1}
//! {"id":"a","v":2}
//! {"id":"c","v":1}
//! {"id":"c","$deleted":true}
//! ```
//!
//! ## Crash Safety
//!
//! The new contents go to a temporary file in the same directory, are
//! fsynced, and then renamed over the original while the write lock is held.
//! A crash leaves either the old file or the new one, never a mix. Other
//! handles notice the replaced file on their next reload and replay it in
//! full.

use std::collections::HashMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

use tracing::{info, warn};

use crate::codec::serialize_record;
use crate::error::{Error, Result};
use crate::table::{Cursor, FileMarker, Table};

/// What a compaction did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionStats {
    /// Lines in the file before, header included
    pub lines_before: u64,
    /// Lines in the file after, header included
    pub lines_after: u64,
    pub bytes_before: u64,
    pub bytes_after: u64,
    /// Live records written
    pub records_written: usize,
}

impl Table {
    /// Rewrites the file to the header plus one line per live record.
    ///
    /// Holds the write lock throughout. Afterwards every live key's version
    /// is its offset in the new file, and deleted keys have no version.
    pub fn compact(&mut self) -> Result<CompactionStats> {
        self.ensure_writable()?;
        self.write_locked(compact_locked)
    }
}

fn compact_locked(table: &mut Table) -> Result<CompactionStats> {
    let path = table.path.clone();
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => Path::new(".").to_path_buf(),
    };

    let mut stats = CompactionStats {
        lines_before: table.cursor.next_line - 1,
        bytes_before: table.cursor.end,
        ..CompactionStats::default()
    };

    let mut temp = tempfile::Builder::new()
        .prefix(".jsonlt-compact-")
        .tempfile_in(&dir)
        .map_err(|e| Error::io(&dir, e))?;

    let mut versions = HashMap::with_capacity(table.state.len());
    let mut offset = 0u64;
    let mut lines = 0u64;
    {
        let mut writer = BufWriter::new(temp.as_file_mut());
        let mut write = |bytes: &[u8]| -> Result<()> {
            writer.write_all(bytes).map_err(|e| Error::io(&path, e))
        };

        if let Some(header) = &table.header_line {
            write(header)?;
            write(b"\n")?;
            offset += header.len() as u64 + 1;
            lines += 1;
        }

        for (key, record) in table.state.sorted() {
            let line = serialize_record(record)?;
            write(&line)?;
            versions.insert(key.clone(), offset);
            offset += line.len() as u64;
            lines += 1;
            stats.records_written += 1;
        }

        writer.flush().map_err(|e| Error::io(&path, e))?;
    }

    // Keep the original file's permissions on the replacement.
    if let Ok(meta) = fs::metadata(&path) {
        if let Err(e) = temp.as_file().set_permissions(meta.permissions()) {
            warn!(path = %path.display(), error = %e, "could not copy permissions to compacted file");
        }
    }
    temp.as_file().sync_all().map_err(|e| Error::io(&path, e))?;
    temp.persist(&path).map_err(|e| Error::io(&path, e.error))?;
    sync_dir(&dir);

    table.state.reset_versions(versions);
    table.cursor = Cursor {
        end: offset,
        next_line: lines + 1,
        terminated: true,
    };
    table.marker = Some(FileMarker::stat(&path)?);

    stats.lines_after = lines;
    stats.bytes_after = offset;
    info!(
        path = %path.display(),
        lines_before = stats.lines_before,
        lines_after = stats.lines_after,
        bytes_before = stats.bytes_before,
        bytes_after = stats.bytes_after,
        "compacted"
    );
    Ok(stats)
}

/// Makes the rename durable. Best effort: not every platform can open a
/// directory for syncing.
fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    if let Ok(d) = fs::File::open(dir) {
        let _ = d.sync_all();
    }
    #[cfg(not(unix))]
    let _ = dir;
}
