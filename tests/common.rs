#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use jsonlt::{Table, TableOptions};

pub const HEADER_ID: &str = "{\"$jsonlt\":{\"version\":1,\"key\":\"id\"}}";

/// A fresh directory and a path for a table file inside it.
pub fn temp_table_path(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    (dir, path)
}

/// Creates a table keyed on `id` and returns it with its directory.
pub fn create_table(name: &str) -> (tempfile::TempDir, PathBuf, Table) {
    let (dir, path) = temp_table_path(name);
    let table = Table::open(&path, TableOptions::new().create(true).key("id")).expect("create table");
    (dir, path, table)
}

/// Opens a second, independent handle on an existing table.
pub fn open_existing(path: &Path) -> Table {
    Table::open(path, TableOptions::new()).expect("open table")
}

/// Writes `lines` to `path`, each followed by a newline.
pub fn write_lines(path: &Path, lines: &[&str]) {
    let mut text = String::new();
    for line in lines {
        text.push_str(line);
        text.push('\n');
    }
    fs::write(path, text).expect("write table file");
}

/// Lines currently in the file.
pub fn file_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .expect("read table file")
        .lines()
        .map(str::to_string)
        .collect()
}

/// Appends raw text, as an external writer that ignores the lock would.
pub fn append_raw(path: &Path, text: &str) {
    use std::io::Write;
    let mut file = fs::OpenOptions::new()
        .append(true)
        .open(path)
        .expect("open for append");
    file.write_all(text.as_bytes()).expect("append");
}

pub fn short_timeout() -> Duration {
    Duration::from_millis(100)
}
