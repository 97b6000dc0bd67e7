//! # Line Codec
//!
//! A table file is UTF-8 text with one JSON object per `\n`-terminated line:
//!
//! ```text
//! {"$jsonlt":{"version":1,"key":"id"}}          ← optional header, line 1 only
//! {"id":"u1","name":"Alice"}                    ← record (upsert)
//! {"id":"u2","name":"Bob"}
//! {"id":"u1","$deleted":true}                   ← tombstone (delete)
//! ```
//!
//! This module turns one line into an [`Entry`] ([`parse_line`]), resolves an
//! entry into a keyed [`Operation`] ([`decode_operation`]), and serializes
//! operations and headers back into lines.
//!
//! ## Validation Order
//!
//! 1. Line size against [`MAX_RECORD_SIZE`] (`LimitExceeded("record_size")`)
//! 2. Blank or whitespace-only lines (`Parse`)
//! 3. UTF-8 (`Parse`)
//! 4. Strict JSON: no duplicate fields, depth ≤ [`MAX_NESTING_DEPTH`] (`Parse`)
//! 5. Shape: object, header placement, `$deleted` value, reserved fields (`Parse`)
//! 6. Key extraction against the table's specifier (`InvalidKey` / `LimitExceeded`)

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::json::parse_strict;
use crate::key::{extract_key, Key, KeySpecifier};
use crate::limits::{
    FORMAT_VERSION, LIMIT_NESTING_DEPTH, LIMIT_RECORD_SIZE, MAX_NESTING_DEPTH, MAX_RECORD_SIZE,
};

/// A record: a JSON object without `$`-prefixed fields.
pub type Record = Map<String, Value>;

/// Top-level field that marks a header line.
pub const HEADER_FIELD: &str = "$jsonlt";

/// Field that marks a tombstone line.
pub const DELETED_FIELD: &str = "$deleted";

// =============================================================================
// Header
// =============================================================================

/// The optional first line of a table file.
///
/// `$schema` and `schema` are carried through untouched; the engine does not
/// validate records against them.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Header {
    /// Format version; always [`FORMAT_VERSION`] for readable files
    pub version: u64,
    /// Key specifier fixed by the file, if any
    pub key: Option<KeySpecifier>,
    /// `$schema`: a schema URI
    pub schema_uri: Option<String>,
    /// `schema`: an inline schema object
    pub schema: Option<Map<String, Value>>,
    /// Free-form metadata
    pub meta: Option<Map<String, Value>>,
}

impl Header {
    /// A current-version header with the given key specifier.
    pub fn new(key: Option<KeySpecifier>) -> Self {
        Self {
            version: FORMAT_VERSION,
            key,
            ..Self::default()
        }
    }

    /// Decodes the value of the `$jsonlt` field found on `line`.
    fn from_json(value: &Value, line: u64) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::parse(line, "header `$jsonlt` must be an object"))?;

        let version = match obj.get("version") {
            Some(v) => v
                .as_u64()
                .ok_or_else(|| Error::parse(line, format!("invalid header version {v}")))?,
            None => return Err(Error::parse(line, "header is missing `version`")),
        };
        if version != FORMAT_VERSION {
            return Err(Error::parse(
                line,
                format!("unsupported format version {version} (expected {FORMAT_VERSION})"),
            ));
        }

        let key = obj
            .get("key")
            .map(KeySpecifier::from_json)
            .transpose()?;

        let schema_uri = match obj.get("$schema") {
            None => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(_) => return Err(Error::parse(line, "header `$schema` must be a string")),
        };
        let schema = match obj.get("schema") {
            None => None,
            Some(Value::Object(o)) => Some(o.clone()),
            Some(_) => return Err(Error::parse(line, "header `schema` must be an object")),
        };
        if schema_uri.is_some() && schema.is_some() {
            return Err(Error::parse(
                line,
                "header `$schema` and `schema` are mutually exclusive",
            ));
        }
        let meta = match obj.get("meta") {
            None => None,
            Some(Value::Object(o)) => Some(o.clone()),
            Some(_) => return Err(Error::parse(line, "header `meta` must be an object")),
        };

        Ok(Self {
            version,
            key,
            schema_uri,
            schema,
            meta,
        })
    }

    /// The full header line as a JSON value.
    pub fn to_json(&self) -> Value {
        let mut inner = Map::new();
        inner.insert("version".to_string(), Value::from(self.version));
        if let Some(key) = &self.key {
            inner.insert("key".to_string(), key.to_json());
        }
        if let Some(uri) = &self.schema_uri {
            inner.insert("$schema".to_string(), Value::String(uri.clone()));
        }
        if let Some(schema) = &self.schema {
            inner.insert("schema".to_string(), Value::Object(schema.clone()));
        }
        if let Some(meta) = &self.meta {
            inner.insert("meta".to_string(), Value::Object(meta.clone()));
        }
        let mut outer = Map::new();
        outer.insert(HEADER_FIELD.to_string(), Value::Object(inner));
        Value::Object(outer)
    }
}

// =============================================================================
// Entries and Operations
// =============================================================================

/// A classified line, before key resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum Entry {
    Header(Header),
    Record(Record),
    /// Tombstone fields, `$deleted` removed
    Tombstone(Record),
}

/// One body line with its key resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Insert or replace the record for `key`
    Upsert { key: Key, record: Record },
    /// Remove `key`
    Delete { key: Key },
}

impl Operation {
    /// The key this operation writes.
    pub fn key(&self) -> &Key {
        match self {
            Operation::Upsert { key, .. } | Operation::Delete { key } => key,
        }
    }
}

/// Parses and classifies one line (without its trailing newline).
///
/// `line` is the 1-based line number; a header is only recognized on line 1.
pub fn parse_line(bytes: &[u8], line: u64) -> Result<Entry> {
    if bytes.len() > MAX_RECORD_SIZE {
        return Err(Error::LimitExceeded {
            limit: LIMIT_RECORD_SIZE,
            actual: bytes.len(),
            maximum: MAX_RECORD_SIZE,
        });
    }
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(Error::parse(line, "blank line"));
    }
    if let Err(e) = std::str::from_utf8(bytes) {
        return Err(Error::Parse {
            line,
            column: Some(e.valid_up_to() as u64 + 1),
            message: "invalid UTF-8".to_string(),
        });
    }

    let value = parse_strict(bytes, MAX_NESTING_DEPTH).map_err(|e| Error::Parse {
        line,
        column: (e.column() > 0).then_some(e.column() as u64),
        message: e.to_string(),
    })?;

    let mut obj = match value {
        Value::Object(obj) => obj,
        other => {
            return Err(Error::parse(
                line,
                format!("expected a JSON object, found {}", json_type(&other)),
            ))
        }
    };

    if let Some(header) = obj.get(HEADER_FIELD) {
        if line != 1 {
            return Err(Error::parse(line, "header is only allowed on the first line"));
        }
        if obj.len() != 1 {
            return Err(Error::parse(line, "header line must contain only `$jsonlt`"));
        }
        return Header::from_json(header, line).map(Entry::Header);
    }

    if let Some(deleted) = obj.remove(DELETED_FIELD) {
        if deleted != Value::Bool(true) {
            return Err(Error::parse(line, "`$deleted` must be true"));
        }
        return Ok(Entry::Tombstone(obj));
    }

    if let Some(field) = obj.keys().find(|k| k.starts_with('$')) {
        return Err(Error::parse(
            line,
            format!("record uses reserved field `{field}`"),
        ));
    }
    Ok(Entry::Record(obj))
}

/// Resolves a body entry into an [`Operation`] under `spec`.
///
/// Headers are rejected: callers handle line 1 before resolving the body.
pub fn resolve_entry(entry: Entry, line: u64, spec: &KeySpecifier) -> Result<Operation> {
    match entry {
        Entry::Header(_) => Err(Error::parse(line, "unexpected header")),
        Entry::Record(record) => {
            let key = extract_key(&record, spec)?;
            Ok(Operation::Upsert { key, record })
        }
        Entry::Tombstone(fields) => {
            if let Some(extra) = fields.keys().find(|k| !spec.contains(k)) {
                return Err(Error::parse(
                    line,
                    format!("tombstone carries non-key field `{extra}`"),
                ));
            }
            let key = extract_key(&fields, spec)?;
            Ok(Operation::Delete { key })
        }
    }
}

/// Parses one body line straight into an [`Operation`].
pub fn decode_operation(bytes: &[u8], line: u64, spec: &KeySpecifier) -> Result<Operation> {
    resolve_entry(parse_line(bytes, line)?, line, spec)
}

// =============================================================================
// Validation of Caller Records
// =============================================================================

/// Checks a caller-supplied value and returns it as a [`Record`].
///
/// Unlike [`parse_line`], problems here are the caller's, so they surface as
/// [`Error::Validation`] (or [`Error::LimitExceeded`] for depth).
pub fn validate_record(value: Value) -> Result<Record> {
    let record = match value {
        Value::Object(obj) => obj,
        other => {
            return Err(Error::Validation(format!(
                "record must be a JSON object, found {}",
                json_type(&other)
            )))
        }
    };
    if let Some(field) = record.keys().find(|k| k.starts_with('$')) {
        return Err(Error::Validation(format!(
            "record field `{field}` uses the reserved '$' prefix"
        )));
    }
    let depth = 1 + record.values().map(nesting_depth).max().unwrap_or(0);
    if depth > MAX_NESTING_DEPTH {
        return Err(Error::LimitExceeded {
            limit: LIMIT_NESTING_DEPTH,
            actual: depth,
            maximum: MAX_NESTING_DEPTH,
        });
    }
    Ok(record)
}

fn nesting_depth(value: &Value) -> usize {
    match value {
        Value::Array(items) => 1 + items.iter().map(nesting_depth).max().unwrap_or(0),
        Value::Object(obj) => 1 + obj.values().map(nesting_depth).max().unwrap_or(0),
        _ => 0,
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// =============================================================================
// Serialization
// =============================================================================

/// Serializes an operation as one `\n`-terminated line.
///
/// Tombstones list the key fields in specifier order followed by
/// `"$deleted":true`.
pub fn serialize_operation(op: &Operation, spec: &KeySpecifier) -> Result<Vec<u8>> {
    match op {
        Operation::Upsert { record, .. } => serialize_record(record),
        Operation::Delete { key } => {
            let mut obj: Map<String, Value> = key.to_fields(spec)?.into_iter().collect();
            obj.insert(DELETED_FIELD.to_string(), Value::Bool(true));
            to_line(&obj)
        }
    }
}

/// Serializes a record as one `\n`-terminated line.
pub fn serialize_record(record: &Record) -> Result<Vec<u8>> {
    to_line(record)
}

/// Serializes a header as one `\n`-terminated line.
pub fn serialize_header(header: &Header) -> Result<Vec<u8>> {
    to_line(&header.to_json())
}

fn to_line<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(value)
        .map_err(|e| Error::Validation(format!("cannot serialize record: {e}")))?;
    if bytes.len() > MAX_RECORD_SIZE {
        return Err(Error::LimitExceeded {
            limit: LIMIT_RECORD_SIZE,
            actual: bytes.len(),
            maximum: MAX_RECORD_SIZE,
        });
    }
    bytes.push(b'\n');
    Ok(bytes)
}

// =============================================================================
// Tests
// =============================================================================
