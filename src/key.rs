//! # Key Model
//!
//! A table is a map from [`Key`] to record. Keys are taken from one or more
//! fields of each record, as named by the table's [`KeySpecifier`].
//!
//! ## Key Shapes
//!
//! ```text
//! KeySpecifier::Field("id")                 → Key::Scalar("u1")
//! KeySpecifier::Fields(["org", "id"])       → Key::Tuple(["acme", 7])
//! ```
//!
//! A scalar is a non-empty string or an integer within `±(2^53 - 1)`. A tuple
//! holds 1 to 16 scalars. `Key::Scalar(x)` and a one-element `Key::Tuple([x])`
//! are different keys.
//!
//! ## Ordering
//!
//! Keys have a total order used only for deterministic iteration
//! ([`Table::all`](crate::Table::all)) and compaction output. Integers sort
//! numerically and before strings; strings sort byte-lexicographically; tuples
//! compare element-wise with a shorter prefix first. Point lookups use
//! equality and hashing, never the order.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;

use serde_json::Value;

use crate::codec::Record;
use crate::error::{Error, Result};
use crate::limits::{
    LIMIT_KEY_LENGTH, LIMIT_TUPLE_ELEMENTS, MAX_KEY_LENGTH, MAX_SAFE_INTEGER, MAX_TUPLE_ELEMENTS,
};

// =============================================================================
// Key Elements
// =============================================================================

/// One scalar component of a key.
///
/// Variant order matters: the derived `Ord` puts every integer before every
/// string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyElement {
    /// An integer within the safe-integer range
    Int(i64),
    /// A non-empty string
    Str(String),
}

impl KeyElement {
    /// Converts a JSON value found in key field `field` into a key element.
    pub fn from_json(value: &Value, field: &str) -> Result<Self> {
        let element = match value {
            Value::String(s) => KeyElement::Str(s.clone()),
            Value::Number(n) => match n.as_i64() {
                Some(i) => KeyElement::Int(i),
                None if n.is_u64() => {
                    return Err(Error::invalid_key(field, format!("integer {n} out of safe range")))
                }
                None => return Err(Error::invalid_key(field, format!("{n} is not an integer"))),
            },
            Value::Null => return Err(Error::invalid_key(field, "key field is null")),
            Value::Bool(_) => return Err(Error::invalid_key(field, "key field is a boolean")),
            Value::Array(_) => return Err(Error::invalid_key(field, "key field is an array")),
            Value::Object(_) => return Err(Error::invalid_key(field, "key field is an object")),
        };
        element.validate(field)?;
        Ok(element)
    }

    /// Checks the scalar rules: non-empty strings, safe-range integers.
    fn validate(&self, subject: &str) -> Result<()> {
        match self {
            KeyElement::Str(s) if s.is_empty() => {
                Err(Error::invalid_key(subject, "key string is empty"))
            }
            KeyElement::Int(i) if !(-MAX_SAFE_INTEGER..=MAX_SAFE_INTEGER).contains(i) => Err(
                Error::invalid_key(subject, format!("integer {i} out of safe range")),
            ),
            _ => Ok(()),
        }
    }

    /// Returns the JSON form of this element.
    pub fn to_json(&self) -> Value {
        match self {
            KeyElement::Int(i) => Value::from(*i),
            KeyElement::Str(s) => Value::String(s.clone()),
        }
    }
}

impl fmt::Display for KeyElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyElement::Int(i) => write!(f, "{i}"),
            // JSON quoting keeps "1" and 1 distinguishable in messages.
            KeyElement::Str(s) => write!(f, "{}", Value::String(s.clone())),
        }
    }
}

impl From<&str> for KeyElement {
    fn from(s: &str) -> Self {
        KeyElement::Str(s.to_string())
    }
}

impl From<String> for KeyElement {
    fn from(s: String) -> Self {
        KeyElement::Str(s)
    }
}

impl From<i64> for KeyElement {
    fn from(i: i64) -> Self {
        KeyElement::Int(i)
    }
}

impl From<i32> for KeyElement {
    fn from(i: i32) -> Self {
        KeyElement::Int(i64::from(i))
    }
}

impl From<u32> for KeyElement {
    fn from(i: u32) -> Self {
        KeyElement::Int(i64::from(i))
    }
}

// =============================================================================
// Keys
// =============================================================================

/// The identity of a record within a table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Key {
    /// Key taken from a single field
    Scalar(KeyElement),
    /// Key taken from an ordered list of fields
    Tuple(Vec<KeyElement>),
}

impl Key {
    /// Builds a tuple key from its elements.
    ///
    /// ```rust
    /// use jsonlt::Key;
    ///
    /// let key = Key::tuple(["acme", "u1"]);
    /// assert_eq!(key.to_string(), r#"["acme", "u1"]"#);
    /// ```
    pub fn tuple<I, E>(elements: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<KeyElement>,
    {
        Key::Tuple(elements.into_iter().map(Into::into).collect())
    }

    /// Returns the JSON form of this key: a scalar, or an array for tuples.
    pub fn to_json(&self) -> Value {
        match self {
            Key::Scalar(e) => e.to_json(),
            Key::Tuple(elements) => Value::Array(elements.iter().map(KeyElement::to_json).collect()),
        }
    }

    /// Byte length of the key's compact JSON serialization.
    pub fn serialized_len(&self) -> usize {
        self.to_json().to_string().len()
    }

    /// Validates the key on its own: scalar rules, tuple arity, and length.
    ///
    /// A 0-element tuple is an invalid key; more than
    /// [`MAX_TUPLE_ELEMENTS`] elements exceeds a limit.
    pub fn validate(&self) -> Result<()> {
        match self {
            Key::Scalar(e) => e.validate(&self.to_string())?,
            Key::Tuple(elements) => {
                if elements.is_empty() {
                    return Err(Error::invalid_key("[]", "tuple key has no elements"));
                }
                if elements.len() > MAX_TUPLE_ELEMENTS {
                    return Err(Error::LimitExceeded {
                        limit: LIMIT_TUPLE_ELEMENTS,
                        actual: elements.len(),
                        maximum: MAX_TUPLE_ELEMENTS,
                    });
                }
                for e in elements {
                    e.validate(&self.to_string())?;
                }
            }
        }

        let len = self.serialized_len();
        if len > MAX_KEY_LENGTH {
            return Err(Error::LimitExceeded {
                limit: LIMIT_KEY_LENGTH,
                actual: len,
                maximum: MAX_KEY_LENGTH,
            });
        }
        Ok(())
    }

    /// Validates the key and checks that its shape fits `spec`.
    pub fn validate_for(&self, spec: &KeySpecifier) -> Result<()> {
        self.validate()?;
        match (self, spec) {
            (Key::Scalar(_), KeySpecifier::Field(_)) => Ok(()),
            (Key::Tuple(elements), KeySpecifier::Fields(names)) if elements.len() == names.len() => {
                Ok(())
            }
            _ => Err(Error::invalid_key(
                self.to_string(),
                format!("does not match key specifier {spec}"),
            )),
        }
    }

    /// Returns the `(field, value)` pairs that identify this key in a record,
    /// in specifier order. Used to build tombstones.
    pub fn to_fields(&self, spec: &KeySpecifier) -> Result<Vec<(String, Value)>> {
        self.validate_for(spec)?;
        let fields = match (self, spec) {
            (Key::Scalar(e), KeySpecifier::Field(name)) => vec![(name.clone(), e.to_json())],
            (Key::Tuple(elements), KeySpecifier::Fields(names)) => names
                .iter()
                .zip(elements)
                .map(|(n, e)| (n.clone(), e.to_json()))
                .collect(),
            // validate_for rejects mismatched shapes
            _ => Vec::new(),
        };
        Ok(fields)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Scalar(e) => write!(f, "{e}"),
            Key::Tuple(elements) => {
                write!(f, "[")?;
                for (i, e) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{e}")?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<KeyElement> for Key {
    fn from(e: KeyElement) -> Self {
        Key::Scalar(e)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Scalar(s.into())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::Scalar(s.into())
    }
}

impl From<i64> for Key {
    fn from(i: i64) -> Self {
        Key::Scalar(i.into())
    }
}

impl From<i32> for Key {
    fn from(i: i32) -> Self {
        Key::Scalar(i.into())
    }
}

impl From<u32> for Key {
    fn from(i: u32) -> Self {
        Key::Scalar(i.into())
    }
}

impl From<Vec<KeyElement>> for Key {
    fn from(elements: Vec<KeyElement>) -> Self {
        Key::Tuple(elements)
    }
}

/// Total order over keys, used for `all()` and compaction output.
pub fn compare_keys(a: &Key, b: &Key) -> Ordering {
    a.cmp(b)
}

// =============================================================================
// Key Specifier
// =============================================================================

/// Names the record field(s) that form the key.
///
/// Fixed for the lifetime of an open table. `Field("id")` and
/// `Fields(["id"])` are different specifiers producing different key shapes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeySpecifier {
    /// Scalar key from one field
    Field(String),
    /// Tuple key from 1 to 16 distinct fields
    Fields(Vec<String>),
}

impl KeySpecifier {
    /// Scalar specifier over one field.
    pub fn field(name: impl Into<String>) -> Self {
        KeySpecifier::Field(name.into())
    }

    /// Tuple specifier over several fields. Validated at table open.
    pub fn fields<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        KeySpecifier::Fields(names.into_iter().map(Into::into).collect())
    }

    /// Field names in key order.
    pub fn names(&self) -> &[String] {
        match self {
            KeySpecifier::Field(name) => std::slice::from_ref(name),
            KeySpecifier::Fields(names) => names,
        }
    }

    /// Returns `true` if `name` is one of the key fields.
    pub fn contains(&self, name: &str) -> bool {
        self.names().iter().any(|n| n == name)
    }

    /// Checks field names and tuple arity.
    pub fn validate(&self) -> Result<()> {
        if let KeySpecifier::Fields(names) = self {
            if names.is_empty() {
                return Err(Error::invalid_key("[]", "key specifier has no fields"));
            }
            if names.len() > MAX_TUPLE_ELEMENTS {
                return Err(Error::LimitExceeded {
                    limit: LIMIT_TUPLE_ELEMENTS,
                    actual: names.len(),
                    maximum: MAX_TUPLE_ELEMENTS,
                });
            }
            let mut seen = HashSet::new();
            for name in names {
                if !seen.insert(name.as_str()) {
                    return Err(Error::invalid_key(
                        self.to_string(),
                        format!("duplicate field '{name}'"),
                    ));
                }
            }
        }
        for name in self.names() {
            if name.is_empty() {
                return Err(Error::invalid_key(self.to_string(), "empty field name"));
            }
            if name.starts_with('$') {
                return Err(Error::invalid_key(
                    self.to_string(),
                    format!("field '{name}' uses the reserved '$' prefix"),
                ));
            }
        }
        Ok(())
    }

    /// Parses the `key` member of a header: a string or an array of strings.
    pub fn from_json(value: &Value) -> Result<Self> {
        let spec = match value {
            Value::String(name) => KeySpecifier::Field(name.clone()),
            Value::Array(items) => {
                let names = items
                    .iter()
                    .map(|v| match v {
                        Value::String(s) => Ok(s.clone()),
                        other => Err(Error::invalid_key(
                            value.to_string(),
                            format!("specifier element {other} is not a string"),
                        )),
                    })
                    .collect::<Result<Vec<_>>>()?;
                KeySpecifier::Fields(names)
            }
            other => {
                return Err(Error::invalid_key(
                    other.to_string(),
                    "key specifier must be a string or an array of strings",
                ))
            }
        };
        spec.validate()?;
        Ok(spec)
    }

    /// Returns the JSON form stored in a header.
    pub fn to_json(&self) -> Value {
        match self {
            KeySpecifier::Field(name) => Value::String(name.clone()),
            KeySpecifier::Fields(names) => {
                Value::Array(names.iter().cloned().map(Value::String).collect())
            }
        }
    }
}

impl fmt::Display for KeySpecifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl From<&str> for KeySpecifier {
    fn from(name: &str) -> Self {
        KeySpecifier::field(name)
    }
}

impl From<String> for KeySpecifier {
    fn from(name: String) -> Self {
        KeySpecifier::Field(name)
    }
}

impl From<Vec<&str>> for KeySpecifier {
    fn from(names: Vec<&str>) -> Self {
        KeySpecifier::fields(names)
    }
}

// =============================================================================
// Extraction
// =============================================================================

/// Extracts and validates the key of `record` under `spec`.
///
/// Fails with [`Error::InvalidKey`] if a key field is missing or holds a
/// value that is not a valid scalar, and with [`Error::LimitExceeded`] if the
/// serialized key is longer than [`MAX_KEY_LENGTH`].
pub fn extract_key(record: &Record, spec: &KeySpecifier) -> Result<Key> {
    let element = |name: &String| -> Result<KeyElement> {
        let value = record
            .get(name)
            .ok_or_else(|| Error::invalid_key(name.as_str(), "missing key field"))?;
        KeyElement::from_json(value, name)
    };

    let key = match spec {
        KeySpecifier::Field(name) => Key::Scalar(element(name)?),
        KeySpecifier::Fields(names) => Key::Tuple(names.iter().map(element).collect::<Result<_>>()?),
    };
    key.validate()?;
    Ok(key)
}

// =============================================================================
// Tests
// =============================================================================
