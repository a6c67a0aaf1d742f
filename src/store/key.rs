//! Record keys, key ranges and key-path extraction.
//!
//! Keys are what the store orders by: primary keys of records and the values
//! indexes are built over. Integers sort before text, matching SQLite's
//! cross-type ordering for the untyped key columns.

use std::cmp::Ordering;
use std::fmt;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Value, ValueRef};
use serde::{Deserialize, Serialize};

use super::error::{StoreError, StoreResult};

/// A primary or index key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    Int(i64),
    Text(String),
}

impl Key {
    /// Returns the integer value, if this is an integer key.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Key::Int(i) => Some(*i),
            Key::Text(_) => None,
        }
    }

    /// Converts a JSON value into a key.
    ///
    /// Booleans are accepted and index as 0/1 so that flag fields can carry an
    /// index. Returns `None` for values that cannot be keys (null, floats with
    /// a fractional part, arrays, objects).
    pub fn from_json(value: &serde_json::Value) -> Option<Key> {
        match value {
            serde_json::Value::Bool(b) => Some(Key::Int(i64::from(*b))),
            serde_json::Value::Number(n) => n.as_i64().map(Key::Int).or_else(|| {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                    .map(|f| Key::Int(f as i64))
            }),
            serde_json::Value::String(s) => Some(Key::Text(s.clone())),
            _ => None,
        }
    }

    pub(crate) fn to_json(&self) -> serde_json::Value {
        match self {
            Key::Int(i) => serde_json::Value::from(*i),
            Key::Text(s) => serde_json::Value::from(s.as_str()),
        }
    }

    pub(crate) fn to_sql_value(&self) -> Value {
        match self {
            Key::Int(i) => Value::Integer(*i),
            Key::Text(s) => Value::Text(s.clone()),
        }
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Key::Int(a), Key::Int(b)) => a.cmp(b),
            (Key::Text(a), Key::Text(b)) => a.cmp(b),
            (Key::Int(_), Key::Text(_)) => Ordering::Less,
            (Key::Text(_), Key::Int(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(i) => write!(f, "{i}"),
            Key::Text(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Key::Int(value)
    }
}

impl From<bool> for Key {
    fn from(value: bool) -> Self {
        Key::Int(i64::from(value))
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key::Text(value.to_owned())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Key::Text(value)
    }
}

impl ToSql for Key {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Key::Int(i) => ToSqlOutput::from(*i),
            Key::Text(s) => ToSqlOutput::from(s.as_str()),
        })
    }
}

impl FromSql for Key {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value {
            ValueRef::Integer(i) => Ok(Key::Int(i)),
            ValueRef::Text(t) => std::str::from_utf8(t)
                .map(|s| Key::Text(s.to_owned()))
                .map_err(|e| FromSqlError::Other(Box::new(e))),
            _ => Err(FromSqlError::InvalidType),
        }
    }
}

/// A contiguous range of keys with optionally open ends.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeyRange {
    lower: Option<Key>,
    upper: Option<Key>,
    lower_open: bool,
    upper_open: bool,
}

impl KeyRange {
    /// Every key.
    pub fn all() -> Self {
        Self::default()
    }

    /// Exactly one key.
    pub fn only(key: impl Into<Key>) -> Self {
        let key = key.into();
        Self {
            lower: Some(key.clone()),
            upper: Some(key),
            lower_open: false,
            upper_open: false,
        }
    }

    /// Keys above `key` (excluding it when `open`).
    pub fn lower_bound(key: impl Into<Key>, open: bool) -> Self {
        Self {
            lower: Some(key.into()),
            lower_open: open,
            ..Self::default()
        }
    }

    /// Keys below `key` (excluding it when `open`).
    pub fn upper_bound(key: impl Into<Key>, open: bool) -> Self {
        Self {
            upper: Some(key.into()),
            upper_open: open,
            ..Self::default()
        }
    }

    /// Keys between `lower` and `upper`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Data`] if `lower > upper`, or if they are equal
    /// and either end is open.
    pub fn bound(
        lower: impl Into<Key>,
        upper: impl Into<Key>,
        lower_open: bool,
        upper_open: bool,
    ) -> StoreResult<Self> {
        let lower = lower.into();
        let upper = upper.into();
        match lower.cmp(&upper) {
            Ordering::Greater => {
                return Err(StoreError::Data(format!(
                    "lower bound {lower} is greater than upper bound {upper}"
                )));
            }
            Ordering::Equal if lower_open || upper_open => {
                return Err(StoreError::Data(format!(
                    "empty range: both bounds are {lower} and one end is open"
                )));
            }
            _ => {}
        }
        Ok(Self {
            lower: Some(lower),
            upper: Some(upper),
            lower_open,
            upper_open,
        })
    }

    pub fn lower(&self) -> Option<&Key> {
        self.lower.as_ref()
    }

    pub fn upper(&self) -> Option<&Key> {
        self.upper.as_ref()
    }

    /// Returns `true` if `key` falls inside the range.
    pub fn includes(&self, key: &Key) -> bool {
        let above = match &self.lower {
            None => true,
            Some(lower) if self.lower_open => key > lower,
            Some(lower) => key >= lower,
        };
        let below = match &self.upper {
            None => true,
            Some(upper) if self.upper_open => key < upper,
            Some(upper) => key <= upper,
        };
        above && below
    }

    /// Appends SQL conditions on `column` for this range.
    pub(crate) fn push_sql(&self, column: &str, clauses: &mut Vec<String>, params: &mut Vec<Value>) {
        if let Some(lower) = &self.lower {
            let op = if self.lower_open { ">" } else { ">=" };
            clauses.push(format!("{column} {op} ?"));
            params.push(lower.to_sql_value());
        }
        if let Some(upper) = &self.upper {
            let op = if self.upper_open { "<" } else { "<=" };
            clauses.push(format!("{column} {op} ?"));
            params.push(upper.to_sql_value());
        }
    }
}

impl From<Key> for KeyRange {
    fn from(key: Key) -> Self {
        KeyRange::only(key)
    }
}

impl From<i64> for KeyRange {
    fn from(key: i64) -> Self {
        KeyRange::only(key)
    }
}

impl From<&str> for KeyRange {
    fn from(key: &str) -> Self {
        KeyRange::only(key)
    }
}

/// Reads the key at a dotted `key_path` (e.g. `"id"`, `"meta.due"`).
///
/// Returns `None` when the path is missing or the value cannot be a key.
pub fn extract_key(value: &serde_json::Value, key_path: &str) -> Option<Key> {
    let mut current = value;
    for segment in key_path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Key::from_json(current)
}

/// Writes `key` at a dotted `key_path`, creating intermediate objects.
pub(crate) fn inject_key(
    value: &mut serde_json::Value,
    key_path: &str,
    key: &Key,
) -> StoreResult<()> {
    let mut current = value;
    let mut segments = key_path.split('.').peekable();
    while let Some(segment) = segments.next() {
        let object = current.as_object_mut().ok_or_else(|| {
            StoreError::Data(format!(
                "cannot assign key at `{key_path}`: record is not an object"
            ))
        })?;
        if segments.peek().is_none() {
            object.insert(segment.to_owned(), key.to_json());
            return Ok(());
        }
        current = object
            .entry(segment.to_owned())
            .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use serde_json::json;

    #[test]
    fn integers_sort_before_text() {
        assert!(Key::Int(i64::MAX) < Key::Text(String::new()));
        assert!(Key::Int(-1) < Key::Int(0));
        assert!(Key::from("a") < Key::from("b"));
    }

    #[test]
    fn booleans_index_as_integers() {
        assert_eq!(Key::from_json(&json!(true)), Some(Key::Int(1)));
        assert_eq!(Key::from_json(&json!(false)), Some(Key::Int(0)));
        assert_eq!(Key::from_json(&json!(null)), None);
        assert_eq!(Key::from_json(&json!(1.5)), None);
        assert_eq!(Key::from_json(&json!([1])), None);
    }

    #[test]
    fn upper_bound_is_inclusive_unless_open() {
        let closed = KeyRange::upper_bound(10, false);
        assert!(closed.includes(&Key::Int(10)));
        assert!(!closed.includes(&Key::Int(11)));

        let open = KeyRange::upper_bound(10, true);
        assert!(!open.includes(&Key::Int(10)));
        assert!(open.includes(&Key::Int(9)));
    }

    #[test]
    fn inverted_bounds_are_rejected() {
        assert!(matches!(
            KeyRange::bound(5, 1, false, false),
            Err(StoreError::Data(_))
        ));
        assert!(matches!(
            KeyRange::bound(5, 5, true, false),
            Err(StoreError::Data(_))
        ));
        let point = KeyRange::bound(5, 5, false, false).unwrap();
        assert!(point.includes(&Key::Int(5)));
    }

    #[test]
    fn key_path_reads_nested_fields() {
        let doc = json!({"id": 7, "meta": {"due": 1000}});
        assert_eq!(extract_key(&doc, "id"), Some(Key::Int(7)));
        assert_eq!(extract_key(&doc, "meta.due"), Some(Key::Int(1000)));
        assert_eq!(extract_key(&doc, "meta.missing"), None);
    }

    #[test]
    fn inject_creates_intermediate_objects() {
        let mut doc = json!({"title": "x"});
        inject_key(&mut doc, "a.b", &Key::Int(3)).unwrap();
        assert_eq!(doc["a"]["b"], json!(3));

        let mut scalar = json!(42);
        assert!(inject_key(&mut scalar, "id", &Key::Int(1)).is_err());
    }
}
