//! Dynamic row representation and the diff primitives used by capture.

use std::collections::btree_map;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use rusqlite::types::{ToSql, ToSqlOutput, Value, ValueRef};
use serde::{Deserialize, Serialize};

/// A nullable scalar column value. `Null` is a distinct marker and is never
/// coerced to an empty string.
///
/// There is no blob variant: BLOB columns are read as `\x<hex>` text, so a
/// replayed insert or update writes that text, not the original bytes, into
/// the column.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
}

impl Scalar {
    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Null => f.write_str("NULL"),
            Scalar::Bool(b) => write!(f, "{}", b),
            Scalar::Integer(i) => write!(f, "{}", i),
            Scalar::Real(r) => write!(f, "{}", r),
            Scalar::Text(s) => f.write_str(s),
        }
    }
}

impl From<ValueRef<'_>> for Scalar {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => Scalar::Null,
            ValueRef::Integer(i) => Scalar::Integer(i),
            ValueRef::Real(r) => Scalar::Real(r),
            ValueRef::Text(t) => Scalar::Text(String::from_utf8_lossy(t).into_owned()),
            // Blobs are kept in their textual form, the same way they are
            // written in SQL literals.
            ValueRef::Blob(b) => {
                let hex: String = b.iter().map(|byte| format!("{:02x}", byte)).collect();
                Scalar::Text(format!("\\x{}", hex))
            }
        }
    }
}

impl ToSql for Scalar {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Scalar::Null => ToSqlOutput::Owned(Value::Null),
            Scalar::Bool(b) => ToSqlOutput::Owned(Value::Integer(i64::from(*b))),
            Scalar::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            Scalar::Real(r) => ToSqlOutput::Owned(Value::Real(*r)),
            Scalar::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Scalar::Bool(value)
    }
}

impl From<i32> for Scalar {
    fn from(value: i32) -> Self {
        Scalar::Integer(i64::from(value))
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Integer(value)
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Scalar::Real(value)
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Text(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::Text(value)
    }
}

impl<T: Into<Scalar>> From<Option<T>> for Scalar {
    fn from(value: Option<T>) -> Self {
        value.map_or(Scalar::Null, Into::into)
    }
}

/// Ordered mapping from column name to [`Scalar`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowMap(BTreeMap<String, Scalar>);

impl RowMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads every column of a result row.
    pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let stmt: &rusqlite::Statement<'_> = row.as_ref();
        let mut map = RowMap::new();
        for index in 0..stmt.column_count() {
            let name = stmt.column_name(index)?.to_string();
            map.insert(name, Scalar::from(row.get_ref(index)?));
        }
        Ok(map)
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<Scalar>) -> Option<Scalar> {
        self.0.insert(column.into(), value.into())
    }

    pub fn get(&self, column: &str) -> Option<&Scalar> {
        self.0.get(column)
    }

    pub fn contains_key(&self, column: &str) -> bool {
        self.0.contains_key(column)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True iff the map has no entries. A diff that is empty means an update
    /// changed nothing worth recording.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Scalar> {
        self.0.iter()
    }

    pub fn keys(&self) -> btree_map::Keys<'_, String, Scalar> {
        self.0.keys()
    }

    pub fn values(&self) -> btree_map::Values<'_, String, Scalar> {
        self.0.values()
    }

    /// Copies the given columns, in the given order, or returns `None` if any
    /// of them is missing.
    pub fn project(&self, columns: &[String]) -> Option<RowMap> {
        columns
            .iter()
            .map(|column| self.get(column).map(|value| (column.clone(), value.clone())))
            .collect()
    }

    /// Textual identifying value for the given identity columns. Composite
    /// identities are joined with `,`. Missing or NULL components yield `None`.
    pub fn identifying_value(&self, columns: &[String]) -> Option<String> {
        if columns.is_empty() {
            return None;
        }
        let parts = columns
            .iter()
            .map(|column| match self.get(column) {
                Some(value) if !value.is_null() => Some(value.to_string()),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()?;
        Some(parts.join(","))
    }
}

impl<K: Into<String>, V: Into<Scalar>> FromIterator<(K, V)> for RowMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        RowMap(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl<'a> IntoIterator for &'a RowMap {
    type Item = (&'a String, &'a Scalar);
    type IntoIter = btree_map::Iter<'a, String, Scalar>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Materializes every column of `row` that is not in `excluded`.
pub fn snapshot(row: &RowMap, excluded: &BTreeSet<String>) -> RowMap {
    RowMap(
        row.iter()
            .filter(|(column, _)| !excluded.contains(*column))
            .map(|(column, value)| (column.clone(), value.clone()))
            .collect(),
    )
}

/// Returns the entries of `new` whose key is absent from `old` or whose value
/// differs. Two NULLs compare equal. Keys only present in `old` are never
/// emitted.
pub fn diff(old: &RowMap, new: &RowMap) -> RowMap {
    RowMap(
        new.iter()
            .filter(|(column, value)| old.get(column) != Some(*value))
            .map(|(column, value)| (column.clone(), value.clone()))
            .collect(),
    )
}
