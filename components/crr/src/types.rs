/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, Value, ValueRef};
use rusqlite::Result as RusqliteResult;
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Typesafe way to manage wall-clock timestamps (unix epoch milliseconds).
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Default,
)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        let d = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(d.as_millis() as i64)
    }

    #[inline]
    pub fn as_millis(self) -> i64 {
        self.0
    }
}

impl From<i64> for Timestamp {
    #[inline]
    fn from(ts: i64) -> Self {
        Timestamp(ts)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ToSql for Timestamp {
    fn to_sql(&self) -> RusqliteResult<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0))
    }
}

impl FromSql for Timestamp {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        i64::column_result(value).map(Timestamp)
    }
}

/// A tagged SQLite value. The change log stores whatever the application
/// wrote, so the core carries values through as this enum rather than
/// stringly-typed blobs or runtime reflection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// The textual form SQLite itself would produce for this value; used for
    /// primary-key encoding and for the last-writer tiebreak, which compares
    /// values lexicographically.
    pub fn as_sort_text(&self) -> String {
        match self {
            SqlValue::Null => String::new(),
            SqlValue::Integer(i) => i.to_string(),
            SqlValue::Real(r) => r.to_string(),
            SqlValue::Text(s) => s.clone(),
            // Matches SQLite's CAST(x AS TEXT) on a blob: the raw bytes,
            // lossily decoded.
            SqlValue::Blob(b) => String::from_utf8_lossy(b).into_owned(),
        }
    }

    /// Convert to a plain (untagged) JSON value, for row images exposed to
    /// applications and stored in conflict records.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            SqlValue::Null => serde_json::Value::Null,
            SqlValue::Integer(i) => (*i).into(),
            SqlValue::Real(r) => serde_json::Number::from_f64(*r)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            SqlValue::Text(s) => serde_json::Value::String(s.clone()),
            SqlValue::Blob(b) => serde_json::Value::Array(
                b.iter().map(|byte| (*byte as i64).into()).collect(),
            ),
        }
    }

    /// The inverse of [`SqlValue::to_json`], for reading conflict records
    /// back. Numbers become integers when they fit, reals otherwise.
    pub fn from_json(v: &serde_json::Value) -> SqlValue {
        match v {
            serde_json::Value::Null => SqlValue::Null,
            serde_json::Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    SqlValue::Integer(i)
                } else {
                    SqlValue::Real(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => SqlValue::Text(s.clone()),
            serde_json::Value::Array(items) => SqlValue::Blob(
                items
                    .iter()
                    .filter_map(|i| i.as_i64().map(|b| b as u8))
                    .collect(),
            ),
            serde_json::Value::Object(_) => SqlValue::Text(v.to_string()),
        }
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> RusqliteResult<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            SqlValue::Real(r) => ToSqlOutput::Owned(Value::Real(*r)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            SqlValue::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

impl FromSql for SqlValue {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Ok(match value {
            ValueRef::Null => SqlValue::Null,
            ValueRef::Integer(i) => SqlValue::Integer(i),
            ValueRef::Real(r) => SqlValue::Real(r),
            ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
        })
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_sort_text())
    }
}

/// A materialized row: column name to value. BTreeMap so iteration (and the
/// JSON we derive from it) is deterministic.
pub type Row = BTreeMap<String, SqlValue>;

/// Plain JSON object for a row image.
pub fn row_to_json(row: &Row) -> serde_json::Value {
    serde_json::Value::Object(
        row.iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect(),
    )
}

pub fn row_from_json(v: &serde_json::Value) -> Row {
    match v {
        serde_json::Value::Object(map) => map
            .iter()
            .map(|(k, v)| (k.clone(), SqlValue::from_json(v)))
            .collect(),
        _ => Row::new(),
    }
}

/// Generate a short random identifier: 9 random bytes, base64url encoded to
/// 12 characters. Used for site ids, document ids and commit ids.
pub fn random_id() -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use rand::RngCore;
    let mut bytes = [0u8; 9];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_id_shape() {
        let id = random_id();
        assert_eq!(id.len(), 12);
        assert_ne!(id, random_id());
    }

    #[test]
    fn test_sort_text() {
        assert_eq!(SqlValue::Integer(42).as_sort_text(), "42");
        assert_eq!(SqlValue::Text("x".into()).as_sort_text(), "x");
        assert_eq!(SqlValue::Null.as_sort_text(), "");
    }

    #[test]
    fn test_json_round_trip() {
        let mut row = Row::new();
        row.insert("id".into(), SqlValue::Integer(1));
        row.insert("title".into(), SqlValue::Text("Buy milk".into()));
        row.insert("score".into(), SqlValue::Real(0.5));
        row.insert("icon".into(), SqlValue::Null);
        let json = row_to_json(&row);
        assert_eq!(row_from_json(&json), row);
    }
}
