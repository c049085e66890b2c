use std::{collections::HashMap, fmt};

use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    core::types::NamedList,
    error::{ClientError, ClientResult},
};

/// A calendar date. Zero year, month or day is allowed and means "unset",
/// so partial dates survive a round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SqlDate {
    pub year: i32,
    pub month: u32,
    pub day: u32,
}

impl SqlDate {
    pub fn new(year: i32, month: u32, day: u32) -> ClientResult<Self> {
        if year < 0 {
            return Err(ClientError::InvalidRequest(format!("invalid year: {year}")));
        }
        if month > 12 {
            return Err(ClientError::InvalidRequest(format!("invalid month: {month}")));
        }
        if day > 31 {
            return Err(ClientError::InvalidRequest(format!("invalid day: {day}")));
        }
        Ok(Self { year, month, day })
    }
}

impl fmt::Display for SqlDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }
}

/// Key of a decoded map value. Only these three key types exist on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MapKey {
    Int64(i64),
    String(String),
    Bytes(Vec<u8>),
}

impl fmt::Display for MapKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapKey::Int64(v) => write!(f, "{v}"),
            MapKey::String(v) => write!(f, "{v}"),
            MapKey::Bytes(v) => f.write_str(&base64::engine::general_purpose::STANDARD.encode(v)),
        }
    }
}

/// Association list with last-write-wins semantics per key.
///
/// Entries keep the position of the first insertion of their key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlMap {
    entries: Vec<(MapKey, SqlValue)>,
    positions: HashMap<MapKey, usize>,
}

impl SqlMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: MapKey, value: SqlValue) {
        match self.positions.get(&key) {
            Some(&i) => self.entries[i].1 = value,
            None => {
                self.positions.insert(key.clone(), self.entries.len());
                self.entries.push((key, value));
            }
        }
    }

    pub fn get(&self, key: &MapKey) -> Option<&SqlValue> {
        self.positions.get(key).map(|&i| &self.entries[i].1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MapKey, &SqlValue)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }
}

impl FromIterator<(MapKey, SqlValue)> for SqlMap {
    fn from_iter<I: IntoIterator<Item = (MapKey, SqlValue)>>(iter: I) -> Self {
        let mut map = SqlMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

pub type Struct = NamedList<SqlValue>;
pub type QueryResultRow = NamedList<SqlValue>;

/// A decoded result value, or a parameter value supplied by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Int64(i64),
    Float64(f64),
    String(String),
    Bytes(Vec<u8>),
    Bool(bool),
    Date(SqlDate),
    Timestamp(DateTime<Utc>),
    Array(Vec<SqlValue>),
    Map(SqlMap),
    Struct(Struct),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::String(v) => Some(v),
            _ => None,
        }
    }

    /// JSON rendering used by the replay tool. Bytes become a tagged base64
    /// object and 64-bit integers are written as strings so no JSON reader
    /// rounds them through a double.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::{json, Value};
        match self {
            SqlValue::Null => Value::Null,
            SqlValue::Int64(v) => Value::String(v.to_string()),
            SqlValue::Float64(v) => json!(v),
            SqlValue::String(v) => Value::String(v.clone()),
            SqlValue::Bytes(b) => json!({
                "$type": "bytes",
                "base64": base64::engine::general_purpose::STANDARD.encode(b),
                "size": b.len()
            }),
            SqlValue::Bool(v) => Value::Bool(*v),
            SqlValue::Date(d) => Value::String(d.to_string()),
            SqlValue::Timestamp(ts) => {
                Value::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            SqlValue::Array(items) => Value::Array(items.iter().map(SqlValue::to_json).collect()),
            SqlValue::Map(map) => Value::Array(
                map.iter()
                    .map(|(k, v)| json!([k.to_string(), v.to_json()]))
                    .collect(),
            ),
            SqlValue::Struct(st) => named_list_to_json(st),
        }
    }
}

pub fn named_list_to_json(list: &NamedList<SqlValue>) -> serde_json::Value {
    let mut out = serde_json::Map::with_capacity(list.len());
    for (i, (name, value)) in list.iter().enumerate() {
        let key = match name {
            Some(name) => name.to_string(),
            None => format!("${i}"),
        };
        out.insert(key, value.to_json());
    }
    serde_json::Value::Object(out)
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => f.write_str("null"),
            SqlValue::Int64(v) => write!(f, "{v}"),
            SqlValue::Float64(v) => write!(f, "{v}"),
            SqlValue::String(v) => f.write_str(v),
            SqlValue::Bytes(v) => write!(f, "{v:?}"),
            SqlValue::Bool(v) => write!(f, "{v}"),
            SqlValue::Date(d) => write!(f, "{d}"),
            SqlValue::Timestamp(ts) => f.write_str(&ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            SqlValue::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            SqlValue::Map(map) => write!(f, "map({} entries)", map.len()),
            SqlValue::Struct(st) => write!(f, "struct({} fields)", st.len()),
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int64(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Int64(v.into())
    }
}

impl TryFrom<i128> for SqlValue {
    type Error = ClientError;

    fn try_from(v: i128) -> ClientResult<Self> {
        i64::try_from(v).map(SqlValue::Int64).map_err(|_| out_of_range(v))
    }
}

impl TryFrom<u64> for SqlValue {
    type Error = ClientError;

    fn try_from(v: u64) -> ClientResult<Self> {
        i64::try_from(v).map(SqlValue::Int64).map_err(|_| out_of_range(v))
    }
}

pub(crate) fn out_of_range(v: impl fmt::Display) -> ClientError {
    ClientError::ParameterType(format!(
        "Value {v} cannot be converted to int64 - it is out of range."
    ))
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Float64(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::String(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::String(v)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Bytes(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<SqlDate> for SqlValue {
    fn from(v: SqlDate) -> Self {
        SqlValue::Date(v)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(v: DateTime<Utc>) -> Self {
        SqlValue::Timestamp(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}
