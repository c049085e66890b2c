use std::collections::HashMap;

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    core::{
        status::Status,
        types::Type,
        values::{out_of_range, SqlDate, SqlValue},
        wire::ColumnMetadata,
    },
    error::{ClientError, ClientResult},
};

/// One line of a replay scenario.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScriptRecord {
    /// A successful prepare response. The first one also names the query.
    Prepare {
        #[serde(default)]
        query: Option<String>,
        #[serde(default)]
        param_types: HashMap<String, Type>,
        columns: Vec<ColumnMetadata>,
        #[serde(default)]
        valid_for_ms: Option<u64>,
    },
    PrepareError {
        status: Status,
    },
    /// One execute-query attempt: the messages it streams, then either a clean
    /// end or `error`.
    Attempt {
        #[serde(default)]
        messages: Vec<ScriptMessage>,
        #[serde(default)]
        error: Option<Status>,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScriptMessage {
    /// Rows encoded into this message's batch bytes, using the column types of
    /// the most recent prepare record.
    #[serde(default)]
    pub rows: Vec<Vec<serde_json::Value>>,
    #[serde(default)]
    pub checksum: Option<ChecksumSpec>,
    #[serde(default)]
    pub resume_token: Option<String>,
    #[serde(default)]
    pub reset: bool,
}

/// `true` computes the real checksum of the batch; a number is sent as-is.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
pub enum ChecksumSpec {
    Computed(bool),
    Explicit(u32),
}

#[derive(Debug, Serialize)]
pub struct RowLine {
    pub row: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct SummaryLine {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
}

impl SummaryLine {
    pub fn ok(rows: usize) -> Self {
        Self {
            status: "ok",
            rows: Some(rows),
            error: None,
            code: None,
        }
    }

    pub fn err(e: &ClientError) -> Self {
        Self {
            status: "error",
            rows: None,
            error: Some(e.to_string()),
            code: Some(e.code()),
        }
    }
}

/// Reads a JSON value as a SQL value of type `ty`. Int64 accepts numbers or
/// decimal strings, bytes are base64, dates `YYYY-MM-DD`, timestamps RFC 3339.
pub fn json_to_sql(json: &serde_json::Value, ty: &Type) -> ClientResult<SqlValue> {
    use serde_json::Value as J;

    let mismatch = || ClientError::ParameterType(format!("Value {json} cannot be read as {}.", ty.name()));
    match (ty, json) {
        (_, J::Null) => Ok(SqlValue::Null),
        (Type::Int64, J::Number(n)) => json_integer(n).unwrap_or_else(|| Err(mismatch())),
        (Type::Int64, J::String(s)) => match s.parse::<i128>() {
            Ok(v) => SqlValue::try_from(v),
            Err(_) => Err(mismatch()),
        },
        (Type::Float64, J::Number(n)) => n.as_f64().map(SqlValue::Float64).ok_or_else(mismatch),
        (Type::String, J::String(s)) => Ok(SqlValue::String(s.clone())),
        (Type::Bool, J::Bool(b)) => Ok(SqlValue::Bool(*b)),
        (Type::Bytes, J::String(s)) => base64::engine::general_purpose::STANDARD
            .decode(s)
            .map(SqlValue::Bytes)
            .map_err(|_| mismatch()),
        (Type::Date, J::String(s)) => parse_date(s).ok_or_else(mismatch).map(SqlValue::Date),
        (Type::Timestamp, J::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|ts| SqlValue::Timestamp(ts.with_timezone(&Utc)))
            .map_err(|_| mismatch()),
        (Type::Array(element), J::Array(items)) => items
            .iter()
            .map(|item| json_to_sql(item, element))
            .collect::<ClientResult<Vec<_>>>()
            .map(SqlValue::Array),
        _ => Err(mismatch()),
    }
}

/// Reads a parameter value with no declared type: integers are Int64, other
/// numbers Float64, plus strings, booleans and arrays of those.
///
/// An integer outside the int64 range is an error, never a float. JSON keeps
/// no trace of how a number was written, so a whole number too large for
/// int64 counts as an integer; declare the parameter Float64 to pass one.
pub fn json_to_sql_untyped(json: &serde_json::Value) -> ClientResult<SqlValue> {
    use serde_json::Value as J;

    match json {
        J::Null => Ok(SqlValue::Null),
        J::Bool(b) => Ok(SqlValue::Bool(*b)),
        J::Number(n) => json_integer(n).unwrap_or_else(|| {
            n.as_f64()
                .map(SqlValue::Float64)
                .ok_or_else(|| ClientError::ParameterType(format!("Value {n} is not a number.")))
        }),
        J::String(s) => Ok(SqlValue::String(s.clone())),
        J::Array(items) => items
            .iter()
            .map(json_to_sql_untyped)
            .collect::<ClientResult<Vec<_>>>()
            .map(SqlValue::Array),
        J::Object(_) => Err(ClientError::ParameterType(format!(
            "Value {json} cannot be used as a query parameter without a declared type."
        ))),
    }
}

/// `None` when `n` has a fractional part. Whole numbers outside int64 fail
/// with a range error.
fn json_integer(n: &serde_json::Number) -> Option<ClientResult<SqlValue>> {
    if let Some(v) = n.as_i64() {
        return Some(Ok(SqlValue::Int64(v)));
    }
    if let Some(v) = n.as_u64() {
        return Some(SqlValue::try_from(v));
    }
    match n.as_f64() {
        Some(v) if v.is_finite() && v.fract() == 0.0 => Some(Err(out_of_range(n))),
        _ => None,
    }
}

fn parse_date(s: &str) -> Option<SqlDate> {
    let mut parts = s.splitn(3, '-');
    let year = parts.next()?.parse().ok()?;
    let month = parts.next()?.parse().ok()?;
    let day = parts.next()?.parse().ok()?;
    SqlDate::new(year, month, day).ok()
}
