//! Messages exchanged with the row-store service.
//!
//! Batch payloads inside [`PartialResultSet::batch_data`] are `bincode`
//! encoded [`ProtoRows`]; everything else is handed to the transport as typed
//! structs and serialized however the transport sees fit.

use std::collections::HashMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    core::{types::Type, values::SqlDate},
    error::{ClientError, ClientResult},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireTimestamp {
    pub seconds: i64,
    pub nanos: i32,
}

/// Payload of a wire value. An absent kind is a (typed) null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    BytesValue(Vec<u8>),
    StringValue(String),
    IntValue(i64),
    BoolValue(bool),
    FloatValue(f64),
    TimestampValue(WireTimestamp),
    DateValue(SqlDate),
    ArrayValue(Vec<Value>),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Value {
    #[serde(default, rename = "type")]
    pub ty: Option<Type>,
    #[serde(default)]
    pub kind: Option<Kind>,
}

impl Value {
    pub fn null() -> Self {
        Self::default()
    }

    pub fn of(kind: Kind) -> Self {
        Self {
            ty: None,
            kind: Some(kind),
        }
    }

    pub fn int(v: i64) -> Self {
        Self::of(Kind::IntValue(v))
    }

    pub fn string(v: impl Into<String>) -> Self {
        Self::of(Kind::StringValue(v.into()))
    }

    pub fn array(values: Vec<Value>) -> Self {
        Self::of(Kind::ArrayValue(values))
    }
}

/// One batch worth of values, laid out row-major.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProtoRows {
    pub values: Vec<Value>,
}

pub fn encode_rows(values: Vec<Value>) -> ClientResult<Bytes> {
    let bytes = bincode::serde::encode_to_vec(ProtoRows { values }, bincode::config::standard())?;
    Ok(Bytes::from(bytes))
}

/// Decodes a completed batch. Bytes left over after the rows are an error.
pub fn decode_rows(bytes: &[u8]) -> ClientResult<Vec<Value>> {
    let (rows, read): (ProtoRows, usize) =
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
    if read != bytes.len() {
        return Err(ClientError::Decode(format!(
            "batch has {} trailing bytes after its rows",
            bytes.len() - read
        )));
    }
    Ok(rows.values)
}

/// One message of the execute-query response stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialResultSet {
    pub batch_data: Bytes,
    pub batch_checksum: Option<u32>,
    pub resume_token: Bytes,
    pub reset: bool,
    pub estimated_batch_size: Option<u32>,
}

impl PartialResultSet {
    pub fn has_resume_token(&self) -> bool {
        !self.resume_token.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMetadata {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: Type,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrepareQueryRequest {
    pub instance_name: String,
    #[serde(default)]
    pub app_profile_id: Option<String>,
    pub query: String,
    #[serde(default)]
    pub param_types: HashMap<String, Type>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrepareQueryResponse {
    pub columns: Vec<ColumnMetadata>,
    pub prepared_query: Bytes,
    pub valid_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteQueryRequest {
    pub instance_name: String,
    pub app_profile_id: Option<String>,
    pub prepared_query: Bytes,
    pub params: HashMap<String, Value>,
    pub resume_token: Option<Bytes>,
}
