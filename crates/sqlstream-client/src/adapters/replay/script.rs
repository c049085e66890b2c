use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;

use crate::{
    core::{
        params::encode,
        status::{Code, Status},
        transport::{RequestStream, Transport},
        types::Type,
        wire::{
            encode_rows, ColumnMetadata, ExecuteQueryRequest, Kind, PartialResultSet, PrepareQueryRequest,
            PrepareQueryResponse, Value,
        },
    },
    error::{ClientError, ClientResult},
};

use super::protocol::{json_to_sql, ChecksumSpec, ScriptMessage, ScriptRecord};

type ScriptedAttempt = Vec<Result<PartialResultSet, Status>>;

enum ScriptedPrepare {
    Response {
        columns: Vec<ColumnMetadata>,
        valid_for_ms: Option<u64>,
    },
    Failure(Status),
}

/// A parsed replay scenario.
pub struct Script {
    pub query: String,
    pub param_types: HashMap<String, Type>,
    prepares: Vec<ScriptedPrepare>,
    attempts: Vec<ScriptedAttempt>,
}

impl Script {
    pub fn from_records(records: Vec<ScriptRecord>) -> ClientResult<Self> {
        let mut query = None;
        let mut param_types = HashMap::new();
        let mut prepares = Vec::new();
        let mut attempts = Vec::new();
        let mut column_types: Option<Vec<Type>> = None;

        for (line, record) in records.into_iter().enumerate() {
            match record {
                ScriptRecord::Prepare {
                    query: q,
                    param_types: types,
                    columns,
                    valid_for_ms,
                } => {
                    if query.is_none() {
                        query = q;
                        param_types = types;
                    }
                    column_types = Some(columns.iter().map(|c| c.ty.clone()).collect());
                    prepares.push(ScriptedPrepare::Response { columns, valid_for_ms });
                }
                ScriptRecord::PrepareError { status } => prepares.push(ScriptedPrepare::Failure(status)),
                ScriptRecord::Attempt { messages, error } => {
                    let Some(types) = &column_types else {
                        return Err(ClientError::InvalidRequest(format!(
                            "script record {}: attempt before any prepare record",
                            line + 1
                        )));
                    };
                    let mut items = build_attempt(messages, types)
                        .map_err(|e| ClientError::InvalidRequest(format!("script record {}: {e}", line + 1)))?;
                    if let Some(status) = error {
                        items.push(Err(status));
                    }
                    attempts.push(items);
                }
            }
        }

        let query = query.ok_or_else(|| ClientError::InvalidRequest("script names no query".into()))?;
        Ok(Self {
            query,
            param_types,
            prepares,
            attempts,
        })
    }

    pub fn into_transport(self) -> ScriptedTransport {
        ScriptedTransport {
            prepares: Mutex::new(self.prepares.into()),
            last_prepare: Mutex::new(None),
            attempts: Mutex::new(self.attempts.into()),
            requests: Mutex::new(Vec::new()),
        }
    }
}

/// Builds an attempt's messages. The rows of every message up to a checksum
/// (or a reset, or the end of the attempt) form one batch: it is encoded once
/// and its bytes are split over those messages.
fn build_attempt(messages: Vec<ScriptMessage>, types: &[Type]) -> ClientResult<ScriptedAttempt> {
    let mut items = Vec::with_capacity(messages.len());
    let mut open: Vec<(usize, Vec<Value>)> = Vec::new();
    for msg in messages {
        if msg.reset {
            fill_batch(&mut items, std::mem::take(&mut open))?;
        }
        let index = items.len();
        items.push(PartialResultSet {
            batch_data: Bytes::new(),
            batch_checksum: None,
            resume_token: msg.resume_token.map(Bytes::from).unwrap_or_default(),
            reset: msg.reset,
            estimated_batch_size: None,
        });
        if !msg.rows.is_empty() {
            open.push((index, script_row_values(&msg.rows, types)?));
        }
        items[index].batch_checksum = match msg.checksum {
            None | Some(ChecksumSpec::Computed(false)) => None,
            Some(ChecksumSpec::Computed(true)) => {
                let batch = fill_batch(&mut items, std::mem::take(&mut open))?;
                Some(crc32c::crc32c(&batch))
            }
            Some(ChecksumSpec::Explicit(sum)) => {
                fill_batch(&mut items, std::mem::take(&mut open))?;
                Some(sum)
            }
        };
    }
    fill_batch(&mut items, open)?;
    Ok(items.into_iter().map(Ok).collect())
}

fn fill_batch(items: &mut [PartialResultSet], parts: Vec<(usize, Vec<Value>)>) -> ClientResult<Bytes> {
    if parts.is_empty() {
        return Ok(Bytes::new());
    }
    let indexes: Vec<usize> = parts.iter().map(|(index, _)| *index).collect();
    let batch = encode_rows(parts.into_iter().flat_map(|(_, values)| values).collect())?;
    let n = indexes.len();
    for (k, index) in indexes.into_iter().enumerate() {
        items[index].batch_data = batch.slice(k * batch.len() / n..(k + 1) * batch.len() / n);
    }
    Ok(batch)
}

fn script_row_values(rows: &[Vec<serde_json::Value>], types: &[Type]) -> ClientResult<Vec<Value>> {
    let mut values = Vec::with_capacity(rows.len() * types.len());
    for row in rows {
        if row.len() != types.len() {
            return Err(ClientError::InvalidRequest(format!(
                "row has {} values but the plan has {} columns",
                row.len(),
                types.len()
            )));
        }
        for (json, ty) in row.iter().zip(types) {
            values.push(result_value(json, ty)?);
        }
    }
    Ok(values)
}

/// Wire form of one result value. Maps are written as `[[key, value], ...]`
/// or as an object, structs as a positional array or an object keyed by
/// field name (missing fields are null).
fn result_value(json: &serde_json::Value, ty: &Type) -> ClientResult<Value> {
    use serde_json::Value as J;

    let kind = match (ty, json) {
        (_, J::Null) => return Ok(Value::null()),
        (Type::Array(element), J::Array(items)) => Kind::ArrayValue(
            items
                .iter()
                .map(|item| result_value(item, element))
                .collect::<ClientResult<Vec<_>>>()?,
        ),
        (Type::Map(key_ty, value_ty), J::Array(pairs)) => Kind::ArrayValue(
            pairs
                .iter()
                .map(|pair| match pair.as_array().map(Vec::as_slice) {
                    Some([key, value]) => map_entry(key, value, key_ty, value_ty),
                    _ => Err(ClientError::InvalidRequest(format!(
                        "map entry {pair} is not a [key, value] pair"
                    ))),
                })
                .collect::<ClientResult<Vec<_>>>()?,
        ),
        (Type::Map(key_ty, value_ty), J::Object(entries)) => Kind::ArrayValue(
            entries
                .iter()
                .map(|(key, value)| map_entry(&J::String(key.clone()), value, key_ty, value_ty))
                .collect::<ClientResult<Vec<_>>>()?,
        ),
        (Type::Struct(st), J::Array(items)) => {
            let fields = st.fields();
            if items.len() != fields.len() {
                return Err(ClientError::InvalidRequest(format!(
                    "struct value has {} items but the type has {} fields",
                    items.len(),
                    fields.len()
                )));
            }
            Kind::ArrayValue(
                items
                    .iter()
                    .zip(fields.values())
                    .map(|(item, ty)| result_value(item, ty))
                    .collect::<ClientResult<Vec<_>>>()?,
            )
        }
        (Type::Struct(st), J::Object(entries)) => Kind::ArrayValue(
            st.fields()
                .iter()
                .map(|(name, ty)| match name.and_then(|n| entries.get(n)) {
                    Some(item) => result_value(item, ty),
                    None => Ok(Value::null()),
                })
                .collect::<ClientResult<Vec<_>>>()?,
        ),
        (ty, json) => {
            return Ok(Value {
                ty: None,
                ..encode(&json_to_sql(json, ty)?, ty)?
            })
        }
    };
    Ok(Value::of(kind))
}

fn map_entry(key: &serde_json::Value, value: &serde_json::Value, key_ty: &Type, value_ty: &Type) -> ClientResult<Value> {
    Ok(Value::array(vec![result_value(key, key_ty)?, result_value(value, value_ty)?]))
}

/// Serves a script's prepare responses and attempts in order. Once the
/// prepare responses run out the last successful one keeps being served.
pub struct ScriptedTransport {
    prepares: Mutex<VecDeque<ScriptedPrepare>>,
    last_prepare: Mutex<Option<(Vec<ColumnMetadata>, Option<u64>)>>,
    attempts: Mutex<VecDeque<ScriptedAttempt>>,
    requests: Mutex<Vec<ExecuteQueryRequest>>,
}

impl ScriptedTransport {
    /// Execute requests received so far.
    pub fn requests(&self) -> Vec<ExecuteQueryRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn prepare_query(&self, request: PrepareQueryRequest) -> Result<PrepareQueryResponse, Status> {
        let poisoned = || Status::new(Code::Internal, "replay state poisoned");
        let next = self.prepares.lock().map_err(|_| poisoned())?.pop_front();
        let mut last = self.last_prepare.lock().map_err(|_| poisoned())?;
        let (columns, valid_for_ms) = match next {
            Some(ScriptedPrepare::Failure(status)) => return Err(status),
            Some(ScriptedPrepare::Response { columns, valid_for_ms }) => {
                *last = Some((columns.clone(), valid_for_ms));
                (columns, valid_for_ms)
            }
            None => last
                .clone()
                .ok_or_else(|| Status::new(Code::NotFound, "replay script has no prepare response"))?,
        };
        tracing::debug!(query = %request.query, "replaying prepare response");
        Ok(PrepareQueryResponse {
            columns,
            prepared_query: Bytes::from(request.query.into_bytes()),
            valid_until: valid_for_ms.map(|ms| Utc::now() + chrono::Duration::milliseconds(ms as i64)),
        })
    }

    fn execute_query(&self, request: ExecuteQueryRequest) -> RequestStream {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        let items = self
            .attempts
            .lock()
            .ok()
            .and_then(|mut attempts| attempts.pop_front())
            .unwrap_or_else(|| vec![Err(Status::new(Code::Internal, "replay script has no more attempts"))]);
        RequestStream::new(futures::stream::iter(items).boxed())
    }
}
