use chrono::{DateTime, Utc};

use crate::{
    core::{
        types::{ResultSetMetadata, StructType, Type},
        values::{MapKey, QueryResultRow, SqlDate, SqlMap, SqlValue, Struct},
        wire::{Kind, Value, WireTimestamp},
    },
    error::{ClientError, ClientResult},
};

/// Decodes one wire value against its declared type.
pub fn decode(value: &Value, ty: &Type) -> ClientResult<SqlValue> {
    let Some(kind) = &value.kind else {
        return Ok(SqlValue::Null);
    };

    match (ty, kind) {
        (Type::Bytes, Kind::BytesValue(v)) => Ok(SqlValue::Bytes(v.clone())),
        (Type::String, Kind::StringValue(v)) => Ok(SqlValue::String(v.clone())),
        (Type::Int64, Kind::IntValue(v)) => Ok(SqlValue::Int64(*v)),
        (Type::Bool, Kind::BoolValue(v)) => Ok(SqlValue::Bool(*v)),
        (Type::Float64, Kind::FloatValue(v)) => Ok(SqlValue::Float64(*v)),
        (Type::Timestamp, Kind::TimestampValue(ts)) => decode_timestamp(ts).map(SqlValue::Timestamp),
        (Type::Date, Kind::DateValue(d)) => {
            SqlDate::new(d.year, d.month, d.day).map(SqlValue::Date).map_err(|e| ClientError::Decode(e.to_string()))
        }
        (Type::Array(element), Kind::ArrayValue(items)) => items
            .iter()
            .map(|item| decode(item, element))
            .collect::<ClientResult<Vec<_>>>()
            .map(SqlValue::Array),
        (Type::Struct(st), Kind::ArrayValue(items)) => decode_struct(items, st).map(SqlValue::Struct),
        (Type::Map(key_ty, value_ty), Kind::ArrayValue(pairs)) => {
            decode_map(pairs, key_ty, value_ty).map(SqlValue::Map)
        }
        (ty, kind) => Err(ClientError::Decode(format!(
            "metadata and value not matching: expected {ty}, got {}",
            kind_name(kind)
        ))),
    }
}

fn decode_timestamp(ts: &WireTimestamp) -> ClientResult<DateTime<Utc>> {
    u32::try_from(ts.nanos)
        .ok()
        .and_then(|nanos| DateTime::from_timestamp(ts.seconds, nanos))
        .ok_or_else(|| {
            ClientError::Decode(format!(
                "timestamp out of range: seconds={} nanos={}",
                ts.seconds, ts.nanos
            ))
        })
}

fn decode_struct(items: &[Value], st: &StructType) -> ClientResult<Struct> {
    let fields = st.fields();
    if items.len() != fields.len() {
        return Err(ClientError::Decode(format!(
            "received struct with {} values, but metadata has {} fields",
            items.len(),
            fields.len()
        )));
    }
    let values = items
        .iter()
        .zip(fields.values())
        .map(|(item, ty)| decode(item, ty))
        .collect::<ClientResult<Vec<_>>>()?;
    Ok(Struct::new(values, fields.mapping().clone()))
}

fn decode_map(pairs: &[Value], key_ty: &Type, value_ty: &Type) -> ClientResult<SqlMap> {
    let mut map = SqlMap::new();
    for pair in pairs {
        let Some(Kind::ArrayValue(kv)) = &pair.kind else {
            return Err(ClientError::Decode("map entry is not a [key, value] pair".into()));
        };
        let [key, value] = kv.as_slice() else {
            return Err(ClientError::Decode(format!(
                "map entry has {} elements, expected 2",
                kv.len()
            )));
        };
        let key = match decode(key, key_ty)? {
            SqlValue::Int64(k) => MapKey::Int64(k),
            SqlValue::String(k) => MapKey::String(k),
            SqlValue::Bytes(k) => MapKey::Bytes(k),
            SqlValue::Null => return Err(ClientError::Decode("map key cannot be null".into())),
            other => {
                return Err(ClientError::Decode(format!(
                    "unsupported type of map key received: {other}"
                )))
            }
        };
        map.insert(key, decode(value, value_ty)?);
    }
    Ok(map)
}

/// Turns one row worth of wire values into a row sharing the metadata's name table.
pub fn decode_row(values: &[Value], metadata: &ResultSetMetadata) -> ClientResult<QueryResultRow> {
    if values.len() != metadata.len() {
        return Err(ClientError::ProtocolStructure(format!(
            "received row with {} values, expected {}",
            values.len(),
            metadata.len()
        )));
    }
    let decoded = values
        .iter()
        .zip(metadata.columns())
        .map(|(v, ty)| decode(v, ty))
        .collect::<ClientResult<Vec<_>>>()?;
    Ok(QueryResultRow::new(decoded, metadata.mapping().clone()))
}

fn kind_name(kind: &Kind) -> &'static str {
    match kind {
        Kind::BytesValue(_) => "bytes",
        Kind::StringValue(_) => "string",
        Kind::IntValue(_) => "int64",
        Kind::BoolValue(_) => "boolean",
        Kind::FloatValue(_) => "float64",
        Kind::TimestampValue(_) => "timestamp",
        Kind::DateValue(_) => "date",
        Kind::ArrayValue(_) => "array",
    }
}
