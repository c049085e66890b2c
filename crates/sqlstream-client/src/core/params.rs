use std::collections::HashMap;

use crate::{
    core::{
        types::Type,
        values::SqlValue,
        wire::{Kind, Value, WireTimestamp},
    },
    error::{ClientError, ClientResult},
};

/// Encodes every parameter against its declared type. Names must match the
/// declared set exactly.
pub fn encode_parameters(
    params: &HashMap<String, SqlValue>,
    param_types: &HashMap<String, Type>,
) -> ClientResult<HashMap<String, Value>> {
    if params.len() != param_types.len() {
        return Err(ClientError::ParameterType(format!(
            "Number of parameters ({}) does not match number of parameter types ({}).",
            params.len(),
            param_types.len()
        )));
    }

    params
        .iter()
        .map(|(name, value)| {
            let ty = param_types
                .get(name)
                .ok_or_else(|| ClientError::ParameterType(format!("Unrecognized parameter: {name}")))?;
            Ok((name.clone(), encode(value, ty)?))
        })
        .collect()
}

/// Encodes a parameter value. The result always carries `ty` so the server
/// can validate typed nulls too.
pub fn encode(value: &SqlValue, ty: &Type) -> ClientResult<Value> {
    let kind = encode_kind(value, ty)?;
    Ok(Value {
        ty: Some(ty.clone()),
        kind,
    })
}

fn encode_kind(value: &SqlValue, ty: &Type) -> ClientResult<Option<Kind>> {
    if value.is_null() {
        return Ok(None);
    }

    let kind = match (ty, value) {
        (Type::String, SqlValue::String(v)) => Kind::StringValue(v.clone()),
        (Type::Int64, SqlValue::Int64(v)) => Kind::IntValue(*v),
        (Type::Int64, SqlValue::Float64(v)) => {
            return Err(ClientError::ParameterType(format!(
                "Value {v} cannot be converted to int64 - argument of type INT64 should be passed as an integer."
            )))
        }
        (Type::Float64, SqlValue::Float64(v)) => Kind::FloatValue(*v),
        (Type::Bytes, SqlValue::Bytes(v)) => Kind::BytesValue(v.clone()),
        (Type::Bool, SqlValue::Bool(v)) => Kind::BoolValue(*v),
        (Type::Timestamp, SqlValue::Timestamp(ts)) => Kind::TimestampValue(WireTimestamp {
            seconds: ts.timestamp(),
            nanos: ts.timestamp_subsec_nanos() as i32,
        }),
        (Type::Date, SqlValue::Date(d)) => Kind::DateValue(*d),
        (Type::Array(element), SqlValue::Array(items)) => Kind::ArrayValue(
            items
                .iter()
                .enumerate()
                .map(|(i, item)| {
                    encode_kind(item, element)
                        .map(|kind| Value { ty: None, kind })
                        .map_err(|e| {
                            ClientError::ParameterType(format!(
                                "Error while converting element {i} of an array: {e}"
                            ))
                        })
                })
                .collect::<ClientResult<Vec<_>>>()?,
        ),
        (Type::Struct(_), _) => {
            return Err(ClientError::ParameterType(
                "Struct is not a supported query param type".into(),
            ))
        }
        (Type::Map(..), _) => {
            return Err(ClientError::ParameterType(
                "Map is not a supported query param type".into(),
            ))
        }
        (ty, value) => {
            return Err(ClientError::ParameterType(format!(
                "Value {value} cannot be converted to {}.",
                ty.name()
            )))
        }
    };
    Ok(Some(kind))
}

/// Guesses the declared type of a parameter when the caller gave no hint.
pub fn infer_type(value: &SqlValue) -> ClientResult<Type> {
    match value {
        SqlValue::Int64(_) => Ok(Type::Int64),
        SqlValue::Float64(_) => Ok(Type::Float64),
        SqlValue::String(_) => Ok(Type::String),
        SqlValue::Bool(_) => Ok(Type::Bool),
        SqlValue::Bytes(_) => Ok(Type::Bytes),
        SqlValue::Timestamp(_) => Ok(Type::Timestamp),
        SqlValue::Date(_) => Ok(Type::Date),
        SqlValue::Array(_) => Err(ClientError::ParameterType(
            "Cannot infer type of an array. Please provide a type hint.".into(),
        )),
        other => Err(ClientError::ParameterType(format!(
            "Cannot infer type of {other}. Please provide a type hint."
        ))),
    }
}

/// Builds the declared parameter types for a statement, taking explicit hints
/// first and inferring the rest from the example values.
pub fn infer_parameter_types(
    params: &HashMap<String, SqlValue>,
    mut hints: HashMap<String, Type>,
) -> ClientResult<HashMap<String, Type>> {
    for (name, value) in params {
        if !hints.contains_key(name) {
            let ty = infer_type(value)
                .map_err(|e| ClientError::ParameterType(format!("Parameter {name}: {e}")))?;
            hints.insert(name.clone(), ty);
        }
    }
    Ok(hints)
}
