use crate::{
    core::{
        types::{ResultSetMetadata, Type},
        wire::ColumnMetadata,
    },
    error::{ClientError, ClientResult},
};

/// Builds result metadata from the column list of a prepare response.
pub fn parse_metadata(columns: &[ColumnMetadata]) -> ClientResult<ResultSetMetadata> {
    if columns.is_empty() {
        return Err(ClientError::InvalidMetadata(
            "invalid empty result set metadata received".into(),
        ));
    }

    let mut tuples = Vec::with_capacity(columns.len());
    for column in columns {
        if column.name.is_empty() {
            return Err(ClientError::InvalidMetadata(format!(
                "invalid column name \"{}\"",
                column.name
            )));
        }
        validate_type(&column.ty)?;
        tuples.push((Some(column.name.clone()), column.ty.clone()));
    }
    Ok(ResultSetMetadata::from_tuples(tuples))
}

fn validate_type(ty: &Type) -> ClientResult<()> {
    match ty {
        Type::Array(element) => validate_type(element),
        Type::Map(key, value) => {
            if !key.is_valid_map_key() {
                return Err(ClientError::InvalidMetadata(format!(
                    "unsupported type of map key received: {key}"
                )));
            }
            validate_type(value)
        }
        Type::Struct(st) => st.fields().values().iter().try_for_each(validate_type),
        _ => Ok(()),
    }
}
