use std::{collections::HashMap, fmt, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::error::{ClientError, ClientResult};

/// How field names map onto positions in a [`NamedList`].
///
/// A name that occurs at more than one position cannot be looked up by name;
/// it stays reachable by index only.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct FieldMapping {
    names: Vec<Option<String>>,
    unique: HashMap<String, usize>,
    duplicates: HashMap<String, Vec<usize>>,
}

impl FieldMapping {
    pub fn new(names: Vec<Option<String>>) -> Self {
        let mut positions: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, name) in names.iter().enumerate() {
            if let Some(name) = name.as_deref().filter(|n| !n.is_empty()) {
                positions.entry(name.to_string()).or_default().push(i);
            }
        }

        let mut unique = HashMap::new();
        let mut duplicates = HashMap::new();
        for (name, indexes) in positions {
            if indexes.len() > 1 {
                duplicates.insert(name, indexes);
            } else {
                unique.insert(name, indexes[0]);
            }
        }

        Self {
            names,
            unique,
            duplicates,
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name_at(&self, index: usize) -> Option<&str> {
        self.names.get(index).and_then(|n| n.as_deref())
    }

    pub fn names(&self) -> &[Option<String>] {
        &self.names
    }

    pub fn index_of(&self, name: &str) -> ClientResult<usize> {
        if let Some(indexes) = self.duplicates.get(name) {
            return Err(ClientError::AmbiguousField {
                name: name.to_string(),
                indexes: indexes.clone(),
            });
        }
        self.unique
            .get(name)
            .copied()
            .ok_or_else(|| ClientError::UnknownField(name.to_string()))
    }
}

/// Anything that can address a field of a [`NamedList`]: a position or a name.
pub trait FieldIndex {
    fn field_idx(&self, mapping: &FieldMapping) -> ClientResult<usize>;
}

impl FieldIndex for usize {
    fn field_idx(&self, mapping: &FieldMapping) -> ClientResult<usize> {
        if *self < mapping.len() {
            Ok(*self)
        } else {
            Err(ClientError::FieldIndexOutOfRange {
                index: *self,
                len: mapping.len(),
            })
        }
    }
}

impl FieldIndex for &str {
    fn field_idx(&self, mapping: &FieldMapping) -> ClientResult<usize> {
        mapping.index_of(self)
    }
}

impl FieldIndex for &String {
    fn field_idx(&self, mapping: &FieldMapping) -> ClientResult<usize> {
        mapping.index_of(self)
    }
}

/// An ordered list whose elements can be fetched by index or by (unique) name.
///
/// The mapping is shared, so every row decoded against the same metadata
/// points at the same name table.
#[derive(Debug, Clone)]
pub struct NamedList<T> {
    values: Vec<T>,
    mapping: Arc<FieldMapping>,
}

impl<T> NamedList<T> {
    pub fn new(values: Vec<T>, mapping: Arc<FieldMapping>) -> Self {
        debug_assert_eq!(values.len(), mapping.len());
        Self { values, mapping }
    }

    pub fn from_tuples<N: Into<Option<String>>>(tuples: Vec<(N, T)>) -> Self {
        let (names, values): (Vec<Option<String>>, Vec<T>) =
            tuples.into_iter().map(|(n, v)| (n.into(), v)).unzip();
        Self {
            values,
            mapping: Arc::new(FieldMapping::new(names)),
        }
    }

    pub fn get<I: FieldIndex>(&self, index: I) -> ClientResult<&T> {
        let i = index.field_idx(&self.mapping)?;
        Ok(&self.values[i])
    }

    pub fn field_name_at(&self, index: usize) -> Option<&str> {
        self.mapping.name_at(index)
    }

    pub fn values(&self) -> &[T] {
        &self.values
    }

    pub fn mapping(&self) -> &Arc<FieldMapping> {
        &self.mapping
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Option<&str>, &T)> {
        self.values
            .iter()
            .enumerate()
            .map(|(i, v)| (self.mapping.name_at(i), v))
    }
}

impl<T: PartialEq> PartialEq for NamedList<T> {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values && self.mapping.names() == other.mapping.names()
    }
}

/// One named field of a struct type, as carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructField {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub ty: Type,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<StructField>", into = "Vec<StructField>")]
pub struct StructType(NamedList<Type>);

impl StructType {
    pub fn new(fields: Vec<(Option<String>, Type)>) -> Self {
        Self(NamedList::from_tuples(fields))
    }

    pub fn fields(&self) -> &NamedList<Type> {
        &self.0
    }
}

impl From<Vec<StructField>> for StructType {
    fn from(fields: Vec<StructField>) -> Self {
        Self::new(fields.into_iter().map(|f| (f.name, f.ty)).collect())
    }
}

impl From<StructType> for Vec<StructField> {
    fn from(st: StructType) -> Self {
        st.0.iter()
            .map(|(name, ty)| StructField {
                name: name.map(str::to_string),
                ty: ty.clone(),
            })
            .collect()
    }
}

/// Declared type of a column, struct field or query parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Type {
    Int64,
    Float64,
    String,
    Bytes,
    Bool,
    Date,
    Timestamp,
    Array(Box<Type>),
    Map(Box<Type>, Box<Type>),
    Struct(StructType),
}

impl Type {
    pub fn array(element: Type) -> Self {
        Type::Array(Box::new(element))
    }

    pub fn map(key: Type, value: Type) -> Self {
        Type::Map(Box::new(key), Box::new(value))
    }

    pub fn structure<N: Into<Option<String>>>(fields: Vec<(N, Type)>) -> Self {
        Type::Struct(StructType::new(
            fields.into_iter().map(|(n, t)| (n.into(), t)).collect(),
        ))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Type::Int64 => "int64",
            Type::Float64 => "float64",
            Type::String => "string",
            Type::Bytes => "bytes",
            Type::Bool => "boolean",
            Type::Date => "date",
            Type::Timestamp => "timestamp",
            Type::Array(_) => "array",
            Type::Map(..) => "map",
            Type::Struct(_) => "struct",
        }
    }

    pub fn is_valid_map_key(&self) -> bool {
        matches!(self, Type::Int64 | Type::String | Type::Bytes)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Array(element) => write!(f, "array<{element}>"),
            Type::Map(k, v) => write!(f, "map<{k}, {v}>"),
            Type::Struct(st) => {
                write!(f, "struct<")?;
                for (i, (name, ty)) in st.fields().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    match name {
                        Some(name) => write!(f, "{name} {ty}")?,
                        None => write!(f, "{ty}")?,
                    }
                }
                write!(f, ">")
            }
            scalar => f.write_str(scalar.name()),
        }
    }
}

/// Ordered column list of a query result.
pub type ResultSetMetadata = NamedList<Type>;

impl ResultSetMetadata {
    pub fn columns(&self) -> &[Type] {
        self.values()
    }
}
