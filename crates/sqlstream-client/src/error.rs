use thiserror::Error;

use crate::core::status::Status;

#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("failed to fetch query plan: {0}")]
    PlanFetch(Status),

    #[error("query plan expired: {0}")]
    PlanExpired(String),

    #[error("maximum retry limit exceeded after {attempts} errors; last error: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("transport error: {0}")]
    Transport(Status),

    #[error("failed to validate next batch of results")]
    Checksum,

    #[error("protocol error: {0}")]
    ProtocolStructure(String),

    #[error("{0}")]
    ParameterType(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("decode error: {0}")]
    Decode(String),

    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("unknown field name '{0}'")]
    UnknownField(String),

    #[error("cannot access {name} by name because it is available on multiple indexes: {indexes:?}")]
    AmbiguousField { name: String, indexes: Vec<usize> },

    #[error("field index {index} out of range for {len} fields")]
    FieldIndexOutOfRange { index: usize, len: usize },

    #[error("io error: {0}")]
    Io(String),

    #[error("json error: {0}")]
    Json(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::Json(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for ClientError {
    fn from(e: bincode::error::DecodeError) -> Self {
        ClientError::Decode(e.to_string())
    }
}

impl From<bincode::error::EncodeError> for ClientError {
    fn from(e: bincode::error::EncodeError) -> Self {
        ClientError::Internal(e.to_string())
    }
}

impl ClientError {
    pub fn code(&self) -> &'static str {
        match self {
            ClientError::InvalidRequest(_) => "INVALID_REQUEST",
            ClientError::PlanFetch(_) => "PLAN_FETCH_FAILED",
            ClientError::PlanExpired(_) => "PLAN_EXPIRED",
            ClientError::RetriesExhausted { .. } => "RETRIES_EXHAUSTED",
            ClientError::Transport(_) => "TRANSPORT_ERROR",
            ClientError::Checksum => "CHECKSUM_MISMATCH",
            ClientError::ProtocolStructure(_) => "PROTOCOL_ERROR",
            ClientError::ParameterType(_) => "PARAMETER_TYPE_ERROR",
            ClientError::DeadlineExceeded => "DEADLINE_EXCEEDED",
            ClientError::Decode(_) => "DECODE_ERROR",
            ClientError::InvalidMetadata(_) => "INVALID_METADATA",
            ClientError::UnknownField(_) => "UNKNOWN_FIELD",
            ClientError::AmbiguousField { .. } => "AMBIGUOUS_FIELD",
            ClientError::FieldIndexOutOfRange { .. } => "FIELD_INDEX_OUT_OF_RANGE",
            ClientError::Io(_) => "IO_ERROR",
            ClientError::Json(_) => "JSON_ERROR",
            ClientError::Internal(_) => "INTERNAL",
        }
    }
}

pub type ClientResult<T> = Result<T, ClientError>;
