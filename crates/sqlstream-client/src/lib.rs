//! Streaming SQL query client for a row-store service.
//!
//! Queries are prepared once into a [`PreparedStatement`] and executed as a
//! [`ResultStream`] of rows. Transient failures are retried from the last
//! resume token so every row is delivered exactly once.

pub mod adapters;
pub mod cli;
pub mod core;
pub mod error;
pub mod logging;

pub use crate::core::{
    client::QueryClient,
    config::{ClientOptions, PreparedStatementOptions, RetryOptions},
    prepared::PreparedStatement,
    result_stream::ResultStream,
    status::{Code, Status},
    transport::{RequestStream, Transport},
    types::{ResultSetMetadata, Type},
    values::{QueryResultRow, SqlDate, SqlValue},
};
pub use crate::error::{ClientError, ClientResult};
