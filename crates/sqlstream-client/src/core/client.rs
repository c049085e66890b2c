use std::{collections::HashMap, sync::Arc};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::{
    core::{
        config::ClientOptions,
        execution::Execution,
        params::encode_parameters,
        prepared::PreparedStatement,
        result_stream::ResultStream,
        state_machine::{ExecuteQueryStateMachine, RequestTemplate},
        transport::Transport,
        types::Type,
        values::SqlValue,
        wire::PrepareQueryRequest,
    },
    error::{ClientError, ClientResult},
};

const ROW_BUFFER: usize = 64;

/// Entry point for preparing and executing queries over one transport.
#[derive(Clone)]
pub struct QueryClient {
    transport: Arc<dyn Transport>,
    options: ClientOptions,
}

impl QueryClient {
    pub fn new(transport: Arc<dyn Transport>, options: ClientOptions) -> Self {
        Self { transport, options }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Prepares `query` with the given parameter types. A single call; the
    /// plan is refreshed later on demand by the returned statement.
    pub async fn prepare_statement(
        &self,
        query: impl Into<String>,
        param_types: HashMap<String, Type>,
    ) -> ClientResult<PreparedStatement> {
        let query = query.into();
        if query.trim().is_empty() {
            return Err(ClientError::InvalidRequest("query must not be empty".into()));
        }
        let request = PrepareQueryRequest {
            instance_name: self.options.instance_name.clone(),
            app_profile_id: self.options.app_profile_id.clone(),
            query,
            param_types,
        };
        tracing::debug!(query = %request.query, "preparing query");
        let response = self
            .transport
            .prepare_query(request.clone())
            .await
            .map_err(ClientError::PlanFetch)?;
        PreparedStatement::new(
            self.transport.clone(),
            request,
            response,
            &self.options.prepared_statement,
        )
    }

    /// Starts executing `statement`. Parameters are checked and encoded before
    /// anything is sent, so type errors surface here and not on the stream.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn execute_query(
        &self,
        statement: &PreparedStatement,
        params: &HashMap<String, SqlValue>,
    ) -> ClientResult<ResultStream> {
        let params = encode_parameters(params, statement.parameter_types())?;
        let machine = ExecuteQueryStateMachine::new(
            RequestTemplate {
                instance_name: self.options.instance_name.clone(),
                app_profile_id: self.options.app_profile_id.clone(),
                params,
            },
            self.options.retry.clone(),
            self.options.checksum_validator.clone(),
        );

        let (rows_tx, rows_rx) = mpsc::channel(ROW_BUFFER);
        let (metadata_tx, metadata_rx) = watch::channel(None);
        let cancel = CancellationToken::new();

        let execution = Execution::new(
            machine,
            self.transport.clone(),
            statement.clone(),
            rows_tx,
            metadata_tx,
            cancel.clone(),
        );
        tracing::debug!(query = %statement.query(), "executing query");
        tokio::spawn(execution.run());

        Ok(ResultStream::new(rows_rx, metadata_rx, cancel))
    }
}
