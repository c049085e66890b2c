use std::{
    pin::Pin,
    task::{Context, Poll},
};

use async_trait::async_trait;
use futures::{stream::BoxStream, Stream};
use tokio_util::sync::CancellationToken;

use crate::core::{
    status::Status,
    wire::{ExecuteQueryRequest, PartialResultSet, PrepareQueryRequest, PrepareQueryResponse},
};

/// The RPC surface the engine needs from the row-store service.
///
/// Implementations must not retry on their own; all retry policy lives in
/// the execution state machine.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn prepare_query(&self, request: PrepareQueryRequest) -> Result<PrepareQueryResponse, Status>;

    fn execute_query(&self, request: ExecuteQueryRequest) -> RequestStream;
}

/// A server stream of execute-query messages for one attempt.
///
/// `None` from the stream is a normal end. After [`RequestStream::abort`] the
/// stream yields nothing more and the transport is told to tear the call down.
pub struct RequestStream {
    inner: Option<BoxStream<'static, Result<PartialResultSet, Status>>>,
    abort: CancellationToken,
}

impl RequestStream {
    pub fn new(inner: BoxStream<'static, Result<PartialResultSet, Status>>) -> Self {
        Self {
            inner: Some(inner),
            abort: CancellationToken::new(),
        }
    }

    /// Token the transport watches to cancel the underlying call.
    pub fn with_abort_token(mut self, token: CancellationToken) -> Self {
        self.abort = token;
        self
    }

    pub fn abort(&mut self) {
        if self.inner.take().is_some() {
            self.abort.cancel();
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.is_none()
    }
}

impl Stream for RequestStream {
    type Item = Result<PartialResultSet, Status>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.inner.as_mut() {
            Some(inner) => inner.as_mut().poll_next(cx),
            None => Poll::Ready(None),
        }
    }
}

impl Drop for RequestStream {
    fn drop(&mut self) {
        self.abort();
    }
}
