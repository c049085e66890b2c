use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::Stream;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::{
    core::{types::ResultSetMetadata, values::QueryResultRow},
    error::ClientResult,
};

/// Rows of one query execution, in order.
///
/// Yields each confirmed row once. An error is yielded at most once and ends
/// the stream. Dropping the stream cancels the execution.
pub struct ResultStream {
    rows: mpsc::Receiver<ClientResult<QueryResultRow>>,
    metadata: watch::Receiver<Option<Arc<ResultSetMetadata>>>,
    cancel: CancellationToken,
    done: bool,
}

impl ResultStream {
    pub(crate) fn new(
        rows: mpsc::Receiver<ClientResult<QueryResultRow>>,
        metadata: watch::Receiver<Option<Arc<ResultSetMetadata>>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            rows,
            metadata,
            cancel,
            done: false,
        }
    }

    /// Column metadata of the plan the rows are decoded with, once known.
    pub fn metadata(&self) -> Option<Arc<ResultSetMetadata>> {
        self.metadata.borrow().clone()
    }

    /// Waits until the plan is resolved and returns its metadata. `None` means
    /// the execution stopped before a plan was obtained.
    pub async fn wait_for_metadata(&mut self) -> Option<Arc<ResultSetMetadata>> {
        self.metadata
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|md| md.clone())
    }

    /// Stops the execution. No rows or errors are delivered afterwards.
    /// Calling it again has no effect.
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        self.done = true;
        self.rows.close();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Stream for ResultStream {
    type Item = ClientResult<QueryResultRow>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.rows.poll_recv(cx) {
            Poll::Ready(Some(Err(e))) => {
                self.done = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

impl Drop for ResultStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::{core::values::SqlValue, error::ClientError};

    fn stream() -> (
        mpsc::Sender<ClientResult<QueryResultRow>>,
        watch::Sender<Option<Arc<ResultSetMetadata>>>,
        ResultStream,
        CancellationToken,
    ) {
        let (tx, rx) = mpsc::channel(4);
        let (md_tx, md_rx) = watch::channel(None);
        let token = CancellationToken::new();
        (tx, md_tx, ResultStream::new(rx, md_rx, token.clone()), token)
    }

    #[tokio::test]
    async fn error_ends_the_stream() {
        let (tx, _md, mut rows, _) = stream();
        tx.send(Err(ClientError::Checksum)).await.unwrap();
        let _ = tx.send(Ok(QueryResultRow::from_tuples(vec![(Some("a".to_string()), SqlValue::Int64(1))]))).await;

        assert!(matches!(rows.next().await, Some(Err(ClientError::Checksum))));
        assert!(rows.next().await.is_none());
    }

    #[tokio::test]
    async fn cancel_and_drop_signal_the_execution() {
        let (_tx, _md, mut rows, token) = stream();
        rows.cancel();
        rows.cancel();
        assert!(token.is_cancelled());
        assert!(rows.next().await.is_none());

        let (_tx, _md, rows, token) = stream();
        drop(rows);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn metadata_is_none_until_published() {
        let (_tx, md_tx, mut rows, _) = stream();
        assert!(rows.metadata().is_none());
        let md = Arc::new(ResultSetMetadata::from_tuples(vec![(Some("f1".to_string()), crate::core::types::Type::Int64)]));
        md_tx.send_replace(Some(md.clone()));
        assert_eq!(rows.wait_for_metadata().await.unwrap().len(), 1);
        assert_eq!(rows.metadata().unwrap().field_name_at(0), Some("f1"));
    }
}
