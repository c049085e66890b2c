#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use sqlstream_client::{
    core::wire::{
        encode_rows, ColumnMetadata, ExecuteQueryRequest, PartialResultSet, PrepareQueryRequest,
        PrepareQueryResponse, Value,
    },
    ClientOptions, Code, QueryClient, RequestStream, Status, Transport, Type,
};

pub type AttemptSender = mpsc::UnboundedSender<Result<PartialResultSet, Status>>;

struct ScriptedPrepare {
    gate: Option<oneshot::Receiver<()>>,
    result: Result<PrepareQueryResponse, Status>,
}

/// Transport driven step by step from the test body.
#[derive(Default)]
pub struct MockTransport {
    prepare_calls: AtomicUsize,
    prepares: Mutex<VecDeque<ScriptedPrepare>>,
    prepare_requests: Mutex<Vec<PrepareQueryRequest>>,
    attempts: Mutex<VecDeque<mpsc::UnboundedReceiver<Result<PartialResultSet, Status>>>>,
    requests: Mutex<Vec<ExecuteQueryRequest>>,
    aborts: Mutex<Vec<CancellationToken>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_prepare(&self, result: Result<PrepareQueryResponse, Status>) {
        self.prepares.lock().unwrap().push_back(ScriptedPrepare { gate: None, result });
    }

    /// Queues a prepare response that is only returned once the sender fires.
    pub fn push_gated_prepare(&self, result: Result<PrepareQueryResponse, Status>) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.prepares.lock().unwrap().push_back(ScriptedPrepare {
            gate: Some(rx),
            result,
        });
        tx
    }

    /// Queues the next execute-query attempt. Dropping the sender ends the
    /// stream cleanly.
    pub fn push_attempt(&self) -> AttemptSender {
        let (tx, rx) = mpsc::unbounded_channel();
        self.attempts.lock().unwrap().push_back(rx);
        tx
    }

    pub fn prepare_calls(&self) -> usize {
        self.prepare_calls.load(Ordering::SeqCst)
    }

    pub fn prepare_requests(&self) -> Vec<PrepareQueryRequest> {
        self.prepare_requests.lock().unwrap().clone()
    }

    pub fn requests(&self) -> Vec<ExecuteQueryRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn abort_token(&self, attempt: usize) -> CancellationToken {
        self.aborts.lock().unwrap()[attempt].clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn prepare_query(&self, request: PrepareQueryRequest) -> Result<PrepareQueryResponse, Status> {
        self.prepare_calls.fetch_add(1, Ordering::SeqCst);
        self.prepare_requests.lock().unwrap().push(request);
        let next = self.prepares.lock().unwrap().pop_front();
        let Some(next) = next else {
            return Err(Status::new(Code::Internal, "no prepare response scripted"));
        };
        if let Some(gate) = next.gate {
            let _ = gate.await;
        }
        next.result
    }

    fn execute_query(&self, request: ExecuteQueryRequest) -> RequestStream {
        self.requests.lock().unwrap().push(request);
        let token = CancellationToken::new();
        self.aborts.lock().unwrap().push(token.clone());
        let stream = match self.attempts.lock().unwrap().pop_front() {
            Some(rx) => UnboundedReceiverStream::new(rx).boxed(),
            None => futures::stream::iter(vec![Err(Status::new(Code::Internal, "no attempt scripted"))]).boxed(),
        };
        RequestStream::new(stream).with_abort_token(token)
    }
}

pub fn options() -> ClientOptions {
    ClientOptions::new("projects/p/instances/i")
}

pub fn client(transport: &Arc<MockTransport>, options: ClientOptions) -> QueryClient {
    QueryClient::new(transport.clone(), options)
}

pub fn response(columns: &[(&str, Type)], plan: &'static str, valid_for: Option<Duration>) -> PrepareQueryResponse {
    PrepareQueryResponse {
        columns: columns
            .iter()
            .map(|(name, ty)| ColumnMetadata {
                name: name.to_string(),
                ty: ty.clone(),
            })
            .collect(),
        prepared_query: Bytes::from_static(plan.as_bytes()),
        valid_until: valid_for.map(|d| Utc::now() + chrono::Duration::from_std(d).unwrap()),
    }
}

pub fn int_batch(values: &[i64]) -> Bytes {
    encode_rows(values.iter().map(|v| Value::int(*v)).collect()).unwrap()
}

pub fn data(batch: &Bytes) -> PartialResultSet {
    PartialResultSet {
        batch_data: batch.clone(),
        ..Default::default()
    }
}

pub fn checksum(batch: &Bytes) -> PartialResultSet {
    PartialResultSet {
        batch_checksum: Some(crc32c::crc32c(batch)),
        ..Default::default()
    }
}

pub fn token(t: &'static str) -> PartialResultSet {
    PartialResultSet {
        resume_token: Bytes::from_static(t.as_bytes()),
        ..Default::default()
    }
}

/// Data, checksum and token in one message.
pub fn complete(values: &[i64], t: &'static str) -> PartialResultSet {
    let batch = int_batch(values);
    PartialResultSet {
        batch_checksum: Some(crc32c::crc32c(&batch)),
        batch_data: batch,
        resume_token: Bytes::from_static(t.as_bytes()),
        ..Default::default()
    }
}

pub fn unavailable() -> Status {
    Status::new(Code::Unavailable, "connection reset")
}

pub fn expired() -> Status {
    use sqlstream_client::core::status::{StatusDetail, Violation};

    Status::new(Code::FailedPrecondition, "failed precondition").with_detail(StatusDetail::PreconditionFailure {
        violations: vec![Violation {
            kind: "PREPARED_QUERY_EXPIRED".into(),
            subject: String::new(),
            description: "The prepared query has expired.".into(),
        }],
    })
}

/// Yields until `cond` holds, for background tasks to catch up.
pub async fn settle(mut cond: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition never became true");
}
