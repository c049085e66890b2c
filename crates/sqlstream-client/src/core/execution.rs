use std::{future::Future, pin::Pin, sync::Arc};

use futures::{future::BoxFuture, StreamExt};
use tokio::{
    sync::{mpsc, watch},
    time::{Instant, Sleep},
};
use tokio_util::sync::CancellationToken;

use crate::{
    core::{
        prepared::{PreparedStatement, QueryPlan},
        state_machine::{Action, AttemptId, Event, ExecuteQueryStateMachine},
        status::Status,
        transport::{RequestStream, Transport},
        types::ResultSetMetadata,
        values::QueryResultRow,
        wire::PartialResultSet,
    },
    error::ClientResult,
};

pub(crate) type RowSender = mpsc::Sender<ClientResult<QueryResultRow>>;
pub(crate) type MetadataSender = watch::Sender<Option<Arc<ResultSetMetadata>>>;

/// Runs one query execution: feeds transport, timer and cancellation events
/// into the state machine and carries out the actions it returns.
pub(crate) struct Execution {
    machine: ExecuteQueryStateMachine,
    transport: Arc<dyn Transport>,
    statement: PreparedStatement,
    deadline: Instant,
    rows: RowSender,
    metadata: MetadataSender,
    cancel: CancellationToken,

    attempt: Option<(AttemptId, RequestStream)>,
    retry: Option<Pin<Box<Sleep>>>,
    plan_fetch: Option<BoxFuture<'static, ClientResult<QueryPlan>>>,
}

impl Execution {
    pub(crate) fn new(
        machine: ExecuteQueryStateMachine,
        transport: Arc<dyn Transport>,
        statement: PreparedStatement,
        rows: RowSender,
        metadata: MetadataSender,
        cancel: CancellationToken,
    ) -> Self {
        let deadline = Instant::now() + machine.retry_options().total_timeout();
        Self {
            machine,
            transport,
            statement,
            deadline,
            rows,
            metadata,
            cancel,
            attempt: None,
            retry: None,
            plan_fetch: None,
        }
    }

    pub(crate) async fn run(mut self) {
        let deadline = tokio::time::sleep_until(self.deadline);
        tokio::pin!(deadline);

        let mut actions = self.machine.start();
        loop {
            let mut interrupted = None;
            for action in actions {
                if let Some(event) = self.apply(action).await {
                    interrupted = Some(event);
                    break;
                }
            }
            if let Some(event) = interrupted {
                actions = self.machine.step(event);
                continue;
            }
            if self.machine.state().is_terminal() {
                break;
            }

            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Event::Cancel,
                _ = &mut deadline => Event::TotalTimeout,
                _ = maybe(&mut self.retry) => {
                    self.retry = None;
                    Event::RetryTimerFired
                }
                plan = maybe(&mut self.plan_fetch) => {
                    self.plan_fetch = None;
                    match plan {
                        Ok(plan) => Event::PlanReady(plan),
                        Err(e) => Event::PlanFailed(e),
                    }
                }
                (attempt, item) = next_message(&mut self.attempt) => match item {
                    Some(Ok(message)) => Event::Data { attempt, message },
                    Some(Err(status)) => Event::StreamError { attempt, status },
                    None => Event::StreamEnd { attempt },
                },
            };
            actions = self.machine.step(event);
        }

        self.teardown();
        tracing::debug!(state = %self.machine.state(), "query execution stopped");
    }

    /// Carries out one action. Returns an event when delivery was cut short and
    /// the machine has to hear about it before any further action runs.
    async fn apply(&mut self, action: Action) -> Option<Event> {
        match action {
            Action::FetchPlan => {
                let statement = self.statement.clone();
                let remaining = self.deadline.saturating_duration_since(Instant::now());
                self.plan_fetch = Some(Box::pin(async move { statement.get_data(remaining).await }));
            }
            Action::MarkPlanExpired => self.statement.mark_as_expired(),
            Action::StartAttempt { attempt, request } => {
                let stream = self.transport.execute_query(request);
                self.attempt = Some((attempt, stream));
            }
            Action::AbortAttempt { attempt } => {
                if matches!(&self.attempt, Some((id, _)) if *id == attempt) {
                    if let Some((_, mut stream)) = self.attempt.take() {
                        stream.abort();
                    }
                }
            }
            Action::ScheduleRetry { delay } => {
                tracing::debug!(?delay, "scheduling retry");
                self.retry = Some(Box::pin(tokio::time::sleep(delay)));
            }
            Action::CancelRetry => self.retry = None,
            Action::PublishMetadata(metadata) => {
                self.metadata.send_replace(Some(metadata));
            }
            Action::EmitRows(rows) => {
                for row in rows {
                    match deliver(&self.rows, &self.cancel, Some(self.deadline), Ok(row)).await {
                        Delivery::Sent => {}
                        Delivery::Stopped => return Some(Event::Cancel),
                        Delivery::DeadlineExceeded => return Some(Event::TotalTimeout),
                    }
                }
            }
            Action::Fail(err) => {
                self.teardown();
                deliver(&self.rows, &self.cancel, None, Err(err)).await;
            }
            Action::Finish => self.teardown(),
        }
        None
    }

    fn teardown(&mut self) {
        if let Some((_, mut stream)) = self.attempt.take() {
            stream.abort();
        }
        self.retry = None;
        self.plan_fetch = None;
    }
}

enum Delivery {
    Sent,
    Stopped,
    DeadlineExceeded,
}

/// Delivers one item, giving up if the consumer cancels or goes away, or once
/// `deadline` passes while the consumer is not reading.
async fn deliver(
    rows: &RowSender,
    cancel: &CancellationToken,
    deadline: Option<Instant>,
    item: ClientResult<QueryResultRow>,
) -> Delivery {
    let mut expiry = deadline.map(|at| Box::pin(tokio::time::sleep_until(at)));
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Delivery::Stopped,
        _ = maybe(&mut expiry) => Delivery::DeadlineExceeded,
        sent = rows.send(item) => match sent {
            Ok(()) => Delivery::Sent,
            Err(_) => {
                cancel.cancel();
                Delivery::Stopped
            }
        },
    }
}

async fn maybe<F: Future + Unpin>(fut: &mut Option<F>) -> F::Output {
    match fut.as_mut() {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn next_message(
    attempt: &mut Option<(AttemptId, RequestStream)>,
) -> (AttemptId, Option<Result<PartialResultSet, Status>>) {
    match attempt.as_mut() {
        Some((id, stream)) => (*id, stream.next().await),
        None => std::future::pending().await,
    }
}
