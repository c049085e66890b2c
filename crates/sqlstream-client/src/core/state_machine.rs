//! Query-execution state machine.
//!
//! ```text
//! AwaitingQueryPlan ──plan──▶ BeforeFirstResumeToken ──token──▶ AfterFirstResumeToken
//!        ▲                         │          ▲                      │          ▲
//!        │                 expired │          │ timer      retryable │          │ timer
//!        │                         ▼          │                      ▼          │
//!        └──timer── DrainAndRefreshQueryPlan  DrainingBeforeResumeToken   DrainingAfterResumeToken
//!
//! any state ──fatal / deadline──▶ Failed        Before/After ──clean end──▶ Finished
//! ```
//!
//! The machine owns no I/O. Every input arrives as an [`Event`] and every side
//! effect leaves as an [`Action`] for the driver to carry out, so a transition
//! always runs to completion before the next event is looked at.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use bytes::Bytes;

use crate::{
    core::{
        batch::{BatchAccumulator, Checkpoint},
        codec::decode_row,
        config::{ChecksumValidator, RetryOptions},
        prepared::QueryPlan,
        retry::{backoff_delay, classify, random_jitter_ms, ErrorClass},
        status::Status,
        types::ResultSetMetadata,
        values::QueryResultRow,
        wire::{ExecuteQueryRequest, PartialResultSet, Value},
    },
    error::{ClientError, ClientResult},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Waiting for plan bytes and metadata from the prepared statement.
    AwaitingQueryPlan,
    /// An attempt is open and no checkpoint has been reached yet, so an
    /// expired plan can still be refreshed and the query restarted.
    BeforeFirstResumeToken,
    /// At least one checkpoint was delivered; retries resume from it.
    AfterFirstResumeToken,
    DrainingBeforeResumeToken,
    DrainingAfterResumeToken,
    DrainAndRefreshQueryPlan,
    Finished,
    Failed,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Finished | State::Failed)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub type AttemptId = u64;

#[derive(Debug)]
pub enum Event {
    PlanReady(QueryPlan),
    PlanFailed(ClientError),
    Data {
        attempt: AttemptId,
        message: PartialResultSet,
    },
    StreamError {
        attempt: AttemptId,
        status: Status,
    },
    StreamEnd {
        attempt: AttemptId,
    },
    RetryTimerFired,
    TotalTimeout,
    Cancel,
}

#[derive(Debug)]
pub enum Action {
    FetchPlan,
    MarkPlanExpired,
    StartAttempt {
        attempt: AttemptId,
        request: ExecuteQueryRequest,
    },
    AbortAttempt {
        attempt: AttemptId,
    },
    ScheduleRetry {
        delay: Duration,
    },
    CancelRetry,
    PublishMetadata(Arc<ResultSetMetadata>),
    EmitRows(Vec<QueryResultRow>),
    Fail(ClientError),
    Finish,
}

/// Request fields that stay the same across attempts.
#[derive(Debug, Clone)]
pub struct RequestTemplate {
    pub instance_name: String,
    pub app_profile_id: Option<String>,
    pub params: HashMap<String, Value>,
}

pub struct ExecuteQueryStateMachine {
    state: State,
    options: RetryOptions,
    template: RequestTemplate,
    plan: Option<QueryPlan>,
    buffer: BatchAccumulator,
    resume_token: Option<Bytes>,
    active_attempt: Option<AttemptId>,
    next_attempt: AttemptId,
    num_errors: u32,
    jitter: fn() -> u64,
}

impl ExecuteQueryStateMachine {
    pub fn new(template: RequestTemplate, options: RetryOptions, checksum: ChecksumValidator) -> Self {
        Self {
            state: State::AwaitingQueryPlan,
            options,
            template,
            plan: None,
            buffer: BatchAccumulator::new(checksum),
            resume_token: None,
            active_attempt: None,
            next_attempt: 0,
            num_errors: 0,
            jitter: random_jitter_ms,
        }
    }

    /// Replaces the backoff jitter source.
    pub fn with_jitter(mut self, jitter: fn() -> u64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn resume_token(&self) -> Option<&Bytes> {
        self.resume_token.as_ref()
    }

    pub fn active_attempt(&self) -> Option<AttemptId> {
        self.active_attempt
    }

    pub fn metadata(&self) -> Option<&Arc<ResultSetMetadata>> {
        self.plan.as_ref().map(|p| &p.metadata)
    }

    pub fn retry_options(&self) -> &RetryOptions {
        &self.options
    }

    /// Actions to run when the execution starts.
    pub fn start(&mut self) -> Vec<Action> {
        tracing::debug!(state = %self.state, "starting query execution");
        vec![Action::FetchPlan]
    }

    pub fn step(&mut self, event: Event) -> Vec<Action> {
        if self.state.is_terminal() {
            tracing::trace!(state = %self.state, ?event, "ignoring event after terminal state");
            return Vec::new();
        }

        match event {
            Event::Cancel => self.on_cancel(),
            Event::TotalTimeout => {
                tracing::warn!(state = %self.state, "query deadline exceeded");
                self.fail(ClientError::DeadlineExceeded)
            }
            Event::PlanReady(plan) => self.on_plan_ready(plan),
            Event::PlanFailed(err) => self.on_plan_failed(err),
            Event::RetryTimerFired => self.on_retry_timer(),
            Event::Data { attempt, message } => {
                if self.is_stale(attempt) {
                    return Vec::new();
                }
                self.on_data(message)
            }
            Event::StreamError { attempt, status } => {
                if self.is_stale(attempt) {
                    return Vec::new();
                }
                self.on_stream_error(status)
            }
            Event::StreamEnd { attempt } => {
                if self.is_stale(attempt) {
                    return Vec::new();
                }
                self.on_stream_end()
            }
        }
    }

    fn is_stale(&self, attempt: AttemptId) -> bool {
        if self.active_attempt == Some(attempt) {
            return false;
        }
        tracing::debug!(attempt, active = ?self.active_attempt, "dropping event from abandoned attempt");
        true
    }

    fn on_cancel(&mut self) -> Vec<Action> {
        tracing::debug!(state = %self.state, "query execution cancelled");
        let mut actions = self.abort_active();
        actions.push(Action::CancelRetry);
        self.buffer.clear();
        self.state = State::Finished;
        actions
    }

    fn on_plan_ready(&mut self, plan: QueryPlan) -> Vec<Action> {
        if self.state != State::AwaitingQueryPlan {
            return self.fail(ClientError::Internal(format!(
                "query plan received in state {}",
                self.state
            )));
        }
        let metadata = plan.metadata.clone();
        self.plan = Some(plan);
        self.state = State::BeforeFirstResumeToken;
        let mut actions = vec![Action::PublishMetadata(metadata)];
        actions.extend(self.start_attempt());
        actions
    }

    fn on_plan_failed(&mut self, err: ClientError) -> Vec<Action> {
        if self.state != State::AwaitingQueryPlan {
            return self.fail(ClientError::Internal(format!(
                "query plan failure received in state {}",
                self.state
            )));
        }
        self.num_errors += 1;
        if self.num_errors > self.options.max_retries {
            return self.fail(ClientError::RetriesExhausted {
                attempts: self.num_errors,
                last: format!("failed to get query plan: {err}"),
            });
        }
        tracing::warn!(error = %err, errors = self.num_errors, "query plan fetch failed; retrying");
        vec![Action::ScheduleRetry {
            delay: self.next_delay(),
        }]
    }

    fn on_retry_timer(&mut self) -> Vec<Action> {
        match self.state {
            State::AwaitingQueryPlan => vec![Action::FetchPlan],
            State::DrainAndRefreshQueryPlan => {
                self.state = State::AwaitingQueryPlan;
                vec![Action::FetchPlan]
            }
            State::DrainingBeforeResumeToken => {
                self.state = State::BeforeFirstResumeToken;
                self.start_attempt()
            }
            State::DrainingAfterResumeToken => {
                self.state = State::AfterFirstResumeToken;
                self.start_attempt()
            }
            other => self.fail(ClientError::Internal(format!(
                "retry timer fired in state {other}"
            ))),
        }
    }

    fn on_data(&mut self, message: PartialResultSet) -> Vec<Action> {
        if !matches!(
            self.state,
            State::BeforeFirstResumeToken | State::AfterFirstResumeToken
        ) {
            return self.fail(ClientError::Internal(format!(
                "received data in state {}",
                self.state
            )));
        }

        let Some(metadata) = self.metadata().cloned() else {
            return self.fail(ClientError::Internal("received data without metadata".into()));
        };

        let checkpoint = match self.buffer.push(message, metadata.len()) {
            Ok(Some(checkpoint)) => checkpoint,
            Ok(None) => return Vec::new(),
            Err(e) => return self.fail(e),
        };

        match rows_from_checkpoint(&checkpoint, &metadata) {
            Ok(rows) => {
                tracing::debug!(rows = rows.len(), state = %self.state, "checkpoint reached");
                self.resume_token = Some(checkpoint.resume_token);
                self.state = State::AfterFirstResumeToken;
                if rows.is_empty() {
                    Vec::new()
                } else {
                    vec![Action::EmitRows(rows)]
                }
            }
            Err(e) => self.fail(e),
        }
    }

    fn on_stream_error(&mut self, status: Status) -> Vec<Action> {
        let mut actions = self.abort_active();
        self.buffer.clear();

        match classify(&status, &self.options) {
            ErrorClass::PlanExpired => match self.state {
                State::BeforeFirstResumeToken => {
                    tracing::warn!(%status, "prepared query expired; refreshing plan");
                    self.state = State::DrainAndRefreshQueryPlan;
                    self.resume_token = None;
                    actions.push(Action::MarkPlanExpired);
                    actions.push(Action::ScheduleRetry {
                        delay: self.next_delay(),
                    });
                    actions
                }
                State::AfterFirstResumeToken => {
                    actions.extend(self.fail(ClientError::PlanExpired(
                        "query plan expired after rows were delivered".into(),
                    )));
                    actions
                }
                other => {
                    actions.extend(self.fail(ClientError::Internal(format!(
                        "cannot handle expired query error in state {other}"
                    ))));
                    actions
                }
            },
            ErrorClass::Retryable => {
                self.num_errors += 1;
                if self.num_errors > self.options.max_retries {
                    actions.extend(self.fail(ClientError::RetriesExhausted {
                        attempts: self.num_errors,
                        last: status.to_string(),
                    }));
                    return actions;
                }
                let next = match self.state {
                    State::BeforeFirstResumeToken => State::DrainingBeforeResumeToken,
                    State::AfterFirstResumeToken => State::DrainingAfterResumeToken,
                    other => {
                        actions.extend(self.fail(ClientError::Internal(format!(
                            "cannot handle a stream error in state {other}"
                        ))));
                        return actions;
                    }
                };
                tracing::warn!(%status, errors = self.num_errors, from = %self.state, "retryable stream error");
                self.state = next;
                actions.push(Action::ScheduleRetry {
                    delay: self.next_delay(),
                });
                actions
            }
            ErrorClass::Fatal => {
                actions.extend(self.fail(ClientError::Transport(status)));
                actions
            }
        }
    }

    fn on_stream_end(&mut self) -> Vec<Action> {
        if !matches!(
            self.state,
            State::BeforeFirstResumeToken | State::AfterFirstResumeToken
        ) {
            return self.fail(ClientError::Internal(format!(
                "cannot handle stream end in state {}",
                self.state
            )));
        }
        if !self.buffer.is_empty() {
            return self.fail(ClientError::ProtocolStructure(
                "stream ended before a resume token confirmed the buffered data".into(),
            ));
        }
        self.active_attempt = None;
        self.state = State::Finished;
        tracing::debug!("query execution finished");
        vec![Action::CancelRetry, Action::Finish]
    }

    fn start_attempt(&mut self) -> Vec<Action> {
        let Some(plan) = &self.plan else {
            return self.fail(ClientError::Internal("starting an attempt without a query plan".into()));
        };
        let attempt = self.next_attempt;
        self.next_attempt += 1;
        self.active_attempt = Some(attempt);
        self.buffer.clear();

        let request = ExecuteQueryRequest {
            instance_name: self.template.instance_name.clone(),
            app_profile_id: self.template.app_profile_id.clone(),
            prepared_query: plan.prepared_query.clone(),
            params: self.template.params.clone(),
            resume_token: self.resume_token.clone(),
        };
        tracing::debug!(attempt, resumed = request.resume_token.is_some(), "opening attempt");
        vec![Action::StartAttempt { attempt, request }]
    }

    fn abort_active(&mut self) -> Vec<Action> {
        match self.active_attempt.take() {
            Some(attempt) => vec![Action::AbortAttempt { attempt }],
            None => Vec::new(),
        }
    }

    fn fail(&mut self, err: ClientError) -> Vec<Action> {
        tracing::error!(error = %err, code = err.code(), state = %self.state, "query execution failed");
        let mut actions = self.abort_active();
        actions.push(Action::CancelRetry);
        self.buffer.clear();
        self.state = State::Failed;
        actions.push(Action::Fail(err));
        actions
    }

    fn next_delay(&self) -> Duration {
        backoff_delay(&self.options, self.num_errors, (self.jitter)())
    }
}

fn rows_from_checkpoint(
    checkpoint: &Checkpoint,
    metadata: &ResultSetMetadata,
) -> ClientResult<Vec<QueryResultRow>> {
    checkpoint
        .values
        .chunks(metadata.len())
        .map(|row| decode_row(row, metadata))
        .collect()
}
