use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::{sync::oneshot, time::Instant};

use crate::{
    core::{
        config::PreparedStatementOptions,
        metadata::parse_metadata,
        status::{Code, Status},
        transport::Transport,
        types::{ResultSetMetadata, Type},
        wire::{PrepareQueryRequest, PrepareQueryResponse},
    },
    error::{ClientError, ClientResult},
};

/// Opaque plan bytes plus the metadata needed to decode the rows they produce.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub prepared_query: Bytes,
    pub metadata: Arc<ResultSetMetadata>,
}

type Waiter = oneshot::Sender<ClientResult<QueryPlan>>;

struct PlanState {
    plan: QueryPlan,
    valid_until: Option<Instant>,
    forced_expiration: bool,
    refreshing: bool,
    waiters: VecDeque<Waiter>,
}

impl PlanState {
    fn is_expired(&self, now: Instant) -> bool {
        self.forced_expiration || self.valid_until.is_some_and(|v| now >= v)
    }

    fn should_refresh_soon(&self, now: Instant, window: Duration) -> bool {
        self.valid_until.is_some_and(|v| now + window > v)
    }
}

struct Shared {
    transport: Arc<dyn Transport>,
    request: PrepareQueryRequest,
    refresh_ahead: Duration,
    state: Mutex<PlanState>,
}

/// A prepared query whose plan is fetched once and refreshed as it nears
/// expiry. Cheap to clone; clones share one plan and one in-flight refresh.
#[derive(Clone)]
pub struct PreparedStatement {
    shared: Arc<Shared>,
}

impl PreparedStatement {
    pub fn new(
        transport: Arc<dyn Transport>,
        request: PrepareQueryRequest,
        response: PrepareQueryResponse,
        options: &PreparedStatementOptions,
    ) -> ClientResult<Self> {
        let (plan, valid_until) = plan_from_response(response)?;
        Ok(Self {
            shared: Arc::new(Shared {
                transport,
                request,
                refresh_ahead: options.refresh_ahead(),
                state: Mutex::new(PlanState {
                    plan,
                    valid_until,
                    forced_expiration: false,
                    refreshing: false,
                    waiters: VecDeque::new(),
                }),
            }),
        })
    }

    /// Returns the current plan, or waits up to `timeout` for a fresh one when
    /// the current plan is expired.
    ///
    /// Inside the refresh-ahead window the current plan is still returned while
    /// one background refresh runs.
    pub async fn get_data(&self, timeout: Duration) -> ClientResult<QueryPlan> {
        let rx = {
            let mut st = self.lock()?;
            let now = Instant::now();
            self.schedule_refresh_if_needed(&mut st, now);
            if !st.is_expired(now) {
                return Ok(st.plan.clone());
            }
            let (tx, rx) = oneshot::channel();
            st.waiters.push_back(tx);
            rx
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::Internal(
                "prepared statement dropped a pending plan request".into(),
            )),
            Err(_) => Err(ClientError::PlanFetch(Status::new(
                Code::DeadlineExceeded,
                "deadline exceeded waiting for prepared statement to refresh",
            ))),
        }
    }

    /// Forces the next [`PreparedStatement::get_data`] to wait for a new plan.
    pub fn mark_as_expired(&self) {
        if let Ok(mut st) = self.lock() {
            if !st.forced_expiration {
                tracing::debug!(query = %self.shared.request.query, "prepared query marked as expired");
            }
            st.forced_expiration = true;
        }
    }

    pub fn is_expired(&self) -> bool {
        self.lock().map(|st| st.is_expired(Instant::now())).unwrap_or(true)
    }

    pub fn parameter_types(&self) -> &HashMap<String, Type> {
        &self.shared.request.param_types
    }

    pub fn query(&self) -> &str {
        &self.shared.request.query
    }

    fn lock(&self) -> ClientResult<MutexGuard<'_, PlanState>> {
        self.shared
            .state
            .lock()
            .map_err(|_| ClientError::Internal("poisoned lock".into()))
    }

    fn schedule_refresh_if_needed(&self, st: &mut PlanState, now: Instant) {
        if st.refreshing {
            return;
        }
        if st.is_expired(now) || st.should_refresh_soon(now, self.shared.refresh_ahead) {
            st.refreshing = true;
            let this = self.clone();
            tokio::spawn(async move { this.refresh().await });
        }
    }

    async fn refresh(&self) {
        tracing::debug!(query = %self.shared.request.query, "refreshing prepared query");
        let result = self
            .shared
            .transport
            .prepare_query(self.shared.request.clone())
            .await
            .map_err(ClientError::PlanFetch)
            .and_then(plan_from_response);

        // The waiters queued behind this fetch are taken together with its
        // result; a caller arriving afterwards starts its own fetch.
        let (waiters, error) = {
            let Ok(mut st) = self.lock() else { return };
            st.refreshing = false;
            let error = match result {
                Ok((plan, valid_until)) => {
                    st.plan = plan;
                    st.valid_until = valid_until;
                    st.forced_expiration = false;
                    None
                }
                Err(e) => {
                    tracing::warn!(error = %e, "prepared query refresh failed");
                    Some(e)
                }
            };
            (std::mem::take(&mut st.waiters), error)
        };

        // One waiter at a time, letting each run before the next is served: a
        // plan expired again in between must not reach the later ones.
        for waiter in waiters {
            let outcome = match &error {
                Some(e) => Err(e.clone()),
                None => self.current_plan(),
            };
            if waiter.send(outcome).is_ok() {
                tokio::task::yield_now().await;
            }
        }
    }

    fn current_plan(&self) -> ClientResult<QueryPlan> {
        let st = self.lock()?;
        if st.is_expired(Instant::now()) {
            return Err(ClientError::PlanFetch(Status::new(
                Code::FailedPrecondition,
                "getting a fresh query plan failed",
            )));
        }
        Ok(st.plan.clone())
    }
}

fn plan_from_response(response: PrepareQueryResponse) -> ClientResult<(QueryPlan, Option<Instant>)> {
    let metadata = parse_metadata(&response.columns)?;
    Ok((
        QueryPlan {
            prepared_query: response.prepared_query,
            metadata: Arc::new(metadata),
        },
        response.valid_until.map(instant_from_wall_clock),
    ))
}

fn instant_from_wall_clock(valid_until: DateTime<Utc>) -> Instant {
    let remaining = (valid_until - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    Instant::now() + remaining
}
