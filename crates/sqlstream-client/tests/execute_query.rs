mod common;

use std::{collections::HashMap, time::Duration};

use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use sqlstream_client::{
    core::wire::{encode_rows, Kind, Value},
    ClientError, Code, Status, QueryResultRow, ResultStream, RetryOptions, SqlValue, Type,
};

use common::*;

fn ints(rows: &[QueryResultRow], column: &str) -> Vec<i64> {
    rows.iter()
        .map(|row| row.get(column).unwrap().as_i64().unwrap())
        .collect()
}

async fn collect(rows: ResultStream) -> Result<Vec<QueryResultRow>, ClientError> {
    rows.try_collect().await
}

#[tokio::test(start_paused = true)]
async fn single_row_is_delivered_after_its_token() {
    let mock = MockTransport::new();
    mock.push_prepare(Ok(response(&[("f1", Type::Int64)], "plan-1", None)));
    let attempt = mock.push_attempt();

    let client = client(&mock, options());
    let stmt = client.prepare_statement("SELECT 1 AS f1", HashMap::new()).await.unwrap();
    let rows = client.execute_query(&stmt, &HashMap::new()).unwrap();

    let batch = int_batch(&[1]);
    attempt.send(Ok(data(&batch))).unwrap();
    attempt.send(Ok(checksum(&batch))).unwrap();
    attempt.send(Ok(token("token1"))).unwrap();
    drop(attempt);

    let got = collect(rows).await.unwrap();
    assert_eq!(ints(&got, "f1"), vec![1]);
    assert_eq!(mock.prepare_calls(), 1);
    assert_eq!(mock.requests().len(), 1);
    assert_eq!(mock.requests()[0].prepared_query, Bytes::from_static(b"plan-1"));
}

#[tokio::test(start_paused = true)]
async fn retry_before_first_token_restarts_without_duplicates() {
    let mock = MockTransport::new();
    mock.push_prepare(Ok(response(&[("f1", Type::Int64)], "plan", None)));
    let first = mock.push_attempt();
    let second = mock.push_attempt();

    let batch = int_batch(&[1]);
    first.send(Ok(data(&batch))).unwrap();
    first.send(Ok(checksum(&batch))).unwrap();
    first.send(Err(unavailable())).unwrap();
    second.send(Ok(complete(&[2], "token1"))).unwrap();
    drop(second);

    let client = client(&mock, options());
    let stmt = client.prepare_statement("SELECT f1 FROM t", HashMap::new()).await.unwrap();
    let got = collect(client.execute_query(&stmt, &HashMap::new()).unwrap()).await.unwrap();

    assert_eq!(ints(&got, "f1"), vec![2]);
    let requests = mock.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].resume_token, None);
    assert!(mock.abort_token(0).is_cancelled());
}

#[tokio::test(start_paused = true)]
async fn retry_after_token_resumes_from_it() {
    let mock = MockTransport::new();
    mock.push_prepare(Ok(response(&[("f1", Type::Int64)], "plan", None)));
    let first = mock.push_attempt();
    let second = mock.push_attempt();

    first.send(Ok(complete(&[1], "token1"))).unwrap();
    let lost = int_batch(&[2]);
    first.send(Ok(data(&lost))).unwrap();
    first.send(Ok(checksum(&lost))).unwrap();
    first.send(Err(unavailable())).unwrap();
    second.send(Ok(complete(&[2], "token2"))).unwrap();
    drop(second);

    let client = client(&mock, options());
    let stmt = client.prepare_statement("SELECT f1 FROM t", HashMap::new()).await.unwrap();
    let got = collect(client.execute_query(&stmt, &HashMap::new()).unwrap()).await.unwrap();

    assert_eq!(ints(&got, "f1"), vec![1, 2]);
    assert_eq!(mock.requests()[1].resume_token, Some(Bytes::from_static(b"token1")));
}

#[tokio::test(start_paused = true)]
async fn expired_plan_before_token_is_refreshed_with_new_metadata() {
    let mock = MockTransport::new();
    mock.push_prepare(Ok(response(&[("f1", Type::Int64)], "plan-1", None)));
    mock.push_prepare(Ok(response(&[("f2", Type::Int64)], "plan-2", None)));
    let first = mock.push_attempt();
    let second = mock.push_attempt();

    first.send(Ok(data(&int_batch(&[1])))).unwrap();
    first.send(Err(expired())).unwrap();
    second.send(Ok(complete(&[1], "token1"))).unwrap();
    drop(second);

    let client = client(&mock, options());
    let stmt = client.prepare_statement("SELECT * FROM t", HashMap::new()).await.unwrap();
    let mut rows = client.execute_query(&stmt, &HashMap::new()).unwrap();
    let row = rows.next().await.unwrap().unwrap();

    assert!(matches!(row.get("f1"), Err(ClientError::UnknownField(_))));
    assert_eq!(*row.get("f2").unwrap(), SqlValue::Int64(1));
    assert_eq!(rows.metadata().unwrap().field_name_at(0), Some("f2"));
    assert!(rows.next().await.is_none());

    assert_eq!(mock.prepare_calls(), 2);
    let requests = mock.requests();
    assert_eq!(requests[1].prepared_query, Bytes::from_static(b"plan-2"));
    assert_eq!(requests[1].resume_token, None);
    let prepares = mock.prepare_requests();
    assert_eq!(prepares[0], prepares[1]);
}

#[tokio::test(start_paused = true)]
async fn expired_plan_after_token_fails_the_execution() {
    let mock = MockTransport::new();
    mock.push_prepare(Ok(response(&[("f1", Type::Int64)], "plan", None)));
    let first = mock.push_attempt();
    first.send(Ok(complete(&[1], "token1"))).unwrap();
    first.send(Err(expired())).unwrap();

    let client = client(&mock, options());
    let stmt = client.prepare_statement("SELECT f1 FROM t", HashMap::new()).await.unwrap();
    let mut rows = client.execute_query(&stmt, &HashMap::new()).unwrap();

    assert_eq!(ints(&[rows.next().await.unwrap().unwrap()], "f1"), vec![1]);
    assert!(matches!(rows.next().await, Some(Err(ClientError::PlanExpired(_)))));
    assert!(rows.next().await.is_none());
    assert_eq!(mock.prepare_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn fatal_status_is_surfaced_once() {
    let mock = MockTransport::new();
    mock.push_prepare(Ok(response(&[("f1", Type::Int64)], "plan", None)));
    let first = mock.push_attempt();
    first
        .send(Err(Status::new(Code::PermissionDenied, "denied")))
        .unwrap();

    let client = client(&mock, options());
    let stmt = client.prepare_statement("SELECT f1 FROM t", HashMap::new()).await.unwrap();
    let mut rows = client.execute_query(&stmt, &HashMap::new()).unwrap();

    let err = rows.next().await.unwrap().unwrap_err();
    assert_eq!(err.code(), "TRANSPORT_ERROR");
    assert!(rows.next().await.is_none());
    assert_eq!(mock.requests().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn retries_stop_at_the_configured_limit() {
    let mock = MockTransport::new();
    mock.push_prepare(Ok(response(&[("f1", Type::Int64)], "plan", None)));
    for _ in 0..2 {
        mock.push_attempt().send(Err(unavailable())).unwrap();
    }

    let opts = options().with_retry(RetryOptions::default().with_max_retries(1));
    let client = client(&mock, opts);
    let stmt = client.prepare_statement("SELECT f1 FROM t", HashMap::new()).await.unwrap();
    let err = collect(client.execute_query(&stmt, &HashMap::new()).unwrap())
        .await
        .unwrap_err();

    assert!(matches!(err, ClientError::RetriesExhausted { attempts: 2, .. }));
    assert_eq!(mock.requests().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn checksum_mismatch_is_not_retried() {
    let mock = MockTransport::new();
    mock.push_prepare(Ok(response(&[("f1", Type::Int64)], "plan", None)));
    let first = mock.push_attempt();
    let mut bad = complete(&[1], "token1");
    bad.batch_checksum = bad.batch_checksum.map(|c| c ^ 1);
    first.send(Ok(bad)).unwrap();

    let client = client(&mock, options());
    let stmt = client.prepare_statement("SELECT f1 FROM t", HashMap::new()).await.unwrap();
    let err = collect(client.execute_query(&stmt, &HashMap::new()).unwrap())
        .await
        .unwrap_err();

    assert_eq!(err.code(), "CHECKSUM_MISMATCH");
    assert_eq!(mock.requests().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn stream_end_with_unconfirmed_rows_is_a_protocol_error() {
    let mock = MockTransport::new();
    mock.push_prepare(Ok(response(&[("f1", Type::Int64)], "plan", None)));
    let first = mock.push_attempt();
    let batch = int_batch(&[1]);
    first.send(Ok(data(&batch))).unwrap();
    first.send(Ok(checksum(&batch))).unwrap();
    drop(first);

    let client = client(&mock, options());
    let stmt = client.prepare_statement("SELECT f1 FROM t", HashMap::new()).await.unwrap();
    let err = collect(client.execute_query(&stmt, &HashMap::new()).unwrap())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "PROTOCOL_ERROR");
}

#[tokio::test(start_paused = true)]
async fn deadline_while_waiting_for_plan() {
    let mock = MockTransport::new();
    mock.push_prepare(Ok(response(&[("f1", Type::Int64)], "plan", None)));
    let _never = mock.push_gated_prepare(Ok(response(&[("f1", Type::Int64)], "plan-2", None)));

    let opts = options().with_retry(RetryOptions::default().with_total_timeout(Duration::from_secs(1)));
    let client = client(&mock, opts);
    let stmt = client.prepare_statement("SELECT f1 FROM t", HashMap::new()).await.unwrap();
    stmt.mark_as_expired();

    let err = collect(client.execute_query(&stmt, &HashMap::new()).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::DeadlineExceeded));
    assert!(mock.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn deadline_fires_while_the_consumer_is_not_reading() {
    let mock = MockTransport::new();
    mock.push_prepare(Ok(response(&[("f1", Type::Int64)], "plan", None)));
    let first = mock.push_attempt();
    let values: Vec<i64> = (0..200).collect();
    first.send(Ok(complete(&values, "token1"))).unwrap();

    let opts = options().with_retry(RetryOptions::default().with_total_timeout(Duration::from_secs(1)));
    let client = client(&mock, opts);
    let stmt = client.prepare_statement("SELECT f1 FROM t", HashMap::new()).await.unwrap();
    let mut rows = client.execute_query(&stmt, &HashMap::new()).unwrap();

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(mock.abort_token(0).is_cancelled());

    let mut delivered = 0;
    let mut last = None;
    while let Some(item) = rows.next().await {
        match item {
            Ok(_) => delivered += 1,
            Err(e) => last = Some(e),
        }
    }
    assert!(delivered < values.len());
    assert!(matches!(last, Some(ClientError::DeadlineExceeded)));
    drop(first);
}

#[tokio::test(start_paused = true)]
async fn cancel_stops_delivery_and_aborts_the_attempt() {
    let mock = MockTransport::new();
    mock.push_prepare(Ok(response(&[("f1", Type::Int64)], "plan", None)));
    let first = mock.push_attempt();
    first.send(Ok(complete(&[1], "token1"))).unwrap();

    let client = client(&mock, options());
    let stmt = client.prepare_statement("SELECT f1 FROM t", HashMap::new()).await.unwrap();
    let mut rows = client.execute_query(&stmt, &HashMap::new()).unwrap();
    assert!(rows.next().await.unwrap().is_ok());

    rows.cancel();
    rows.cancel();
    first.send(Ok(complete(&[2], "token2"))).ok();
    assert!(rows.next().await.is_none());

    let token = mock.abort_token(0);
    settle(|| token.is_cancelled()).await;
}

#[tokio::test(start_paused = true)]
async fn parameters_are_checked_before_anything_is_sent() {
    let mock = MockTransport::new();
    mock.push_prepare(Ok(response(&[("f1", Type::Int64)], "plan", None)));
    let client = client(&mock, options());
    let types = HashMap::from([("id".to_string(), Type::Int64)]);
    let stmt = client.prepare_statement("SELECT f1 FROM t WHERE id = @id", types).await.unwrap();

    let wrong = HashMap::from([("id".to_string(), SqlValue::from("seven"))]);
    let err = client.execute_query(&stmt, &wrong).err().unwrap();
    assert_eq!(err.code(), "PARAMETER_TYPE_ERROR");
    assert!(mock.requests().is_empty());

    let attempt = mock.push_attempt();
    drop(attempt);
    let ok = HashMap::from([("id".to_string(), SqlValue::Int64(7))]);
    let got = collect(client.execute_query(&stmt, &ok).unwrap()).await.unwrap();
    assert!(got.is_empty());
    let sent = &mock.requests()[0].params["id"];
    assert_eq!(sent.ty, Some(Type::Int64));
    assert_eq!(sent.kind, Some(Kind::IntValue(7)));
}

#[tokio::test(start_paused = true)]
async fn batch_split_over_messages_yields_rows_in_order() {
    let mock = MockTransport::new();
    mock.push_prepare(Ok(response(&[("a", Type::Int64), ("b", Type::String)], "plan", None)));
    let first = mock.push_attempt();

    let batch = encode_rows(vec![Value::int(1), Value::string("x"), Value::int(2), Value::null()]).unwrap();
    let (head, tail) = batch.split_at(batch.len() / 2);
    first.send(Ok(data(&Bytes::copy_from_slice(head)))).unwrap();
    first.send(Ok(data(&Bytes::copy_from_slice(tail)))).unwrap();
    first.send(Ok(checksum(&batch))).unwrap();
    first.send(Ok(token("t"))).unwrap();
    drop(first);

    let client = client(&mock, options());
    let stmt = client.prepare_statement("SELECT a, b FROM t", HashMap::new()).await.unwrap();
    let got = collect(client.execute_query(&stmt, &HashMap::new()).unwrap()).await.unwrap();

    assert_eq!(ints(&got, "a"), vec![1, 2]);
    assert_eq!(got[0].get(1).unwrap().as_str(), Some("x"));
    assert!(got[1].get("b").unwrap().is_null());
}
