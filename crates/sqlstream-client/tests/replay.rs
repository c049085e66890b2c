use std::collections::HashMap;

use clap::Parser;
use serde_json::{json, Value};
use sqlstream_client::{
    adapters::replay::{read_ndjson, replay, NdjsonWriter, Script, ScriptRecord},
    cli::Args,
    ClientOptions,
};

fn script(text: &str) -> Script {
    let records: Vec<ScriptRecord> = read_ndjson(text.as_bytes()).unwrap();
    Script::from_records(records).unwrap()
}

async fn run(text: &str, params: HashMap<String, Value>) -> (Vec<Value>, bool) {
    let mut out = NdjsonWriter::new(Vec::new());
    let ok = replay(script(text), ClientOptions::new("projects/p/instances/i"), params, &mut out)
        .await
        .is_ok();
    let lines = String::from_utf8(out.into_inner())
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    (lines, ok)
}

const RETRY_AFTER_TOKEN: &str = r#"
{"kind":"prepare","query":"SELECT id, name FROM users","columns":[{"name":"id","type":"int64"},{"name":"name","type":"string"}]}
{"kind":"attempt","messages":[{"rows":[[1,"ada"]],"checksum":true,"resume_token":"t1"},{"rows":[[2,"bob"]]}],"error":{"code":"UNAVAILABLE","message":"reset"}}
{"kind":"attempt","messages":[{"rows":[[2,"bob"]],"checksum":true,"resume_token":"t2"}]}
"#;

#[tokio::test(start_paused = true)]
async fn replay_prints_each_row_once_and_a_summary() {
    let (lines, ok) = run(RETRY_AFTER_TOKEN, HashMap::new()).await;
    assert!(ok);
    assert_eq!(
        lines,
        vec![
            json!({"row": {"id": "1", "name": "ada"}}),
            json!({"row": {"id": "2", "name": "bob"}}),
            json!({"status": "ok", "rows": 2}),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn replay_refreshes_an_expired_plan() {
    let text = r#"
{"kind":"prepare","query":"SELECT * FROM t","columns":[{"name":"old","type":"int64"}]}
{"kind":"prepare","columns":[{"name":"new","type":"string"}]}
{"kind":"attempt","error":{"code":"FAILED_PRECONDITION","details":[{"@type":"precondition_failure","violations":[{"type":"PREPARED_QUERY_EXPIRED"}]}]}}
{"kind":"attempt","messages":[{"rows":[["x"]],"checksum":true,"resume_token":"t1"}]}
"#;
    let (lines, ok) = run(text, HashMap::new()).await;
    assert!(ok);
    assert_eq!(lines[0], json!({"row": {"new": "x"}}));
    assert_eq!(lines[1], json!({"status": "ok", "rows": 1}));
}

#[tokio::test(start_paused = true)]
async fn replay_reports_fatal_errors_as_summary() {
    let text = r#"
{"kind":"prepare","query":"SELECT 1","columns":[{"name":"c","type":"int64"}]}
{"kind":"attempt","messages":[{"rows":[[1]],"checksum":123,"resume_token":"t1"}]}
"#;
    let (lines, ok) = run(text, HashMap::new()).await;
    assert!(!ok);
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["status"], "error");
    assert_eq!(lines[0]["code"], "CHECKSUM_MISMATCH");
}

#[tokio::test(start_paused = true)]
async fn replay_params_use_declared_types() {
    let text = r#"
{"kind":"prepare","query":"SELECT @id","param_types":{"id":"int64"},"columns":[{"name":"c","type":"int64"}]}
{"kind":"attempt","messages":[{"rows":[[7]],"checksum":true,"resume_token":"t1"}]}
"#;
    let params = HashMap::from([("id".to_string(), json!("7"))]);
    let (lines, ok) = run(text, params).await;
    assert!(ok);
    assert_eq!(lines[0], json!({"row": {"c": "7"}}));

    let wrong = HashMap::from([("id".to_string(), json!(true))]);
    let (lines, ok) = run(text, wrong).await;
    assert!(!ok);
    assert_eq!(lines[0]["code"], "PARAMETER_TYPE_ERROR");
}

#[tokio::test(start_paused = true)]
async fn untyped_integer_param_past_int64_is_a_range_error() {
    let text = r#"
{"kind":"prepare","query":"SELECT @id","columns":[{"name":"c","type":"int64"}]}
{"kind":"attempt","messages":[{"rows":[[7]],"checksum":true,"resume_token":"t1"}]}
"#;
    let args = Args::try_parse_from([
        "sqlstream-client",
        "--script",
        "s.ndjson",
        "--param",
        "id=9223372036854775808",
    ])
    .unwrap();
    let (lines, ok) = run(text, args.params.into_iter().collect()).await;
    assert!(!ok);
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["code"], "PARAMETER_TYPE_ERROR");
    let message = lines[0]["error"].as_str().unwrap();
    assert!(message.contains("Parameter id") && message.contains("out of range"), "{message}");
}

#[tokio::test(start_paused = true)]
async fn batch_spread_over_messages_replays_every_row() {
    let text = r#"
{"kind":"prepare","query":"SELECT s FROM t","columns":[{"name":"s","type":{"array":"int64"}}]}
{"kind":"attempt","messages":[{"rows":[[[1,2]]]},{"rows":[[[3]]],"checksum":true,"resume_token":"t1"}]}
"#;
    let (lines, ok) = run(text, HashMap::new()).await;
    assert!(ok);
    assert_eq!(lines[0], json!({"row": {"s": ["1", "2"]}}));
    assert_eq!(lines[1], json!({"row": {"s": ["3"]}}));
    assert_eq!(lines[2], json!({"status": "ok", "rows": 2}));
}

#[test]
fn attempt_before_prepare_is_rejected() {
    let records: Vec<ScriptRecord> = read_ndjson(r#"{"kind":"attempt"}"#.as_bytes()).unwrap();
    assert!(Script::from_records(records).is_err());
}
