//! Replays a recorded scenario through the full query engine.
//!
//! The scenario is NDJSON: `prepare` / `prepare_error` records are served in
//! order to plan fetches and `attempt` records to execute-query calls. Rows
//! are printed as NDJSON on stdout followed by one summary line.

mod io;
mod protocol;
mod script;

use std::{
    collections::HashMap,
    fs::File,
    io::{BufReader, Write},
    sync::Arc,
    time::Duration,
};

use futures::StreamExt;

use crate::{
    cli::Args,
    core::{
        client::QueryClient,
        config::{ClientOptions, PreparedStatementOptions, RetryOptions},
        params::infer_parameter_types,
        types::Type,
        values::{named_list_to_json, SqlValue},
    },
    error::{ClientError, ClientResult},
};

pub use io::{read_ndjson, NdjsonWriter};
pub use protocol::{json_to_sql, json_to_sql_untyped, ChecksumSpec, RowLine, ScriptMessage, ScriptRecord, SummaryLine};
pub use script::{Script, ScriptedTransport};

pub fn run(args: Args) -> ClientResult<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let records: Vec<ScriptRecord> = read_ndjson(BufReader::new(File::open(&args.script)?))?;
    let script = Script::from_records(records)?;

    let mut options = ClientOptions::new(args.instance.clone())
        .with_retry(
            RetryOptions::default()
                .with_total_timeout(Duration::from_millis(args.timeout_ms))
                .with_initial_retry_delay(Duration::from_millis(args.initial_retry_delay_ms))
                .with_max_retries(args.max_retries),
        )
        .with_prepared_statement(PreparedStatementOptions {
            refresh_ahead_ms: args.refresh_ahead_ms,
        });
    if let Some(profile) = &args.app_profile {
        options = options.with_app_profile(profile.clone());
    }
    let params = args.params.iter().cloned().collect();

    let mut out = NdjsonWriter::new(std::io::stdout().lock());
    rt.block_on(replay(script, options, params, &mut out))
}

/// Prepares and executes the script's query, writing each row and then a
/// summary line. An execution error is written as the summary and returned.
pub async fn replay<W: Write>(
    script: Script,
    options: ClientOptions,
    params: HashMap<String, serde_json::Value>,
    out: &mut NdjsonWriter<W>,
) -> ClientResult<()> {
    match stream_rows(script, options, params, out).await {
        Ok(rows) => out.write_json_line(&SummaryLine::ok(rows)),
        Err(e) => {
            out.write_json_line(&SummaryLine::err(&e))?;
            Err(e)
        }
    }
}

async fn stream_rows<W: Write>(
    script: Script,
    options: ClientOptions,
    params: HashMap<String, serde_json::Value>,
    out: &mut NdjsonWriter<W>,
) -> ClientResult<usize> {
    let params = read_params(&params, &script.param_types)?;
    let param_types = infer_parameter_types(&params, script.param_types.clone())?;

    let query = script.query.clone();
    let client = QueryClient::new(Arc::new(script.into_transport()), options);
    let statement = client.prepare_statement(query, param_types).await?;
    let mut rows = client.execute_query(&statement, &params)?;

    let mut count = 0;
    while let Some(row) = rows.next().await {
        let row = row?;
        out.write_json_line(&RowLine {
            row: named_list_to_json(&row),
        })?;
        count += 1;
    }
    tracing::info!(rows = count, "replay finished");
    Ok(count)
}

fn read_params(
    params: &HashMap<String, serde_json::Value>,
    declared: &HashMap<String, Type>,
) -> ClientResult<HashMap<String, SqlValue>> {
    params
        .iter()
        .map(|(name, json)| {
            let value = match declared.get(name) {
                Some(ty) => json_to_sql(json, ty),
                None => json_to_sql_untyped(json),
            }
            .map_err(|e| ClientError::ParameterType(format!("Parameter {name}: {e}")))?;
            Ok((name.clone(), value))
        })
        .collect()
}
