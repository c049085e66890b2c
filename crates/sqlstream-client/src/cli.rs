use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "sqlstream-client")]
pub struct Args {
    /// NDJSON scenario to replay (prepare responses and execute attempts).
    #[arg(long)]
    pub script: PathBuf,

    /// Logging level (stderr). Also supports RUST_LOG.
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Instance the requests are addressed to.
    #[arg(long, default_value = "projects/replay/instances/replay")]
    pub instance: String,

    #[arg(long)]
    pub app_profile: Option<String>,

    /// Total deadline for the query execution, retries included.
    #[arg(long, default_value_t = 60_000)]
    pub timeout_ms: u64,

    /// Error-triggered retries allowed before giving up.
    #[arg(long, default_value_t = 10)]
    pub max_retries: u32,

    /// Backoff before the first retry; later retries double it.
    #[arg(long, default_value_t = 10)]
    pub initial_retry_delay_ms: u64,

    /// How long before a plan expires it is refreshed in the background.
    #[arg(long, default_value_t = 1_000)]
    pub refresh_ahead_ms: u64,

    /// Query parameter as NAME=JSON (repeatable).
    #[arg(long = "param", value_name = "NAME=JSON", value_parser = parse_param)]
    pub params: Vec<(String, serde_json::Value)>,
}

fn parse_param(raw: &str) -> Result<(String, serde_json::Value), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=JSON, got '{raw}'"))?;
    if name.is_empty() {
        return Err(format!("missing parameter name in '{raw}'"));
    }
    let value = serde_json::from_str(value).map_err(|e| format!("parameter {name}: {e}"))?;
    Ok((name.to_string(), value))
}
