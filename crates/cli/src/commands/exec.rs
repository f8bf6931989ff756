// `courier exec`: one request over a fresh connection.

use anyhow::Context;
use clap::Args;
use serde_json::Value;

use courier_cli::client::{nop_on_conn_error, Client};
use courier_cli::output;

use super::{parse_data, TargetArgs};

const SINGLE_RID: &str = "single";

#[derive(Debug, Args)]
pub struct ExecArgs {
    /// Method: get, post, ...
    #[arg(short, long, default_value = "GET")]
    method: String,
    /// Route on the relay
    #[arg(short, long, default_value = "/ping")]
    uri: String,
    /// Request data as a JSON string
    #[arg(short, long)]
    data: Option<String>,
    #[command(flatten)]
    target: TargetArgs,
}

pub async fn run(args: ExecArgs) -> anyhow::Result<()> {
    let format = args.target.format();
    let data = parse_data(args.data.as_deref())?;

    let client = Client::connect(args.target.options(true), nop_on_conn_error())
        .await
        .with_context(|| format!("failed to connect to {}", args.target.host))?;
    let response = client
        .rest_exec(SINGLE_RID, &args.method, &args.uri, Some(data))
        .await
        .with_context(|| format!("{} {} failed", args.method.to_ascii_uppercase(), args.uri))?;

    output::print_output(format, &response.unwrap_or(Value::Null))?;
    Ok(())
}
