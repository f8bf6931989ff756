// `courier listen`: optionally subscribe to topics, then print every push.

use anyhow::Context;
use clap::Args;
use serde_json::json;

use courier_cli::client::{nop_on_conn_error, Client, ClientError};
use courier_cli::output;

use super::TargetArgs;

#[derive(Debug, Args)]
pub struct ListenArgs {
    /// Topic URI to subscribe to first (repeatable)
    #[arg(short = 's', long = "subscribe")]
    topics: Vec<String>,
    #[command(flatten)]
    target: TargetArgs,
}

pub async fn run(args: ListenArgs) -> anyhow::Result<()> {
    let format = args.target.format();
    let client = Client::connect(args.target.options(false), nop_on_conn_error())
        .await
        .with_context(|| format!("failed to connect to {}", args.target.host))?;
    let mut pushes = client.take_pushes();

    for (index, uri) in args.topics.iter().enumerate() {
        client
            .rest_exec(
                &format!("listen-{index}"),
                "POST",
                "/v1/subscriptions",
                Some(json!({ "uri": uri })),
            )
            .await
            .with_context(|| format!("failed to subscribe to {uri}"))?;
        tracing::info!(uri = %uri, "subscribed");
    }

    while let Some(push) = pushes.recv().await {
        output::print_push(format, &push)?;
    }

    Err(ClientError::Disconnected).context("stopped listening")
}
