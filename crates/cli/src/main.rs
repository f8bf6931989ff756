// courier CLI entry point.

use std::process;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use courier_cli::exit_code::ExitCode;
use courier_cli::output::{self, OutputFormat};

mod commands;

#[derive(Parser)]
#[command(name = "courier", about = "Talk to a courier relay over its WebSocket protocol")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: commands::Command,
}

#[tokio::main]
async fn main() -> process::ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    match commands::run(cli.command).await {
        Ok(()) => ExitCode::Success.into(),
        Err(error) => {
            output::print_anyhow_error(OutputFormat::detect(false), &error);
            ExitCode::from_error(&error).into()
        }
    }
}
