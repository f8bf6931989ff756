// CLI subcommand dispatch.

use anyhow::Context;
use clap::{builder::BoolishValueParser, ArgAction, Args, Subcommand};
use serde_json::Value;

use courier_cli::client::{ClientOptions, Credentials};
use courier_cli::output::OutputFormat;

pub mod exec;
pub mod listen;
pub mod shell;

#[derive(Subcommand)]
pub enum Command {
    /// Send one request and print the response
    Exec(exec::ExecArgs),
    /// Interactive request shell
    Shell(shell::ShellArgs),
    /// Print pushes until the connection drops
    Listen(listen::ListenArgs),
}

pub async fn run(cmd: Command) -> anyhow::Result<()> {
    match cmd {
        Command::Exec(args) => exec::run(args).await,
        Command::Shell(args) => shell::run(args).await,
        Command::Listen(args) => listen::run(args).await,
    }
}

/// Where to connect and as whom.
#[derive(Debug, Args)]
pub struct TargetArgs {
    /// Relay address, `host[:port]`
    #[arg(env = "COURIER_HOST")]
    pub host: String,
    /// <user-id>:<session-id>:<access-token>
    #[arg(short = 'c', long, env = "COURIER_CREDENTIALS", hide_env_values = true)]
    pub credentials: Credentials,
    /// Connect with wss:// (false for ws://)
    #[arg(
        long,
        env = "COURIER_SECURE",
        default_value_t = true,
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new()
    )]
    pub secure: bool,
    /// Force JSON output
    #[arg(long)]
    pub json: bool,
}

impl TargetArgs {
    pub fn options(&self, once: bool) -> ClientOptions {
        ClientOptions::new(self.host.clone(), self.credentials.clone())
            .secure(self.secure)
            .once(once)
    }

    pub fn format(&self) -> OutputFormat {
        OutputFormat::detect(self.json)
    }
}

/// Request body from the command line. Absent or blank means `{}`.
pub fn parse_data(raw: Option<&str>) -> anyhow::Result<Value> {
    match raw.map(str::trim) {
        None | Some("") => Ok(Value::Object(Default::default())),
        Some(raw) => serde_json::from_str(raw).context("request data is not valid JSON"),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::parse_data;

    #[test]
    fn missing_data_is_an_empty_object() {
        assert_eq!(parse_data(None).expect("should parse"), json!({}));
        assert_eq!(parse_data(Some("  ")).expect("should parse"), json!({}));
    }

    #[test]
    fn data_must_be_json() {
        assert_eq!(
            parse_data(Some(r#"{"uri":"t:1"}"#)).expect("should parse"),
            json!({"uri": "t:1"})
        );
        assert!(parse_data(Some("{uri")).is_err());
    }
}
