// `courier shell`: read commands from stdin and run them over one connection.
// Pushes arriving between commands are printed as they come.

use std::io::Write;

use anyhow::Context;
use clap::Args;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};

use courier_cli::client::{exit_on_conn_error, Client};
use courier_cli::output::{self, OutputFormat};

use super::{parse_data, TargetArgs};

const SHELL_RID: &str = "shell";

const HELP: &str = "\
help                Print this help message
get <uri> [<data>]  Execute GET method
post <uri> [<data>] Execute POST method
ping                Ping server
clear               Clear screen
quit                Quit the shell
";

#[derive(Debug, Args)]
pub struct ShellArgs {
    #[command(flatten)]
    target: TargetArgs,
}

#[derive(Debug, PartialEq, Eq)]
enum ShellCommand<'a> {
    Empty,
    Help,
    Exec { method: &'static str, uri: &'a str, data: Option<&'a str> },
    Clear,
    Quit,
    Invalid(&'a str),
}

impl<'a> ShellCommand<'a> {
    fn parse(line: &'a str) -> Self {
        let (word, rest) = next_word(line);
        match word {
            "" => Self::Empty,
            "help" => Self::Help,
            "ping" => Self::Exec { method: "GET", uri: "/ping", data: None },
            "clear" => Self::Clear,
            "quit" | "exit" => Self::Quit,
            "get" | "post" => {
                let (uri, data) = next_word(rest);
                if uri.is_empty() {
                    return Self::Invalid("missing uri");
                }
                let method = if word == "get" { "GET" } else { "POST" };
                let data = Some(data).filter(|data| !data.is_empty());
                Self::Exec { method, uri, data }
            }
            _ => Self::Invalid("unknown command"),
        }
    }
}

/// Split off the first whitespace-delimited word; the remainder is trimmed.
fn next_word(input: &str) -> (&str, &str) {
    let input = input.trim();
    match input.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (input, ""),
    }
}

pub async fn run(args: ShellArgs) -> anyhow::Result<()> {
    let format = args.target.format();
    let client = Client::connect(args.target.options(false), exit_on_conn_error())
        .await
        .with_context(|| format!("failed to connect to {}", args.target.host))?;
    let mut pushes = client.take_pushes();

    let prompt = format!("{}> ", args.target.host);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        show_prompt(&prompt)?;
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read command")? else {
                    break;
                };
                match ShellCommand::parse(&line) {
                    ShellCommand::Empty => {}
                    ShellCommand::Help => print!("{HELP}"),
                    ShellCommand::Clear => print!("\x1b[2J\x1b[H"),
                    ShellCommand::Quit => break,
                    ShellCommand::Invalid(reason) => {
                        println!("Invalid syntax ({reason}): type 'help'")
                    }
                    ShellCommand::Exec { method, uri, data } => {
                        exec(&client, format, method, uri, data).await?;
                    }
                }
            }
            Some(push) = pushes.recv() => {
                println!();
                output::print_push(format, &push)?;
            }
        }
    }

    client.close().await;
    Ok(())
}

async fn exec(
    client: &Client,
    format: OutputFormat,
    method: &str,
    uri: &str,
    data: Option<&str>,
) -> anyhow::Result<()> {
    let data = match parse_data(data) {
        Ok(data) => data,
        Err(error) => {
            println!("{error:#}");
            return Ok(());
        }
    };
    match client.rest_exec(SHELL_RID, method, uri, Some(data)).await {
        Ok(response) => output::print_output(format, &response.unwrap_or(Value::Null))?,
        Err(error) => output::print_error(format, error.code(), &error.to_string()),
    }
    Ok(())
}

fn show_prompt(prompt: &str) -> std::io::Result<()> {
    let mut out = std::io::stdout().lock();
    write!(out, "{prompt}")?;
    out.flush()
}
