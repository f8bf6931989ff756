// Output format auto-detection for the CLI.
//
// TTY → indented JSON for people. Piped/redirected → one compact JSON value
// per line. `--json` forces the compact form regardless of terminal.

use std::io::{self, IsTerminal, Write};

use courier_common::error::ErrorCode;
use serde::Serialize;

use crate::client::ClientError;

const ANSI_RED: &str = "\x1b[31m";
const ANSI_CYAN: &str = "\x1b[36m";
const ANSI_RESET: &str = "\x1b[0m";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Human,
    Json,
}

impl OutputFormat {
    /// JSON if `--json` was passed or stdout is not a TTY.
    pub fn detect(json_flag: bool) -> Self {
        if json_flag {
            return Self::Json;
        }
        Self::detect_from_terminal(io::stdout().is_terminal())
    }

    pub fn detect_from_terminal(is_tty: bool) -> Self {
        if is_tty {
            Self::Human
        } else {
            Self::Json
        }
    }
}

pub fn print_output<T: Serialize + ?Sized>(format: OutputFormat, value: &T) -> io::Result<()> {
    write_output(&mut io::stdout().lock(), format, value)
}

pub fn write_output<W, T>(writer: &mut W, format: OutputFormat, value: &T) -> io::Result<()>
where
    W: Write,
    T: Serialize + ?Sized,
{
    match format {
        OutputFormat::Human => serde_json::to_writer_pretty(&mut *writer, value),
        OutputFormat::Json => serde_json::to_writer(&mut *writer, value),
    }
    .map_err(io::Error::other)?;
    writeln!(writer)
}

/// A push, prefixed so it stands apart from responses in an interactive shell.
pub fn print_push<T: Serialize + ?Sized>(format: OutputFormat, value: &T) -> io::Result<()> {
    let mut out = io::stdout().lock();
    if format == OutputFormat::Human {
        let label = render_label("push", out.is_terminal(), ANSI_CYAN);
        write!(out, "{label} ")?;
    }
    write_output(&mut out, format, value)
}

pub fn print_error(format: OutputFormat, code: ErrorCode, message: &str) {
    let mut err = io::stderr().lock();
    let _ = write_error(&mut err, format, code, message, io::stderr().is_terminal());
}

fn write_error<W: Write>(
    writer: &mut W,
    format: OutputFormat,
    code: ErrorCode,
    message: &str,
    is_tty: bool,
) -> io::Result<()> {
    match format {
        OutputFormat::Human => {
            let label = render_label("error", is_tty, ANSI_RED);
            writeln!(writer, "{label} {message} (code {})", code.code())
        }
        OutputFormat::Json => {
            let obj = serde_json::json!({
                "error": {
                    "code": code.code(),
                    "message": message,
                }
            });
            serde_json::to_writer(&mut *writer, &obj).map_err(io::Error::other)?;
            writeln!(writer)
        }
    }
}

/// Print a command failure, using the registry code of a client error when
/// one is in the chain.
pub fn print_anyhow_error(format: OutputFormat, error: &anyhow::Error) {
    let code = error
        .chain()
        .find_map(|cause| cause.downcast_ref::<ClientError>())
        .map(ClientError::code)
        .unwrap_or(ErrorCode::Internal);
    print_error(format, code, &format!("{error:#}"));
}

fn render_label(label: &str, is_tty: bool, color: &str) -> String {
    if is_tty {
        format!("{color}{label}:{ANSI_RESET}")
    } else {
        format!("{label}:")
    }
}
