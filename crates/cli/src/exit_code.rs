// Exit codes for the courier CLI.
//
//   0  = success
//   1  = general error
//   2  = usage/argument error
//   10 = relay not reachable
//   11 = authentication error
//   12 = request rejected by the relay
//   13 = network error or timeout

use std::process;

use courier_common::error::ErrorCode;

use crate::client::ClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    Error = 1,
    Usage = 2,
    Unreachable = 10,
    Auth = 11,
    Rejected = 12,
    Network = 13,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Map an anyhow error to an exit code by inspecting the error chain.
    pub fn from_error(err: &anyhow::Error) -> Self {
        for cause in err.chain() {
            if let Some(client_err) = cause.downcast_ref::<ClientError>() {
                return Self::from_client_error(client_err);
            }
            if let Some(io_err) = cause.downcast_ref::<std::io::Error>() {
                return match io_err.kind() {
                    std::io::ErrorKind::ConnectionRefused => Self::Unreachable,
                    std::io::ErrorKind::TimedOut => Self::Network,
                    _ => Self::Error,
                };
            }
        }
        Self::Error
    }

    pub fn from_client_error(err: &ClientError) -> Self {
        match err {
            ClientError::InvalidHost(_) | ClientError::InvalidCredentials => Self::Usage,
            ClientError::Connect(_) => Self::Unreachable,
            ClientError::Server(_) => Self::from_wire_code(err.code()),
            _ => match err.code() {
                ErrorCode::NetAccess | ErrorCode::Timeout => Self::Network,
                _ => Self::Error,
            },
        }
    }

    /// Exit code for an error the relay returned in an envelope.
    pub fn from_wire_code(code: ErrorCode) -> Self {
        match code {
            ErrorCode::InvalidToken | ErrorCode::InvalidPerm | ErrorCode::InvalidSession => {
                Self::Auth
            }
            ErrorCode::Timeout | ErrorCode::NetAccess => Self::Network,
            _ => Self::Rejected,
        }
    }

    pub fn exit(self) -> ! {
        process::exit(self.code())
    }
}

impl From<ExitCode> for process::ExitCode {
    fn from(code: ExitCode) -> Self {
        process::ExitCode::from(code.code() as u8)
    }
}
