use std::fmt;
use std::io;

use lcmprims::log::LogError;
use lcmprims::transport::TransportError;
use lcmprims::LcmError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const HEALTH_CHECK_FAILED: i32 = 30;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::NotFound => USAGE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Io(source) => io_error(context, source),
        TransportError::Bind { .. }
        | TransportError::JoinGroup { .. }
        | TransportError::Connect { .. }
        | TransportError::Disconnected { .. } => {
            CliError::new(TRANSPORT_ERROR, format!("{context}: {err}"))
        }
        TransportError::Frame(_) | TransportError::PayloadTooLarge { .. } => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        TransportError::InvalidConfig(_) => CliError::new(USAGE, format!("{context}: {err}")),
        TransportError::WouldBlock => CliError::new(TIMEOUT, format!("{context}: {err}")),
        TransportError::Closed => CliError::new(FAILURE, format!("{context}: {err}")),
    }
}

pub fn log_error(context: &str, err: LogError) -> CliError {
    match err {
        LogError::Io { source, .. } => io_error(context, source),
        LogError::UnsupportedFormat { .. }
        | LogError::Corrupt { .. }
        | LogError::Channel(_)
        | LogError::PayloadTooLarge { .. } => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        LogError::InvalidConfig(_) => CliError::new(USAGE, format!("{context}: {err}")),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

pub fn lcm_error(context: &str, err: LcmError) -> CliError {
    match err {
        LcmError::InvalidUrl { .. } => CliError::new(USAGE, format!("{context}: {err}")),
        LcmError::Transport(err) => transport_error(context, err),
        LcmError::Log(err) => log_error(context, err),
        LcmError::Router(_) => CliError::new(USAGE, format!("{context}: {err}")),
        LcmError::Unsupported(_) => CliError::new(USAGE, format!("{context}: {err}")),
        LcmError::Exhausted | LcmError::Closed => {
            CliError::new(FAILURE, format!("{context}: {err}"))
        }
    }
}
