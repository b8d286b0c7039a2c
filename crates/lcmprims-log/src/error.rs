use std::path::{Path, PathBuf};

use lcmprims_frame::FrameError;
use lcmprims_router::RouterError;

/// Errors that can occur reading or writing event logs.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// The log file could not be created, read, or written.
    #[error("log I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The file is not an event log this version understands.
    #[error("unsupported log format in {}: {reason}", path.display())]
    UnsupportedFormat { path: PathBuf, reason: String },

    /// A record in the middle of the log is invalid.
    #[error("corrupt log record at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },

    /// The channel name cannot be stored.
    #[error("invalid channel: {0}")]
    Channel(#[from] FrameError),

    /// The payload does not fit a record's 32-bit length field.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// Playback settings are unusable.
    #[error("invalid playback config: {0}")]
    InvalidConfig(String),

    /// Dispatch into the router failed.
    #[error("router error: {0}")]
    Router(#[from] RouterError),

    /// The writer has been closed.
    #[error("log writer closed")]
    Closed,
}

impl LogError {
    pub(crate) fn io(path: &Path) -> impl FnOnce(std::io::Error) -> Self + '_ {
        move |source| Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, LogError>;
