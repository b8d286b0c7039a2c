//! Append-only, seekable event log for lcmprims.
//!
//! - [`LogWriter`] appends timestamped, numbered records
//! - [`LogReader`] reads them back in order and seeks by timestamp
//! - [`Player`] replays a log into a [`Router`](lcmprims_router::Router)
//! - [`Recorder`] is a router handler that captures traffic to a log
//!
//! See [`format`] for the file layout.

pub mod error;
pub mod format;
pub mod player;
pub mod reader;
pub mod recorder;
pub mod writer;

pub use error::{LogError, Result};
pub use format::{LogEvent, HEADER_LEN, LOG_MAGIC, LOG_VERSION};
pub use player::{PlaybackMode, PlaybackSummary, Player};
pub use reader::LogReader;
pub use recorder::Recorder;
pub use writer::{LogConfig, LogWriter};
