use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

/// A complete message as seen by subscription handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub channel: String,
    pub payload: Bytes,
    /// Receive time in microseconds since the Unix epoch. For replayed
    /// events this is the timestamp stored in the log.
    pub recv_utime: i64,
    /// Publisher address. `None` for messages replayed from a log.
    pub source: Option<SocketAddr>,
}

impl ReceivedMessage {
    /// Message stamped with the current time and no source.
    pub fn new(channel: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
            recv_utime: now_utime(),
            source: None,
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Current time in microseconds since the Unix epoch.
pub fn now_utime() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}
