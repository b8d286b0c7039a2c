//! On-disk layout of an event log.
//!
//! ```text
//! ┌──────────────────────┬───────────┐
//! │ magic "LCMPLOG\0"    │ version   │   file header, 12 bytes
//! │ 8 bytes              │ u32 (BE)  │
//! └──────────────────────┴───────────┘
//! ┌───────────┬───────────┬─────────┬─────────────┬─────────┬──────────────┐
//! │ timestamp │ chan len  │ channel │ payload len │ payload │ event number │
//! │ i64 (BE)  │ u32 (BE)  │ N bytes │ u32 (BE)    │ M bytes │ u64 (BE)     │
//! └───────────┴───────────┴─────────┴─────────────┴─────────┴──────────────┘
//! ```
//!
//! Records follow the header back to back. Timestamps are microseconds since
//! the Unix epoch. Event numbers strictly increase through the file.

use std::io::{self, Read};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use lcmprims_frame::MAX_CHANNEL_LEN;

/// Log file magic.
pub const LOG_MAGIC: [u8; 8] = *b"LCMPLOG\0";

/// Log format version written by this crate.
pub const LOG_VERSION: u32 = 1;

/// File header size in bytes.
pub const HEADER_LEN: u64 = 12;

/// Fixed bytes per record besides channel and payload.
pub const RECORD_OVERHEAD: usize = 8 + 4 + 4 + 8;

/// Largest payload a record can hold.
pub const MAX_RECORD_PAYLOAD: usize = u32::MAX as usize;

/// One captured message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub event_number: u64,
    /// Microseconds since the Unix epoch.
    pub timestamp: i64,
    pub channel: String,
    pub payload: Bytes,
}

impl LogEvent {
    /// Encoded record size.
    pub fn record_len(&self) -> usize {
        RECORD_OVERHEAD + self.channel.len() + self.payload.len()
    }
}

pub(crate) fn encode_header(dst: &mut BytesMut) {
    dst.reserve(HEADER_LEN as usize);
    dst.put_slice(&LOG_MAGIC);
    dst.put_u32(LOG_VERSION);
}

/// Check a file header. Returns the reason it is rejected.
pub(crate) fn check_header(header: &[u8]) -> std::result::Result<(), String> {
    if header.len() < HEADER_LEN as usize {
        return Err(format!("header is {} bytes, expected {HEADER_LEN}", header.len()));
    }
    if header[..8] != LOG_MAGIC {
        return Err("bad magic".to_string());
    }
    let version = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);
    if version != LOG_VERSION {
        return Err(format!("version {version}, expected {LOG_VERSION}"));
    }
    Ok(())
}

/// Encode one record. Channel and payload limits are checked by the writer.
pub(crate) fn encode_record(
    event_number: u64,
    timestamp: i64,
    channel: &str,
    payload: &[u8],
    dst: &mut BytesMut,
) {
    dst.reserve(RECORD_OVERHEAD + channel.len() + payload.len());
    dst.put_i64(timestamp);
    dst.put_u32(channel.len() as u32);
    dst.put_slice(channel.as_bytes());
    dst.put_u32(payload.len() as u32);
    dst.put_slice(payload);
    dst.put_u64(event_number);
}

/// Result of reading the record at the current position.
#[derive(Debug)]
pub(crate) enum RecordRead {
    Event { event: LogEvent, len: u64 },
    /// Clean end of log.
    End,
    /// The remaining bytes hold only part of a record.
    Truncated,
    /// The bytes cannot be a record.
    Invalid(String),
}

/// Read one record from `src`, which has `available` bytes left in the file.
///
/// Lengths are checked against `available` before anything is allocated, so
/// a corrupt length never triggers a huge read.
pub(crate) fn read_record<R: Read>(src: &mut R, available: u64) -> io::Result<RecordRead> {
    if available == 0 {
        return Ok(RecordRead::End);
    }

    let mut fixed = [0u8; 12];
    if available < fixed.len() as u64 {
        return Ok(RecordRead::Truncated);
    }
    src.read_exact(&mut fixed)?;
    let mut fields = &fixed[..];
    let timestamp = fields.get_i64();
    let channel_len = fields.get_u32() as u64;

    if channel_len == 0 || channel_len > MAX_CHANNEL_LEN as u64 {
        return Ok(RecordRead::Invalid(format!(
            "channel length {channel_len} out of range"
        )));
    }

    let mut consumed = fixed.len() as u64;
    if available < consumed + channel_len + 4 {
        return Ok(RecordRead::Truncated);
    }
    let mut channel = vec![0u8; channel_len as usize];
    src.read_exact(&mut channel)?;
    let mut len = [0u8; 4];
    src.read_exact(&mut len)?;
    let payload_len = u32::from_be_bytes(len) as u64;
    consumed += channel_len + 4;

    if available < consumed + payload_len + 8 {
        return Ok(RecordRead::Truncated);
    }
    let mut payload = vec![0u8; payload_len as usize];
    src.read_exact(&mut payload)?;
    let mut number = [0u8; 8];
    src.read_exact(&mut number)?;
    consumed += payload_len + 8;

    let channel = match String::from_utf8(channel) {
        Ok(channel) => channel,
        Err(_) => return Ok(RecordRead::Invalid("channel is not UTF-8".to_string())),
    };

    Ok(RecordRead::Event {
        event: LogEvent {
            event_number: u64::from_be_bytes(number),
            timestamp,
            channel,
            payload: Bytes::from(payload),
        },
        len: consumed,
    })
}
