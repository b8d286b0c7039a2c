//! Length-prefixed messages for stream connections.
//!
//! A TCP relay carries whole messages, so there is no fragmentation:
//!
//! ```text
//! hello:   magic u32 | version u32                 (each side, once)
//! message: type u32 | chan len u32 | channel | payload len u32 | payload
//! ```
//!
//! All integers are big-endian. The hub sends its hello first.

use std::io::{ErrorKind, Read, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::channel::{validate_channel, MAX_CHANNEL_LEN};
use crate::error::{FrameError, Result};

/// Hello magic sent by the hub.
pub const HUB_MAGIC: u32 = 0x2876_17fa;

/// Hello magic sent by a client.
pub const CLIENT_MAGIC: u32 = 0x2876_17fb;

/// Stream protocol version.
pub const STREAM_VERSION: u32 = 0x0100;

/// The only message type on the stream.
pub const MESSAGE_PUBLISH: u32 = 1;

/// Default cap on one streamed payload.
pub const DEFAULT_MAX_STREAM_PAYLOAD: usize = 64 * 1024 * 1024;

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// One whole message read from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    pub channel: String,
    pub payload: Bytes,
}

/// Append one message to `dst`.
pub fn encode_stream_message(
    channel: &str,
    payload: &[u8],
    max_payload: usize,
    dst: &mut BytesMut,
) -> Result<()> {
    validate_channel(channel)?;
    if payload.len() > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: max_payload,
        });
    }

    dst.reserve(12 + channel.len() + payload.len());
    dst.put_u32(MESSAGE_PUBLISH);
    dst.put_u32(channel.len() as u32);
    dst.put_slice(channel.as_bytes());
    dst.put_u32(payload.len() as u32);
    dst.put_slice(payload);
    Ok(())
}

/// Take one message off the front of `src`, or `Ok(None)` if it is not all
/// there yet.
pub fn decode_stream_message(
    src: &mut BytesMut,
    max_payload: usize,
) -> Result<Option<StreamMessage>> {
    if src.len() < 8 {
        return Ok(None);
    }
    let message_type = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
    if message_type != MESSAGE_PUBLISH {
        return Err(FrameError::malformed(format!(
            "unknown stream message type {message_type}"
        )));
    }
    let channel_len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
    if channel_len == 0 || channel_len > MAX_CHANNEL_LEN {
        return Err(FrameError::malformed(format!(
            "channel length {channel_len} outside 1..={MAX_CHANNEL_LEN}"
        )));
    }

    let payload_len_at = 8 + channel_len;
    if src.len() < payload_len_at + 4 {
        return Ok(None);
    }
    let payload_len = u32::from_be_bytes([
        src[payload_len_at],
        src[payload_len_at + 1],
        src[payload_len_at + 2],
        src[payload_len_at + 3],
    ]) as usize;
    if payload_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }
    let total = payload_len_at + 4 + payload_len;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }

    src.advance(8);
    let channel_bytes = src.split_to(channel_len);
    let channel = std::str::from_utf8(&channel_bytes)
        .map_err(|_| FrameError::malformed("channel is not valid UTF-8"))?
        .to_string();
    src.advance(4);
    let payload = src.split_to(payload_len).freeze();

    Ok(Some(StreamMessage { channel, payload }))
}

/// Write this side's hello.
pub fn send_hello<W: Write>(stream: &mut W, magic: u32) -> Result<()> {
    let mut hello = [0u8; 8];
    hello[..4].copy_from_slice(&magic.to_be_bytes());
    hello[4..].copy_from_slice(&STREAM_VERSION.to_be_bytes());
    stream.write_all(&hello)?;
    stream.flush()?;
    Ok(())
}

/// Read the peer's hello and check it. Returns the peer's version.
pub fn expect_hello<R: Read>(stream: &mut R, magic: u32) -> Result<u32> {
    let mut hello = [0u8; 8];
    stream.read_exact(&mut hello).map_err(|err| match err.kind() {
        ErrorKind::UnexpectedEof => FrameError::ConnectionClosed,
        _ => FrameError::Io(err),
    })?;

    let got = u32::from_be_bytes([hello[0], hello[1], hello[2], hello[3]]);
    if got != magic {
        return Err(FrameError::Handshake(format!(
            "bad magic {got:#010x}, expected {magic:#010x}"
        )));
    }
    let version = u32::from_be_bytes([hello[4], hello[5], hello[6], hello[7]]);
    if version >> 8 != STREAM_VERSION >> 8 {
        return Err(FrameError::Handshake(format!(
            "protocol version {version:#06x} not supported"
        )));
    }
    Ok(version)
}

/// Reads whole messages from any `Read` stream.
///
/// Partial reads are buffered. With a read timeout set on the underlying
/// socket, [`read_message`](Self::read_message) returns `Ok(None)` when the
/// timeout passes and keeps what it has for the next call.
pub struct StreamReader<T> {
    inner: T,
    buf: BytesMut,
    max_payload: usize,
}

impl<T: Read> StreamReader<T> {
    pub fn new(inner: T) -> Self {
        Self::with_max_payload(inner, DEFAULT_MAX_STREAM_PAYLOAD)
    }

    pub fn with_max_payload(inner: T, max_payload: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK_SIZE),
            max_payload,
        }
    }

    /// Read the next message. `Err(ConnectionClosed)` at end of stream.
    pub fn read_message(&mut self) -> Result<Option<StreamMessage>> {
        loop {
            if let Some(message) = decode_stream_message(&mut self.buf, self.max_payload)? {
                return Ok(Some(message));
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(None)
                }
                Err(err) => return Err(FrameError::Io(err)),
            };
            if read == 0 {
                return Err(FrameError::ConnectionClosed);
            }
            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }
}

/// Writes whole messages to any `Write` stream.
///
/// A failed write may leave part of a message on the stream; the
/// connection is out of step after any error and should be dropped.
pub struct StreamWriter<T> {
    inner: T,
    buf: BytesMut,
    max_payload: usize,
}

impl<T: Write> StreamWriter<T> {
    pub fn new(inner: T) -> Self {
        Self::with_max_payload(inner, DEFAULT_MAX_STREAM_PAYLOAD)
    }

    pub fn with_max_payload(inner: T, max_payload: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK_SIZE),
            max_payload,
        }
    }

    /// Encode and write one message, then flush.
    pub fn send(&mut self, channel: &str, payload: &[u8]) -> Result<()> {
        self.buf.clear();
        encode_stream_message(channel, payload, self.max_payload, &mut self.buf)?;

        let mut offset = 0usize;
        while offset < self.buf.len() {
            match self.inner.write(&self.buf[offset..]) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }

        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn wire(messages: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for (channel, payload) in messages {
            encode_stream_message(channel, payload, DEFAULT_MAX_STREAM_PAYLOAD, &mut buf).unwrap();
        }
        buf.to_vec()
    }

    #[test]
    fn layout_is_big_endian() {
        let bytes = wire(&[("AB", b"xyz")]);
        assert_eq!(
            bytes,
            [0, 0, 0, 1, 0, 0, 0, 2, b'A', b'B', 0, 0, 0, 3, b'x', b'y', b'z']
        );
    }

    #[test]
    fn reader_returns_messages_in_order() {
        let bytes = wire(&[("robot.pose", b"one"), ("imu", b""), ("robot.pose", b"three")]);
        let mut reader = StreamReader::new(Cursor::new(bytes));

        let got: Vec<_> = (0..3)
            .map(|_| reader.read_message().unwrap().unwrap())
            .collect();
        assert_eq!(got[0].channel, "robot.pose");
        assert!(got[1].payload.is_empty());
        assert_eq!(got[2].payload.as_ref(), b"three");
        assert!(matches!(
            reader.read_message(),
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[test]
    fn partial_message_waits_for_more() {
        let bytes = wire(&[("CH", b"payload")]);
        let mut buf = BytesMut::new();
        for byte in &bytes[..bytes.len() - 1] {
            buf.put_u8(*byte);
            assert!(decode_stream_message(&mut buf, 1024).unwrap().is_none());
        }
        buf.put_u8(bytes[bytes.len() - 1]);
        let message = decode_stream_message(&mut buf, 1024).unwrap().unwrap();
        assert_eq!(message.payload.as_ref(), b"payload");
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_and_unknown_messages_rejected() {
        let mut buf = BytesMut::from(&wire(&[("CH", &[0u8; 64])])[..]);
        assert!(matches!(
            decode_stream_message(&mut buf, 16),
            Err(FrameError::PayloadTooLarge { size: 64, max: 16 })
        ));

        let mut buf = BytesMut::from(&[0u8, 0, 0, 9, 0, 0, 0, 1][..]);
        assert!(matches!(
            decode_stream_message(&mut buf, 16),
            Err(FrameError::MalformedEnvelope { .. })
        ));
    }

    #[test]
    fn writer_rejects_invalid_channel() {
        let mut writer = StreamWriter::new(Vec::new());
        assert!(matches!(
            writer.send("a.*", b"x"),
            Err(FrameError::InvalidChannel { .. })
        ));
        writer.send("a.b", b"x").unwrap();
        assert_eq!(writer.get_ref().len(), 12 + 3 + 1);
    }

    #[test]
    fn hello_roundtrip_and_mismatch() {
        let mut wire = Vec::new();
        send_hello(&mut wire, HUB_MAGIC).unwrap();
        assert_eq!(
            expect_hello(&mut Cursor::new(&wire), HUB_MAGIC).unwrap(),
            STREAM_VERSION
        );
        assert!(matches!(
            expect_hello(&mut Cursor::new(&wire), CLIENT_MAGIC),
            Err(FrameError::Handshake(_))
        ));
        assert!(matches!(
            expect_hello(&mut Cursor::new(&wire[..5]), HUB_MAGIC),
            Err(FrameError::ConnectionClosed)
        ));
    }
}
