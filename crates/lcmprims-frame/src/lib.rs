//! Channel-tagged envelope codec for multicast pub/sub.
//!
//! Every datagram on the wire is one envelope:
//! - A 4-byte magic number ("LC03") to reject foreign traffic
//! - A 4-byte sequence number shared by all fragments of one message
//! - 2-byte fragment offset and fragment total
//! - A length-prefixed channel name
//! - The payload chunk, filling the rest of the datagram
//!
//! All integers are big-endian. Fragmentation policy lives in the transport;
//! this crate only describes one envelope.
//!
//! [`stream`] holds the length-prefixed message format used over TCP.

pub mod channel;
pub mod codec;
#[cfg(feature = "async")]
pub mod datagram;
pub mod error;
pub mod stream;

pub use channel::{is_valid_channel, validate_channel, MAX_CHANNEL_LEN, SEPARATOR, WILDCARD};
pub use codec::{
    decode, decode_envelope, encode, encode_envelope, max_chunk_for, Envelope, HEADER_SIZE,
    MAGIC, MAX_DATAGRAM_SIZE,
};
#[cfg(feature = "async")]
pub use datagram::EnvelopeCodec;
pub use error::{FrameError, Result};
pub use stream::{
    decode_stream_message, encode_stream_message, expect_hello, send_hello, StreamMessage,
    StreamReader, StreamWriter, CLIENT_MAGIC, DEFAULT_MAX_STREAM_PAYLOAD, HUB_MAGIC,
    STREAM_VERSION,
};
