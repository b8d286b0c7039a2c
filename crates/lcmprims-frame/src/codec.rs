use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::channel::{validate_channel, MAX_CHANNEL_LEN};
use crate::error::{FrameError, Result};

/// Fixed header: magic (4) + sequence (4) + fragment offset (2) +
/// fragment total (2) + channel length (2) = 14 bytes.
pub const HEADER_SIZE: usize = 14;

/// Magic bytes: "LC03".
pub const MAGIC: [u8; 4] = *b"LC03";

/// Largest UDP payload an IPv4 datagram can carry.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Largest payload chunk a single envelope can carry on the given channel.
pub fn max_chunk_for(channel: &str) -> usize {
    MAX_DATAGRAM_SIZE - HEADER_SIZE - channel.len()
}

/// One wire unit: a channel-tagged fragment of a published payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Channel the message was published on.
    pub channel: String,
    /// This fragment's slice of the payload.
    pub payload: Bytes,
    /// Sender-local message sequence number shared by all fragments.
    pub sequence_number: u32,
    /// Index of this fragment, `0..fragment_total`.
    pub fragment_offset: u16,
    /// Number of fragments in the message (at least 1).
    pub fragment_total: u16,
}

impl Envelope {
    /// Create a single-fragment envelope.
    pub fn single(
        channel: impl Into<String>,
        sequence_number: u32,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
            sequence_number,
            fragment_offset: 0,
            fragment_total: 1,
        }
    }

    /// True if the envelope carries a whole message.
    pub fn is_complete_message(&self) -> bool {
        self.fragment_total == 1
    }

    /// The total wire size of this envelope.
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.channel.len() + self.payload.len()
    }
}

/// Encode an envelope into the wire format.
///
/// Wire format (all integers big-endian):
/// ```text
/// ┌───────────┬───────────┬──────────┬──────────┬──────────┬──────────┬───────────────┐
/// │ Magic (4) │ Seq (4)   │ Frag (2) │ Total(2) │ ChLen(2) │ Channel  │ Payload chunk │
/// │ "LC03"    │           │          │          │          │ (ChLen)  │ (rest)        │
/// └───────────┴───────────┴──────────┴──────────┴──────────┴──────────┴───────────────┘
/// ```
pub fn encode_envelope(envelope: &Envelope, dst: &mut BytesMut) -> Result<()> {
    validate_channel(&envelope.channel)?;
    if envelope.fragment_total == 0 || envelope.fragment_offset >= envelope.fragment_total {
        return Err(FrameError::malformed(format!(
            "fragment {} of {} is out of range",
            envelope.fragment_offset, envelope.fragment_total
        )));
    }
    let max = max_chunk_for(&envelope.channel);
    if envelope.payload.len() > max {
        return Err(FrameError::PayloadTooLarge {
            size: envelope.payload.len(),
            max,
        });
    }

    dst.reserve(envelope.wire_size());
    dst.put_slice(&MAGIC);
    dst.put_u32(envelope.sequence_number);
    dst.put_u16(envelope.fragment_offset);
    dst.put_u16(envelope.fragment_total);
    dst.put_u16(envelope.channel.len() as u16);
    dst.put_slice(envelope.channel.as_bytes());
    dst.put_slice(&envelope.payload);
    Ok(())
}

/// Decode one datagram into an envelope.
///
/// The payload shares the datagram's buffer; nothing is copied.
pub fn decode_envelope(datagram: Bytes) -> Result<Envelope> {
    let len = datagram.len();
    parse_envelope(datagram).inspect_err(|err| debug!(len, %err, "rejected envelope"))
}

fn parse_envelope(mut datagram: Bytes) -> Result<Envelope> {
    if datagram.len() < HEADER_SIZE {
        return Err(FrameError::malformed(format!(
            "truncated header ({} bytes, need {HEADER_SIZE})",
            datagram.len()
        )));
    }
    if datagram[0..4] != MAGIC {
        return Err(FrameError::malformed("invalid magic (expected \"LC03\")"));
    }
    datagram.advance(4);

    let sequence_number = datagram.get_u32();
    let fragment_offset = datagram.get_u16();
    let fragment_total = datagram.get_u16();
    let channel_len = datagram.get_u16() as usize;

    if fragment_total == 0 || fragment_offset >= fragment_total {
        return Err(FrameError::malformed(format!(
            "fragment {fragment_offset} of {fragment_total} is out of range"
        )));
    }
    if channel_len == 0 || channel_len > MAX_CHANNEL_LEN {
        return Err(FrameError::malformed(format!(
            "channel length {channel_len} outside 1..={MAX_CHANNEL_LEN}"
        )));
    }
    if datagram.len() < channel_len {
        return Err(FrameError::malformed(format!(
            "truncated channel ({} of {channel_len} bytes)",
            datagram.len()
        )));
    }

    let channel_bytes = datagram.split_to(channel_len);
    let channel = std::str::from_utf8(&channel_bytes)
        .map_err(|_| FrameError::malformed("channel is not valid UTF-8"))?
        .to_string();

    Ok(Envelope {
        channel,
        payload: datagram,
        sequence_number,
        fragment_offset,
        fragment_total,
    })
}

/// Encode a whole message as one envelope (sequence 0, fragment 0 of 1).
pub fn encode(channel: &str, payload: &[u8]) -> Result<Bytes> {
    let envelope = Envelope::single(channel, 0, Bytes::copy_from_slice(payload));
    let mut buf = BytesMut::with_capacity(envelope.wire_size());
    encode_envelope(&envelope, &mut buf)?;
    Ok(buf.freeze())
}

/// Decode a datagram into its channel and payload.
pub fn decode(datagram: &[u8]) -> Result<(String, Bytes)> {
    let envelope = decode_envelope(Bytes::copy_from_slice(datagram))?;
    Ok((envelope.channel, envelope.payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(offset: u16, total: u16) -> Envelope {
        Envelope {
            channel: "robot.pose".to_string(),
            payload: Bytes::from_static(b"chunk"),
            sequence_number: 0xDEAD_BEEF,
            fragment_offset: offset,
            fragment_total: total,
        }
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let bytes = encode("EXAMPLE", b"hello, lcmprims!").unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE + "EXAMPLE".len() + 16);

        let (channel, payload) = decode(&bytes).unwrap();
        assert_eq!(channel, "EXAMPLE");
        assert_eq!(payload.as_ref(), b"hello, lcmprims!");
    }

    #[test]
    fn test_fragment_fields_survive() {
        let mut buf = BytesMut::new();
        encode_envelope(&fragment(2, 3), &mut buf).unwrap();

        let decoded = decode_envelope(buf.freeze()).unwrap();
        assert_eq!(decoded, fragment(2, 3));
        assert!(!decoded.is_complete_message());
    }

    #[test]
    fn test_header_is_big_endian() {
        let mut buf = BytesMut::new();
        encode_envelope(&fragment(1, 2), &mut buf).unwrap();

        assert_eq!(&buf[0..4], b"LC03");
        assert_eq!(&buf[4..8], &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(&buf[8..10], &[0x00, 0x01]);
        assert_eq!(&buf[10..12], &[0x00, 0x02]);
        assert_eq!(&buf[12..14], &[0x00, 10]);
        assert_eq!(&buf[14..24], b"robot.pose");
    }

    #[test]
    fn test_empty_payload() {
        let bytes = encode("EMPTY", b"").unwrap();
        let (channel, payload) = decode(&bytes).unwrap();
        assert_eq!(channel, "EMPTY");
        assert!(payload.is_empty());
    }

    #[test]
    fn test_decode_truncated_header() {
        let result = decode(&[b'L', b'C', b'0', b'3', 0x00]);
        assert!(matches!(result, Err(FrameError::MalformedEnvelope { .. })));
    }

    #[test]
    fn test_decode_invalid_magic() {
        let mut bytes = encode("EXAMPLE", b"x").unwrap().to_vec();
        bytes[0] = b'X';
        let result = decode(&bytes);
        assert!(matches!(result, Err(FrameError::MalformedEnvelope { .. })));
    }

    #[test]
    fn test_decode_channel_length_over_bound() {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u32(1);
        buf.put_u16(0);
        buf.put_u16(1);
        buf.put_u16((MAX_CHANNEL_LEN + 1) as u16);
        buf.put_slice(&[b'a'; MAX_CHANNEL_LEN + 1]);

        let err = decode_envelope(buf.freeze()).unwrap_err();
        assert!(err.to_string().contains("channel length"));
    }

    #[test]
    fn test_decode_channel_truncated() {
        let bytes = encode("robot.pose", b"").unwrap();
        let result = decode(&bytes[..HEADER_SIZE + 4]);
        assert!(matches!(result, Err(FrameError::MalformedEnvelope { .. })));
    }

    #[test]
    fn test_decode_rejects_offset_past_total() {
        let mut bytes = encode("EXAMPLE", b"x").unwrap().to_vec();
        bytes[8..10].copy_from_slice(&[0x00, 0x05]);
        let result = decode(&bytes);
        assert!(matches!(result, Err(FrameError::MalformedEnvelope { .. })));
    }

    #[test]
    fn test_decode_rejects_non_utf8_channel() {
        let mut bytes = encode("ab", b"x").unwrap().to_vec();
        bytes[HEADER_SIZE] = 0xFF;
        let result = decode(&bytes);
        assert!(matches!(result, Err(FrameError::MalformedEnvelope { .. })));
    }

    #[test]
    fn test_encode_rejects_invalid_channel() {
        assert!(matches!(
            encode("foo.*", b"x"),
            Err(FrameError::InvalidChannel { .. })
        ));
        assert!(matches!(
            encode("", b"x"),
            Err(FrameError::InvalidChannel { .. })
        ));
    }

    #[test]
    fn test_encode_rejects_oversized_chunk() {
        let payload = vec![0u8; max_chunk_for("BIG") + 1];
        assert!(matches!(
            encode("BIG", &payload),
            Err(FrameError::PayloadTooLarge { .. })
        ));

        let payload = vec![0u8; max_chunk_for("BIG")];
        assert_eq!(encode("BIG", &payload).unwrap().len(), MAX_DATAGRAM_SIZE);
    }

    #[test]
    fn test_encode_is_deterministic() {
        let a = encode("robot.pose", b"same").unwrap();
        let b = encode("robot.pose", b"same").unwrap();
        assert_eq!(a, b);
    }

    mod properties {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #[test]
            fn any_valid_channel_and_payload_survive(
                channel in "[^*\\p{Cc}]{1,15}",
                payload in proptest::collection::vec(any::<u8>(), 0..4096),
            ) {
                let bytes = encode(&channel, &payload).unwrap();
                prop_assert_eq!(bytes.len(), HEADER_SIZE + channel.len() + payload.len());

                let (decoded_channel, decoded_payload) = decode(&bytes).unwrap();
                prop_assert_eq!(decoded_channel, channel);
                prop_assert_eq!(decoded_payload.as_ref(), &payload[..]);
            }

            #[test]
            fn fragment_headers_survive(
                (fragment_total, fragment_offset) in (1u16..=u16::MAX)
                    .prop_flat_map(|total| (Just(total), 0..total)),
                sequence_number in any::<u32>(),
                channel in "[a-zA-Z0-9_.]{1,63}",
            ) {
                let envelope = Envelope {
                    channel,
                    payload: Bytes::from_static(b"chunk"),
                    sequence_number,
                    fragment_offset,
                    fragment_total,
                };
                let mut buf = BytesMut::new();
                encode_envelope(&envelope, &mut buf).unwrap();
                prop_assert_eq!(decode_envelope(buf.freeze()).unwrap(), envelope);
            }

            #[test]
            fn arbitrary_bytes_never_panic(
                datagram in proptest::collection::vec(any::<u8>(), 0..256),
            ) {
                let _ = decode(&datagram);
            }
        }
    }
}
