//! Tokio codec adapter for envelope datagrams.
//!
//! Each datagram handed to the decoder is exactly one envelope, so the
//! decoder consumes the whole buffer. Pair with `tokio_util::udp::UdpFramed`.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::{decode_envelope, encode_envelope, Envelope};
use crate::error::FrameError;

/// Datagram codec for [`Envelope`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeCodec;

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        let datagram = src.split().freeze();
        decode_envelope(datagram).map(Some)
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_envelope(&item, dst)
    }
}
