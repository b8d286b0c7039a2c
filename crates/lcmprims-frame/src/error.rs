/// Errors that can occur during envelope encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The datagram could not be parsed as an envelope.
    #[error("malformed envelope: {reason}")]
    MalformedEnvelope { reason: String },

    /// The channel name is not acceptable on the wire.
    #[error("invalid channel name {channel:?}: {reason}")]
    InvalidChannel { channel: String, reason: &'static str },

    /// The payload exceeds what a single envelope can carry.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// An I/O error occurred while moving envelopes over a socket.
    #[error("envelope I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed a stream connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// The peer's hello was not acceptable.
    #[error("handshake failed: {0}")]
    Handshake(String),
}

impl FrameError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedEnvelope {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
