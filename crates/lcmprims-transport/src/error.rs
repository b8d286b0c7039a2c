use std::net::{Ipv4Addr, SocketAddr};

use lcmprims_frame::FrameError;

/// Errors that can occur in multicast transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to bind the socket to the specified address.
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// Failed to join the multicast group.
    #[error("failed to join multicast group {group}: {source}")]
    JoinGroup {
        group: Ipv4Addr,
        source: std::io::Error,
    },

    /// Failed to connect to a relay hub.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// The relay hub closed the connection.
    #[error("disconnected from {peer}")]
    Disconnected { peer: SocketAddr },

    /// An I/O error occurred on the socket.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The message could not be framed.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// The payload needs more fragments than the envelope can number.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The send queue is full and the transport is configured not to block.
    #[error("send queue full")]
    WouldBlock,

    /// The configuration is unusable.
    #[error("invalid transport config: {0}")]
    InvalidConfig(String),

    /// The transport has been closed.
    #[error("transport closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, TransportError>;
