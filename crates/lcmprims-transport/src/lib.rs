//! UDP multicast transport for lcmprims.
//!
//! Sends and receives whole messages over a multicast group:
//! - Large payloads are split into fragments that each fit one datagram
//! - Fragments are reassembled per sender with bounded memory and a timeout
//! - Publishing goes through a bounded queue drained by a sender thread
//!
//! [`tcpq`] relays whole messages through a TCP hub where multicast is not
//! available.
//!
//! Delivery is best effort. Loss shows up in [`TransportStats`], never as an
//! error. The [`DatagramSocket`] seam lets the same [`Transport`] run over
//! plain UDP sockets in tests.

pub mod config;
pub mod error;
pub mod fragment;
pub mod reassembly;
mod sender;
mod stats;
pub mod tcpq;
pub mod traits;
pub mod transport;
pub mod udpm;

pub use config::{
    PublishMode, ReassemblyConfig, TransportConfig, DEFAULT_FRAGMENT_SIZE, DEFAULT_GROUP,
    DEFAULT_PORT, MAX_FRAGMENT_SIZE,
};
pub use error::{Result, TransportError};
pub use reassembly::{CompletedMessage, Reassembler, ReassemblyStats};
pub use stats::TransportStats;
pub use tcpq::{HubStats, TcpHub, TcpqClient, TcpqConfig, DEFAULT_TCPQ_PORT};
pub use traits::DatagramSocket;
pub use transport::{now_utime, Delivery, Transport};
pub use udpm::MulticastSocket;
