use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use lcmprims_frame::{HEADER_SIZE, MAX_CHANNEL_LEN, MAX_DATAGRAM_SIZE};

use crate::error::{Result, TransportError};

/// Default multicast group.
pub const DEFAULT_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 76, 67);

/// Default multicast port.
pub const DEFAULT_PORT: u16 = 7667;

/// Default payload bytes per datagram. Keeps a worst-case envelope inside a
/// 1500-byte Ethernet MTU.
pub const DEFAULT_FRAGMENT_SIZE: usize = 1350;

/// Largest configurable fragment size: any channel still fits in one datagram.
pub const MAX_FRAGMENT_SIZE: usize = MAX_DATAGRAM_SIZE - HEADER_SIZE - MAX_CHANNEL_LEN;

/// What `publish` does when the send queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublishMode {
    /// Wait for room in the queue.
    #[default]
    Block,
    /// Return `TransportError::WouldBlock` immediately.
    FailFast,
}

/// Bounds on the reassembly buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReassemblyConfig {
    /// Incomplete messages older than this are discarded.
    pub timeout: Duration,
    /// Maximum number of incomplete messages held at once.
    pub max_pending_messages: usize,
    /// Maximum payload bytes held across all incomplete messages.
    pub max_pending_bytes: usize,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            max_pending_messages: 256,
            max_pending_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Configuration for a multicast transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Multicast group to join and publish to.
    pub group: Ipv4Addr,
    /// UDP port shared by every participant.
    pub port: u16,
    /// Multicast time-to-live. 0 keeps traffic on this host.
    pub ttl: u32,
    /// Local interface used to join the group. Unspecified lets the OS pick.
    pub interface: Ipv4Addr,
    /// Requested `SO_RCVBUF`, or the OS default when `None`.
    pub recv_buffer_size: Option<usize>,
    /// Payload bytes per datagram; larger payloads are fragmented.
    pub fragment_size: usize,
    /// Reassembly buffer limits.
    pub reassembly: ReassemblyConfig,
    /// Messages the send queue holds before `publish` blocks or fails.
    pub send_queue_capacity: usize,
    /// Behavior when the send queue is full.
    pub publish_mode: PublishMode,
    /// Upper bound on one blocking socket read.
    pub poll_interval: Duration,
    /// Deliver our own publications back to this host.
    pub loopback: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            group: DEFAULT_GROUP,
            port: DEFAULT_PORT,
            ttl: 0,
            interface: Ipv4Addr::UNSPECIFIED,
            recv_buffer_size: None,
            fragment_size: DEFAULT_FRAGMENT_SIZE,
            reassembly: ReassemblyConfig::default(),
            send_queue_capacity: 1024,
            publish_mode: PublishMode::Block,
            poll_interval: Duration::from_millis(100),
            loopback: true,
        }
    }
}

impl TransportConfig {
    /// The group address datagrams are sent to.
    pub fn group_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.group, self.port)
    }

    /// Reject configurations the transport cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !self.group.is_multicast() {
            return Err(TransportError::InvalidConfig(format!(
                "{} is not a multicast address",
                self.group
            )));
        }
        if self.ttl > 255 {
            return Err(TransportError::InvalidConfig(format!(
                "ttl {} exceeds 255",
                self.ttl
            )));
        }
        self.validate_local()
    }

    /// Checks that apply to any socket, multicast or not.
    pub(crate) fn validate_local(&self) -> Result<()> {
        if self.fragment_size == 0 || self.fragment_size > MAX_FRAGMENT_SIZE {
            return Err(TransportError::InvalidConfig(format!(
                "fragment size {} outside 1..={MAX_FRAGMENT_SIZE}",
                self.fragment_size
            )));
        }
        if self.send_queue_capacity == 0 {
            return Err(TransportError::InvalidConfig(
                "send queue capacity must be at least 1".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(TransportError::InvalidConfig(
                "poll interval must be greater than zero".to_string(),
            ));
        }
        if self.reassembly.max_pending_messages == 0 {
            return Err(TransportError::InvalidConfig(
                "reassembly buffer must hold at least one message".to_string(),
            ));
        }
        Ok(())
    }
}
