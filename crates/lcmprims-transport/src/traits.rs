use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

/// A datagram endpoint the transport sends to and receives from.
///
/// Sends go to the endpoint's fixed destination (the multicast group, or the
/// connected peer). Receives report the sender's address, which the
/// transport uses to namespace fragment sequence numbers.
pub trait DatagramSocket: Send + Sync + 'static {
    /// Send one datagram to the endpoint's destination.
    fn send_datagram(&self, datagram: &[u8]) -> io::Result<usize>;

    /// Receive one datagram, blocking for at most the read timeout.
    fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Set the read timeout used by `recv_datagram`.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// The address other participants see as our sender identity.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Point-to-point UDP: `send_datagram` requires a prior `connect`.
impl DatagramSocket for UdpSocket {
    fn send_datagram(&self, datagram: &[u8]) -> io::Result<usize> {
        self.send(datagram)
    }

    fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.recv_from(buf)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        UdpSocket::set_read_timeout(self, timeout)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// True for the error kinds a timed-out blocking read produces.
pub(crate) fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}
