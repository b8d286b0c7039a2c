use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;

use tracing::{debug, info};

use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::traits::DatagramSocket;

/// UDP multicast endpoint.
///
/// Receives on a socket bound to the group port with address reuse enabled,
/// so every participant on a host can share the port. Sends from a second,
/// ephemeral-port socket: its address is this process's sender identity and
/// keeps fragment sequence numbers from colliding between processes.
pub struct MulticastSocket {
    recv: UdpSocket,
    send: UdpSocket,
    group: SocketAddrV4,
    interface: Ipv4Addr,
}

impl MulticastSocket {
    /// Bind, join the configured group, and prepare the send socket.
    pub fn bind(config: &TransportConfig) -> Result<Self> {
        config.validate()?;

        let recv_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port);
        let recv = bind_shared(recv_addr, config.recv_buffer_size).map_err(|source| {
            TransportError::Bind {
                addr: recv_addr.into(),
                source,
            }
        })?;
        recv.join_multicast_v4(&config.group, &config.interface)
            .map_err(|source| TransportError::JoinGroup {
                group: config.group,
                source,
            })?;

        let send_addr = SocketAddrV4::new(config.interface, 0);
        let send = UdpSocket::bind(send_addr).map_err(|source| TransportError::Bind {
            addr: send_addr.into(),
            source,
        })?;
        send.set_multicast_ttl_v4(config.ttl)?;
        send.set_multicast_loop_v4(config.loopback)?;
        if !config.interface.is_unspecified() {
            set_multicast_interface(&send, config.interface)?;
        }

        info!(
            group = %config.group_addr(),
            ttl = config.ttl,
            sender = ?send.local_addr().ok(),
            "joined multicast group"
        );

        Ok(Self {
            recv,
            send,
            group: config.group_addr(),
            interface: config.interface,
        })
    }

    /// The group address datagrams are sent to.
    pub fn group(&self) -> SocketAddrV4 {
        self.group
    }

    /// Effective receive buffer size reported by the OS.
    pub fn recv_buffer_size(&self) -> Option<usize> {
        recv_buffer_size(&self.recv)
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        "udp-multicast"
    }
}

impl DatagramSocket for MulticastSocket {
    fn send_datagram(&self, datagram: &[u8]) -> io::Result<usize> {
        self.send.send_to(datagram, self.group)
    }

    fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.recv.recv_from(buf)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.recv.set_read_timeout(timeout)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.send.local_addr()
    }
}

impl Drop for MulticastSocket {
    fn drop(&mut self) {
        if let Err(err) = self
            .recv
            .leave_multicast_v4(self.group.ip(), &self.interface)
        {
            debug!(group = %self.group, %err, "leaving multicast group failed");
        } else {
            debug!(group = %self.group, "left multicast group");
        }
    }
}

#[cfg(unix)]
fn bind_shared(addr: SocketAddrV4, recv_buffer_size: Option<usize>) -> io::Result<UdpSocket> {
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    #[cfg(target_os = "linux")]
    const SOCKET_FLAGS: libc::c_int = libc::SOCK_CLOEXEC;
    #[cfg(not(target_os = "linux"))]
    const SOCKET_FLAGS: libc::c_int = 0;

    // SAFETY: socket(2) takes no pointers; the result is checked before use.
    let raw = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | SOCKET_FLAGS, 0) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `raw` is a freshly created descriptor that nothing else owns.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    set_int_option(fd.as_raw_fd(), libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd"
    ))]
    set_int_option(fd.as_raw_fd(), libc::SOL_SOCKET, libc::SO_REUSEPORT, 1)?;

    if let Some(size) = recv_buffer_size {
        let size = libc::c_int::try_from(size).unwrap_or(libc::c_int::MAX);
        set_int_option(fd.as_raw_fd(), libc::SOL_SOCKET, libc::SO_RCVBUF, size)?;
    }

    let sin = sockaddr_in(addr);
    // SAFETY: `sin` is an initialized sockaddr_in and the length passed is its size.
    let rc = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            (&sin as *const libc::sockaddr_in).cast::<libc::sockaddr>(),
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    debug!(%addr, "bound shared receive socket");
    Ok(UdpSocket::from(fd))
}

#[cfg(not(unix))]
fn bind_shared(addr: SocketAddrV4, _recv_buffer_size: Option<usize>) -> io::Result<UdpSocket> {
    UdpSocket::bind(addr)
}

#[cfg(unix)]
fn sockaddr_in(addr: SocketAddrV4) -> libc::sockaddr_in {
    // SAFETY: sockaddr_in is plain old data; all-zero is a valid value.
    let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_port = addr.port().to_be();
    sin.sin_addr = libc::in_addr {
        s_addr: u32::from(*addr.ip()).to_be(),
    };
    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd"
    ))]
    {
        sin.sin_len = std::mem::size_of::<libc::sockaddr_in>() as u8;
    }
    sin
}

#[cfg(unix)]
fn set_int_option(
    fd: std::os::fd::RawFd,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> io::Result<()> {
    // SAFETY: `value` outlives the call and the length matches its type.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            (&value as *const libc::c_int).cast::<libc::c_void>(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn set_multicast_interface(socket: &UdpSocket, interface: Ipv4Addr) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let addr = libc::in_addr {
        s_addr: u32::from(interface).to_be(),
    };
    // SAFETY: `addr` outlives the call and the length matches in_addr.
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_MULTICAST_IF,
            (&addr as *const libc::in_addr).cast::<libc::c_void>(),
            std::mem::size_of::<libc::in_addr>() as libc::socklen_t,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn set_multicast_interface(_socket: &UdpSocket, _interface: Ipv4Addr) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn recv_buffer_size(socket: &UdpSocket) -> Option<usize> {
    use std::os::fd::AsRawFd;

    let mut value: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: `value` and `len` are valid writable pointers for the sizes given.
    let rc = unsafe {
        libc::getsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            (&mut value as *mut libc::c_int).cast::<libc::c_void>(),
            &mut len,
        )
    };
    if rc == 0 {
        usize::try_from(value).ok()
    } else {
        None
    }
}

#[cfg(not(unix))]
fn recv_buffer_size(_socket: &UdpSocket) -> Option<usize> {
    None
}
