//! TCP relay for networks without multicast.
//!
//! A [`TcpHub`] accepts clients and forwards every message one client
//! publishes to all connected clients, the publisher included. A
//! [`TcpqClient`] is one such connection. Messages travel whole in the
//! [`lcmprims_frame::stream`] format.

use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lcmprims_frame::{
    expect_hello, send_hello, FrameError, StreamReader, StreamWriter, CLIENT_MAGIC,
    DEFAULT_MAX_STREAM_PAYLOAD, HUB_MAGIC,
};
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::stats::TransportCounters;
use crate::transport::{now_utime, Delivery};
use crate::stats::TransportStats;

/// Port used when a `tcpq` address has none.
pub const DEFAULT_TCPQ_PORT: u16 = 7700;

/// How often the hub's accept loop checks for shutdown.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Connection settings shared by hub and client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpqConfig {
    /// Limit for connecting and for the hello exchange.
    pub connect_timeout: Duration,
    /// Longest a client `receive` blocks before returning `None`.
    pub poll_interval: Duration,
    /// A peer that cannot take a message within this time is dropped.
    pub write_timeout: Duration,
    pub max_payload_size: usize,
}

impl Default for TcpqConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
            write_timeout: Duration::from_secs(5),
            max_payload_size: DEFAULT_MAX_STREAM_PAYLOAD,
        }
    }
}

/// One connection to a [`TcpHub`].
pub struct TcpqClient {
    peer: SocketAddr,
    reader: Mutex<StreamReader<TcpStream>>,
    writer: Mutex<StreamWriter<TcpStream>>,
    closed: AtomicBool,
    counters: TransportCounters,
}

impl TcpqClient {
    /// Connect to a hub and exchange hellos.
    pub fn connect(addr: impl ToSocketAddrs, config: &TcpqConfig) -> Result<Self> {
        let addrs: Vec<SocketAddr> = addr.to_socket_addrs()?.collect();
        let mut last_err = None;
        let mut connected = None;
        for candidate in addrs {
            match TcpStream::connect_timeout(&candidate, config.connect_timeout) {
                Ok(stream) => {
                    connected = Some(stream);
                    break;
                }
                Err(err) => last_err = Some((candidate, err)),
            }
        }
        let mut stream = match (connected, last_err) {
            (Some(stream), _) => stream,
            (None, Some((addr, source))) => return Err(TransportError::Connect { addr, source }),
            (None, None) => {
                return Err(TransportError::InvalidConfig(
                    "hub address resolved to nothing".to_string(),
                ))
            }
        };
        let peer = stream.peer_addr()?;

        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(config.connect_timeout))?;
        stream.set_write_timeout(Some(config.write_timeout))?;
        expect_hello(&mut stream, HUB_MAGIC)?;
        send_hello(&mut stream, CLIENT_MAGIC)?;
        stream.set_read_timeout(Some(config.poll_interval))?;

        let reader = StreamReader::with_max_payload(stream.try_clone()?, config.max_payload_size);
        let writer = StreamWriter::with_max_payload(stream, config.max_payload_size);
        debug!(%peer, "connected to tcpq hub");

        Ok(Self {
            peer,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
            counters: TransportCounters::default(),
        })
    }

    /// Send one message to the hub.
    pub fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let mut writer = self.writer.lock().map_err(|_| TransportError::Closed)?;
        TransportCounters::add(&self.counters.messages_published, 1);
        if let Err(err) = writer.send(channel, payload) {
            TransportCounters::add(&self.counters.send_errors, 1);
            return Err(self.stream_error(err));
        }
        TransportCounters::add(&self.counters.messages_sent, 1);
        TransportCounters::add(&self.counters.bytes_sent, payload.len() as u64);
        Ok(())
    }

    /// Wait up to the poll interval for the next relayed message.
    pub fn receive(&self) -> Result<Option<Delivery>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let mut reader = self.reader.lock().map_err(|_| TransportError::Closed)?;
        let message = match reader.read_message() {
            Ok(Some(message)) => message,
            Ok(None) => return Ok(None),
            Err(err) => return Err(self.stream_error(err)),
        };

        TransportCounters::add(&self.counters.bytes_received, message.payload.len() as u64);
        TransportCounters::add(&self.counters.messages_delivered, 1);
        Ok(Some(Delivery {
            channel: message.channel,
            payload: message.payload,
            sender: self.peer,
            sequence_number: 0,
            recv_utime: now_utime(),
        }))
    }

    /// Shut the connection down. Later calls return `Closed`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(writer) = self.writer.lock() {
            let _ = writer.get_ref().shutdown(Shutdown::Both);
        }
        debug!(peer = %self.peer, "tcpq connection closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Address of the hub.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn stats(&self) -> TransportStats {
        self.counters.snapshot(Default::default())
    }

    fn stream_error(&self, err: FrameError) -> TransportError {
        if self.closed.load(Ordering::SeqCst) {
            return TransportError::Closed;
        }
        match err {
            FrameError::ConnectionClosed => TransportError::Disconnected { peer: self.peer },
            other => other.into(),
        }
    }
}

impl Drop for TcpqClient {
    fn drop(&mut self) {
        self.close();
    }
}

/// Point-in-time hub counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    /// Clients currently connected.
    pub clients: usize,
    pub connections_accepted: u64,
    /// Messages received from clients.
    pub messages_relayed: u64,
    /// Payload bytes received from clients.
    pub bytes_relayed: u64,
    /// Clients dropped because a relay write failed.
    pub slow_clients_dropped: u64,
}

struct HubClient {
    id: u64,
    addr: SocketAddr,
    writer: StreamWriter<TcpStream>,
}

#[derive(Default)]
struct HubShared {
    clients: Mutex<Vec<HubClient>>,
    connections_accepted: AtomicU64,
    messages_relayed: AtomicU64,
    bytes_relayed: AtomicU64,
    slow_clients_dropped: AtomicU64,
}

impl HubShared {
    /// Forward one message to every client. Clients that cannot take it are
    /// disconnected.
    fn relay(&self, channel: &str, payload: &[u8]) {
        self.messages_relayed.fetch_add(1, Ordering::Relaxed);
        self.bytes_relayed
            .fetch_add(payload.len() as u64, Ordering::Relaxed);

        let Ok(mut clients) = self.clients.lock() else {
            return;
        };
        clients.retain_mut(|client| match client.writer.send(channel, payload) {
            Ok(()) => true,
            Err(err) => {
                warn!(client = %client.addr, %err, "dropping tcpq client");
                let _ = client.writer.get_ref().shutdown(Shutdown::Both);
                self.slow_clients_dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        });
    }

    fn remove(&self, id: u64) {
        if let Ok(mut clients) = self.clients.lock() {
            clients.retain(|client| client.id != id);
        }
    }
}

/// Relay server for [`TcpqClient`]s.
pub struct TcpHub {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: TcpqConfig,
    shared: Arc<HubShared>,
    running: Arc<AtomicBool>,
}

impl TcpHub {
    /// Bind the listening socket. Call [`run`](Self::run) to serve.
    pub fn bind(addr: SocketAddr, config: TcpqConfig) -> Result<Self> {
        let listener =
            TcpListener::bind(addr).map_err(|source| TransportError::Bind { addr, source })?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "tcpq hub listening");

        Ok(Self {
            listener,
            local_addr,
            config,
            shared: Arc::new(HubShared::default()),
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept and serve clients until [`stop`](Self::stop). Each client gets
    /// its own reader thread.
    pub fn run(&self) -> Result<()> {
        let mut next_id = 0u64;
        while self.running.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    next_id += 1;
                    self.shared
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    let shared = Arc::clone(&self.shared);
                    let config = self.config.clone();
                    let id = next_id;
                    std::thread::Builder::new()
                        .name(format!("lcmprims-hub-{id}"))
                        .spawn(move || serve_client(stream, addr, id, &shared, &config))?;
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL);
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!(%err, "tcpq accept failed");
                    std::thread::sleep(ACCEPT_POLL);
                }
            }
        }

        if let Ok(mut clients) = self.shared.clients.lock() {
            for client in clients.drain(..) {
                let _ = client.writer.get_ref().shutdown(Shutdown::Both);
            }
        }
        debug!(local_addr = %self.local_addr, "tcpq hub stopped");
        Ok(())
    }

    /// Make [`run`](Self::run) return and disconnect every client.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn stats(&self) -> HubStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        HubStats {
            clients: self.shared.clients.lock().map(|c| c.len()).unwrap_or(0),
            connections_accepted: load(&self.shared.connections_accepted),
            messages_relayed: load(&self.shared.messages_relayed),
            bytes_relayed: load(&self.shared.bytes_relayed),
            slow_clients_dropped: load(&self.shared.slow_clients_dropped),
        }
    }
}

fn serve_client(
    mut stream: TcpStream,
    addr: SocketAddr,
    id: u64,
    shared: &HubShared,
    config: &TcpqConfig,
) {
    let joined = stream
        .set_nonblocking(false)
        .and_then(|()| stream.set_nodelay(true))
        .and_then(|()| stream.set_read_timeout(Some(config.connect_timeout)))
        .and_then(|()| stream.set_write_timeout(Some(config.write_timeout)))
        .map_err(FrameError::from)
        .and_then(|()| send_hello(&mut stream, HUB_MAGIC))
        .and_then(|()| expect_hello(&mut stream, CLIENT_MAGIC).map(|_| ()))
        .and_then(|()| stream.set_read_timeout(None).map_err(FrameError::from))
        .and_then(|()| stream.try_clone().map_err(FrameError::from));
    let writer_stream = match joined {
        Ok(writer_stream) => writer_stream,
        Err(err) => {
            debug!(client = %addr, %err, "tcpq hello failed");
            return;
        }
    };

    if let Ok(mut clients) = shared.clients.lock() {
        clients.push(HubClient {
            id,
            addr,
            writer: StreamWriter::with_max_payload(writer_stream, config.max_payload_size),
        });
    }
    debug!(client = %addr, "tcpq client joined");

    let mut reader = StreamReader::with_max_payload(stream, config.max_payload_size);
    loop {
        match reader.read_message() {
            Ok(Some(message)) => shared.relay(&message.channel, &message.payload),
            Ok(None) => {}
            Err(FrameError::ConnectionClosed) => break,
            Err(err) => {
                debug!(client = %addr, %err, "tcpq client read failed");
                break;
            }
        }
    }

    shared.remove(id);
    let _ = reader.get_ref().shutdown(Shutdown::Both);
    debug!(client = %addr, "tcpq client left");
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::thread::JoinHandle;
    use std::time::Instant;

    use super::*;

    fn start_hub() -> (Arc<TcpHub>, JoinHandle<Result<()>>) {
        let hub = Arc::new(
            TcpHub::bind(SocketAddr::from(([127, 0, 0, 1], 0)), TcpqConfig::default()).unwrap(),
        );
        let runner = {
            let hub = Arc::clone(&hub);
            std::thread::spawn(move || hub.run())
        };
        (hub, runner)
    }

    fn wait_for_clients(hub: &TcpHub, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while hub.stats().clients < n {
            assert!(Instant::now() < deadline, "clients never joined");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn receive_within(client: &TcpqClient, limit: Duration) -> Option<Delivery> {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if let Some(delivery) = client.receive().unwrap() {
                return Some(delivery);
            }
        }
        None
    }

    #[test]
    fn hub_relays_to_every_client() {
        let (hub, runner) = start_hub();
        let config = TcpqConfig::default();
        let a = TcpqClient::connect(hub.local_addr(), &config).unwrap();
        let b = TcpqClient::connect(hub.local_addr(), &config).unwrap();
        wait_for_clients(&hub, 2);

        a.publish("robot.pose", b"x=1").unwrap();

        for client in [&a, &b] {
            let delivery = receive_within(client, Duration::from_secs(5)).unwrap();
            assert_eq!(delivery.channel, "robot.pose");
            assert_eq!(delivery.payload.as_ref(), b"x=1");
            assert_eq!(delivery.sender, hub.local_addr());
        }
        assert_eq!(hub.stats().messages_relayed, 1);
        assert_eq!(a.stats().messages_sent, 1);
        assert_eq!(b.stats().messages_delivered, 1);

        hub.stop();
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn large_messages_travel_whole() {
        let (hub, runner) = start_hub();
        let client = TcpqClient::connect(hub.local_addr(), &TcpqConfig::default()).unwrap();
        wait_for_clients(&hub, 1);

        let payload: Vec<u8> = (0..300_000).map(|i| (i % 251) as u8).collect();
        client.publish("BIG", &payload).unwrap();

        let delivery = receive_within(&client, Duration::from_secs(5)).unwrap();
        assert_eq!(delivery.payload.as_ref(), &payload[..]);

        hub.stop();
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn receive_times_out_with_none() {
        let (hub, runner) = start_hub();
        let client = TcpqClient::connect(hub.local_addr(), &TcpqConfig::default()).unwrap();

        let started = Instant::now();
        assert!(client.receive().unwrap().is_none());
        assert!(started.elapsed() < Duration::from_secs(2));

        hub.stop();
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn stopped_hub_disconnects_clients() {
        let (hub, runner) = start_hub();
        let client = TcpqClient::connect(hub.local_addr(), &TcpqConfig::default()).unwrap();
        wait_for_clients(&hub, 1);

        hub.stop();
        runner.join().unwrap().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let err = loop {
            match client.receive() {
                Ok(None) => assert!(Instant::now() < deadline, "never disconnected"),
                Ok(Some(_)) => panic!("unexpected message"),
                Err(err) => break err,
            }
        };
        assert!(matches!(err, TransportError::Disconnected { .. }), "{err}");
    }

    #[test]
    fn closed_client_rejects_calls() {
        let (hub, runner) = start_hub();
        let client = TcpqClient::connect(hub.local_addr(), &TcpqConfig::default()).unwrap();

        client.close();
        assert!(client.is_closed());
        assert!(matches!(client.publish("A", b"x"), Err(TransportError::Closed)));
        assert!(matches!(client.receive(), Err(TransportError::Closed)));

        hub.stop();
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn wrong_hello_is_rejected() {
        let (hub, runner) = start_hub();

        let mut stream = TcpStream::connect(hub.local_addr()).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        expect_hello(&mut stream, HUB_MAGIC).unwrap();
        stream.write_all(&[0xde, 0xad, 0xbe, 0xef, 0, 0, 1, 0]).unwrap();

        // The hub hangs up instead of admitting the client.
        let mut rest = Vec::new();
        let _ = std::io::Read::read_to_end(&mut stream, &mut rest);
        assert_eq!(hub.stats().clients, 0);
        assert_eq!(hub.stats().connections_accepted, 1);

        hub.stop();
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn nothing_listening_is_connect_error() {
        let port = {
            let unused = TcpListener::bind("127.0.0.1:0").unwrap();
            unused.local_addr().unwrap().port()
        };
        let err = TcpqClient::connect(("127.0.0.1", port), &TcpqConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::Connect { .. }), "{err}");
    }
}
