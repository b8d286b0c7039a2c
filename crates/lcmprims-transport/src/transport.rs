use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use lcmprims_frame::{decode_envelope, encode_envelope, validate_channel, MAX_DATAGRAM_SIZE};
use tracing::{debug, trace};

use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::fragment::fragment;
use crate::reassembly::Reassembler;
use crate::sender::{Outgoing, SendQueue};
use crate::stats::{TransportCounters, TransportStats};
use crate::traits::{is_timeout, DatagramSocket};
use crate::udpm::MulticastSocket;

const FLUSH_POLL: Duration = Duration::from_millis(1);

/// A fully reassembled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub channel: String,
    pub payload: Bytes,
    /// Sender identity (the publisher's socket address).
    pub sender: SocketAddr,
    pub sequence_number: u32,
    /// Receive time in microseconds since the Unix epoch.
    pub recv_utime: i64,
}

/// Best-effort datagram transport with fragmentation and reassembly.
///
/// Publishing is queue-and-return; a dedicated thread writes datagrams.
/// Receiving is driven by the caller, usually one receive thread, and waits
/// at most `poll_interval` per call. Lost fragments silently drop their
/// message; see [`Transport::stats`].
pub struct Transport<S: DatagramSocket = MulticastSocket> {
    socket: Arc<S>,
    config: TransportConfig,
    queue: SendQueue,
    reassembler: Mutex<Reassembler>,
    recv_buf: Mutex<Vec<u8>>,
    counters: Arc<TransportCounters>,
    next_sequence: AtomicU32,
    closed: Arc<AtomicBool>,
}

impl Transport<MulticastSocket> {
    /// Join the configured multicast group.
    pub fn bind(config: TransportConfig) -> Result<Self> {
        let socket = MulticastSocket::bind(&config)?;
        Self::with_socket(socket, config)
    }
}

impl<S: DatagramSocket> Transport<S> {
    /// Run the transport over an already-configured socket.
    pub fn with_socket(socket: S, config: TransportConfig) -> Result<Self> {
        config.validate_local()?;
        socket.set_read_timeout(Some(config.poll_interval))?;

        let socket = Arc::new(socket);
        let counters = Arc::new(TransportCounters::default());
        let closed = Arc::new(AtomicBool::new(false));
        let queue = SendQueue::spawn(
            Arc::clone(&socket),
            config.send_queue_capacity,
            Arc::clone(&counters),
            Arc::clone(&closed),
        )?;

        Ok(Self {
            socket,
            reassembler: Mutex::new(Reassembler::new(config.reassembly)),
            recv_buf: Mutex::new(vec![0u8; MAX_DATAGRAM_SIZE]),
            config,
            queue,
            counters,
            next_sequence: AtomicU32::new(0),
            closed,
        })
    }

    /// Fragment, encode, and queue a message.
    ///
    /// Returns once the message is queued. A full queue blocks or fails with
    /// `TransportError::WouldBlock` depending on `publish_mode`.
    pub fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        self.ensure_open()?;
        validate_channel(channel)?;

        let payload = Bytes::copy_from_slice(payload);
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let fragments = fragment(channel, sequence, &payload, self.config.fragment_size)?;

        let mut datagrams = Vec::with_capacity(fragments.len());
        for envelope in &fragments {
            let mut buf = BytesMut::with_capacity(envelope.wire_size());
            encode_envelope(envelope, &mut buf)?;
            datagrams.push(buf.freeze());
        }

        trace!(
            channel,
            sequence,
            fragments = datagrams.len(),
            size = payload.len(),
            "queueing message"
        );
        self.queue.enqueue(
            Outgoing {
                channel: channel.to_string(),
                datagrams,
            },
            self.config.publish_mode,
        )?;
        TransportCounters::add(&self.counters.messages_published, 1);
        Ok(())
    }

    /// Read at most one datagram.
    ///
    /// Returns `Ok(None)` when nothing completed within the poll interval, or
    /// when the datagram was malformed or only part of a message.
    pub fn receive(&self) -> Result<Option<Delivery>> {
        self.ensure_open()?;

        let mut buf = self.recv_buf.lock().map_err(|_| TransportError::Closed)?;
        let received = self.socket.recv_datagram(&mut buf);
        let now = Instant::now();
        self.ensure_open()?;

        let (len, sender) = match received {
            Ok(received) => received,
            Err(err) if is_timeout(&err) => {
                self.reassembler()?.expire(now);
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        TransportCounters::add(&self.counters.datagrams_received, 1);
        TransportCounters::add(&self.counters.bytes_received, len as u64);

        let envelope = match decode_envelope(Bytes::copy_from_slice(&buf[..len])) {
            Ok(envelope) => envelope,
            Err(err) => {
                TransportCounters::add(&self.counters.malformed_datagrams, 1);
                trace!(%sender, %err, "dropping malformed datagram");
                return Ok(None);
            }
        };
        drop(buf);

        let completed = self.reassembler()?.accept(sender, envelope, now);
        Ok(completed.map(|message| {
            TransportCounters::add(&self.counters.messages_delivered, 1);
            Delivery {
                channel: message.channel,
                payload: message.payload,
                sender: message.sender,
                sequence_number: message.sequence_number,
                recv_utime: now_utime(),
            }
        }))
    }

    /// Keep receiving until a message completes or `timeout` elapses.
    ///
    /// The wait is rounded up to whole poll intervals.
    pub fn receive_timeout(&self, timeout: Duration) -> Result<Option<Delivery>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(delivery) = self.receive()? {
                return Ok(Some(delivery));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    /// Wait until every published message has left the send queue.
    ///
    /// Returns false if `timeout` elapsed first. `close` discards whatever
    /// is still queued, so call this first when the tail matters.
    pub fn flush(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            self.ensure_open()?;
            let stats = self.counters.snapshot(Default::default());
            if stats.messages_sent + stats.messages_discarded >= stats.messages_published {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(FLUSH_POLL);
        }
    }

    /// Tear the transport down. Pending and later calls return `Closed`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.queue.shutdown();
        debug!("transport closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Counter snapshot, including reassembly drops.
    pub fn stats(&self) -> TransportStats {
        let reassembly = self
            .reassembler
            .lock()
            .map(|r| r.stats())
            .unwrap_or_default();
        self.counters.snapshot(reassembly)
    }

    /// Incomplete messages currently buffered.
    pub fn pending_messages(&self) -> usize {
        self.reassembler
            .lock()
            .map(|r| r.pending_messages())
            .unwrap_or(0)
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// This endpoint's sender identity.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(Into::into)
    }

    /// Borrow the underlying socket.
    pub fn socket(&self) -> &S {
        &self.socket
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn reassembler(&self) -> Result<MutexGuard<'_, Reassembler>> {
        self.reassembler.lock().map_err(|_| TransportError::Closed)
    }
}

impl<S: DatagramSocket> Drop for Transport<S> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Current time in microseconds since the Unix epoch.
pub fn now_utime() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io;
    use std::net::UdpSocket;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    use super::*;
    use crate::config::{PublishMode, ReassemblyConfig};

    fn test_config() -> TransportConfig {
        TransportConfig {
            fragment_size: 64,
            poll_interval: Duration::from_millis(20),
            reassembly: ReassemblyConfig {
                timeout: Duration::from_millis(100),
                ..ReassemblyConfig::default()
            },
            ..TransportConfig::default()
        }
    }

    fn receiver() -> (Transport<UdpSocket>, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap();
        (Transport::with_socket(socket, test_config()).unwrap(), addr)
    }

    fn publisher_to(target: SocketAddr) -> Transport<UdpSocket> {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.connect(target).unwrap();
        Transport::with_socket(socket, test_config()).unwrap()
    }

    fn receive_within(transport: &Transport<UdpSocket>, timeout: Duration) -> Option<Delivery> {
        transport.receive_timeout(timeout).unwrap()
    }

    #[test]
    fn publish_and_receive_small_message() {
        let (rx, addr) = receiver();
        let tx = publisher_to(addr);

        tx.publish("EXAMPLE", b"hello").unwrap();
        let delivery = receive_within(&rx, Duration::from_secs(2)).unwrap();

        assert_eq!(delivery.channel, "EXAMPLE");
        assert_eq!(delivery.payload.as_ref(), b"hello");
        assert_eq!(delivery.sender, tx.local_addr().unwrap());
        assert!(delivery.recv_utime > 0);
    }

    #[test]
    fn fragmented_message_is_reassembled() {
        let (rx, addr) = receiver();
        let tx = publisher_to(addr);
        let payload: Vec<u8> = (0..(10 * 64 + 1)).map(|i| (i % 253) as u8).collect();

        tx.publish("robot.scan", &payload).unwrap();
        let delivery = receive_within(&rx, Duration::from_secs(2)).unwrap();

        assert_eq!(delivery.payload.as_ref(), payload.as_slice());
        let stats = rx.stats();
        assert_eq!(stats.datagrams_received, 11);
        assert_eq!(stats.messages_delivered, 1);
    }

    #[test]
    fn sequence_numbers_advance_per_publish() {
        let (rx, addr) = receiver();
        let tx = publisher_to(addr);

        tx.publish("A", b"1").unwrap();
        tx.publish("A", b"2").unwrap();
        let first = receive_within(&rx, Duration::from_secs(2)).unwrap();
        let second = receive_within(&rx, Duration::from_secs(2)).unwrap();

        assert_eq!(first.sequence_number + 1, second.sequence_number);
    }

    #[test]
    fn malformed_datagram_is_dropped_and_counted() {
        let (rx, addr) = receiver();
        let raw = UdpSocket::bind("127.0.0.1:0").unwrap();
        raw.send_to(b"not an envelope", addr).unwrap();

        let tx = publisher_to(addr);
        tx.publish("AFTER", b"ok").unwrap();

        let delivery = receive_within(&rx, Duration::from_secs(2)).unwrap();
        assert_eq!(delivery.channel, "AFTER");
        assert_eq!(rx.stats().malformed_datagrams, 1);
    }

    #[test]
    fn lost_fragment_drops_message_after_timeout() {
        let (rx, addr) = receiver();
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.connect(addr).unwrap();
        let lossy = LossySocket {
            inner: socket,
            drop_index: 1,
            sent: AtomicUsize::new(0),
        };
        let tx = Transport::with_socket(lossy, test_config()).unwrap();

        tx.publish("BIG", &[7u8; 3 * 64]).unwrap();
        assert!(receive_within(&rx, Duration::from_millis(400)).is_none());

        let stats = rx.stats();
        assert_eq!(stats.messages_dropped, 1);
        assert_eq!(stats.messages_delivered, 0);
        assert_eq!(rx.pending_messages(), 0);
    }

    #[test]
    fn concurrent_publishers_do_not_corrupt_each_other() {
        let (rx, addr) = receiver();
        let per_sender = 20usize;

        let publishers: Vec<_> = ["left.data", "right.data"]
            .into_iter()
            .enumerate()
            .map(|(idx, channel)| {
                std::thread::spawn(move || {
                    let tx = publisher_to(addr);
                    for n in 0..per_sender {
                        let payload = vec![(idx * 100 + n) as u8; 5 * 64 + 3];
                        tx.publish(channel, &payload).unwrap();
                    }
                    // Give the sender thread time to flush before teardown.
                    std::thread::sleep(Duration::from_millis(100));
                })
            })
            .collect();

        let mut seen: HashMap<String, usize> = HashMap::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while seen.values().sum::<usize>() < 2 * per_sender && Instant::now() < deadline {
            if let Some(delivery) = rx.receive().unwrap() {
                let first = delivery.payload[0];
                assert_eq!(delivery.payload.len(), 5 * 64 + 3);
                assert!(delivery.payload.iter().all(|b| *b == first));
                *seen.entry(delivery.channel).or_default() += 1;
            }
        }

        for handle in publishers {
            handle.join().unwrap();
        }
        assert_eq!(seen.get("left.data"), Some(&per_sender));
        assert_eq!(seen.get("right.data"), Some(&per_sender));
    }

    #[test]
    fn fail_fast_reports_would_block_when_queue_full() {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let socket = StallingSocket {
            started: Mutex::new(Some(started_tx)),
            release: Mutex::new(release_rx),
        };
        let cfg = TransportConfig {
            send_queue_capacity: 1,
            publish_mode: PublishMode::FailFast,
            ..test_config()
        };
        let tx = Transport::with_socket(socket, cfg).unwrap();

        tx.publish("A", b"1").unwrap();
        started_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        tx.publish("A", b"2").unwrap();

        let err = tx.publish("A", b"3").unwrap_err();
        assert!(matches!(err, TransportError::WouldBlock));

        release_tx.send(()).unwrap();
    }

    #[test]
    fn flush_waits_for_queue_to_drain() {
        let (rx, addr) = receiver();
        let tx = publisher_to(addr);

        for n in 0..50u8 {
            tx.publish("BURST", &[n; 200]).unwrap();
        }
        assert!(tx.flush(Duration::from_secs(2)).unwrap());

        let stats = tx.stats();
        assert_eq!(stats.messages_published, 50);
        assert_eq!(stats.messages_sent, 50);
        assert_eq!(stats.datagrams_sent, 50 * 4);
        drop(rx);
    }

    #[test]
    fn close_rejects_publish_and_receive() {
        let (rx, addr) = receiver();
        let tx = publisher_to(addr);

        tx.close();
        rx.close();

        assert!(matches!(tx.publish("A", b"x"), Err(TransportError::Closed)));
        assert!(matches!(rx.receive(), Err(TransportError::Closed)));
        assert!(rx.is_closed());
    }

    #[test]
    fn close_unblocks_a_waiting_receiver() {
        let (rx, _addr) = receiver();
        let rx = Arc::new(rx);

        let waiter = {
            let rx = Arc::clone(&rx);
            std::thread::spawn(move || rx.receive_timeout(Duration::from_secs(30)))
        };
        std::thread::sleep(Duration::from_millis(50));
        rx.close();

        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[test]
    fn invalid_channel_rejected_before_queueing() {
        let (_rx, addr) = receiver();
        let tx = publisher_to(addr);

        assert!(matches!(
            tx.publish("bad*", b"x"),
            Err(TransportError::Frame(_))
        ));
        assert_eq!(tx.stats().messages_published, 0);
    }

    struct LossySocket {
        inner: UdpSocket,
        drop_index: usize,
        sent: AtomicUsize,
    }

    impl DatagramSocket for LossySocket {
        fn send_datagram(&self, datagram: &[u8]) -> io::Result<usize> {
            if self.sent.fetch_add(1, Ordering::SeqCst) == self.drop_index {
                return Ok(datagram.len());
            }
            self.inner.send(datagram)
        }

        fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            self.inner.recv_from(buf)
        }

        fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
            self.inner.set_read_timeout(timeout)
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            self.inner.local_addr()
        }
    }

    struct StallingSocket {
        started: Mutex<Option<mpsc::Sender<()>>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl DatagramSocket for StallingSocket {
        fn send_datagram(&self, datagram: &[u8]) -> io::Result<usize> {
            let started = self.started.lock().unwrap().take();
            if let Some(started) = started {
                started.send(()).unwrap();
                let _ = self.release.lock().unwrap().recv();
            }
            Ok(datagram.len())
        }

        fn recv_datagram(&self, _buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            std::thread::sleep(Duration::from_millis(5));
            Err(io::Error::from(io::ErrorKind::WouldBlock))
        }

        fn set_read_timeout(&self, _timeout: Option<Duration>) -> io::Result<()> {
            Ok(())
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok(SocketAddr::from(([127, 0, 0, 1], 0)))
        }
    }
}
