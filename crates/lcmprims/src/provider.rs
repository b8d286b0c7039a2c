//! Backends an [`Lcm`](crate::Lcm) context publishes to and receives from.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lcmprims_log::{LogReader, LogWriter, Player};
use lcmprims_router::ReceivedMessage;
use lcmprims_transport::{
    DatagramSocket, MulticastSocket, TcpqClient, TcpqConfig, Transport, TransportConfig,
    TransportStats,
};
use tracing::warn;

use crate::error::{LcmError, Result};
use crate::url::{FileMode, ProviderUrl};

/// Idle wait for providers with nothing to receive.
const IDLE_POLL: Duration = Duration::from_millis(100);

/// Result of one receive attempt.
#[derive(Debug)]
pub enum Receive {
    Message(ReceivedMessage),
    /// Nothing completed within the provider's poll interval.
    Pending,
    /// The provider will never produce another message.
    Finished,
}

/// The seam between [`Lcm`](crate::Lcm) and a transport or log.
///
/// `receive` must return within a bounded wait so callers can observe
/// `close`.
pub trait Provider: Send + Sync {
    fn publish(&self, channel: &str, payload: &[u8]) -> Result<()>;

    fn receive(&self) -> Result<Receive>;

    /// Wait for queued publishes to go out. Returns false on timeout.
    fn flush(&self, _timeout: Duration) -> Result<bool> {
        Ok(true)
    }

    fn close(&self);

    fn stats(&self) -> Option<TransportStats> {
        None
    }
}

/// Build the provider a URL names.
pub fn open(url: &ProviderUrl) -> Result<Box<dyn Provider>> {
    match url {
        ProviderUrl::Udpm(config) => Ok(Box::new(UdpmProvider::bind(config.clone())?)),
        ProviderUrl::File {
            path,
            mode: FileMode::Read { playback, start },
        } => {
            let mut player = Player::new(LogReader::open(path)?, *playback)?;
            if let Some(ts) = start {
                player = player.start_at(*ts);
            }
            Ok(Box::new(LogPlaybackProvider::new(player)))
        }
        ProviderUrl::File {
            path,
            mode: FileMode::Write,
        } => Ok(Box::new(LogWriterProvider::create(path)?)),
        ProviderUrl::Tcpq { addr, config } => Ok(Box::new(TcpqProvider::connect(addr, config)?)),
    }
}

/// UDP multicast (or any [`DatagramSocket`]) transport.
pub struct UdpmProvider<S: DatagramSocket = MulticastSocket> {
    transport: Transport<S>,
}

impl UdpmProvider<MulticastSocket> {
    pub fn bind(config: TransportConfig) -> Result<Self> {
        let transport = Transport::bind(config).map_err(LcmError::from_transport)?;
        Ok(Self { transport })
    }
}

impl<S: DatagramSocket> UdpmProvider<S> {
    pub fn new(transport: Transport<S>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Transport<S> {
        &self.transport
    }
}

impl<S: DatagramSocket> Provider for UdpmProvider<S> {
    fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        self.transport
            .publish(channel, payload)
            .map_err(LcmError::from_transport)
    }

    fn receive(&self) -> Result<Receive> {
        let delivery = self.transport.receive().map_err(LcmError::from_transport)?;
        Ok(match delivery {
            Some(delivery) => Receive::Message(ReceivedMessage {
                channel: delivery.channel,
                payload: delivery.payload,
                recv_utime: delivery.recv_utime,
                source: Some(delivery.sender),
            }),
            None => Receive::Pending,
        })
    }

    fn flush(&self, timeout: Duration) -> Result<bool> {
        self.transport
            .flush(timeout)
            .map_err(LcmError::from_transport)
    }

    fn close(&self) {
        self.transport.close();
    }

    fn stats(&self) -> Option<TransportStats> {
        Some(self.transport.stats())
    }
}

/// Client of a TCP relay hub.
///
/// Relayed messages carry the hub's address as their source.
pub struct TcpqProvider {
    client: TcpqClient,
}

impl TcpqProvider {
    pub fn connect(addr: &str, config: &TcpqConfig) -> Result<Self> {
        let client = TcpqClient::connect(addr, config).map_err(LcmError::from_transport)?;
        Ok(Self { client })
    }

    pub fn client(&self) -> &TcpqClient {
        &self.client
    }
}

impl Provider for TcpqProvider {
    fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        self.client
            .publish(channel, payload)
            .map_err(LcmError::from_transport)
    }

    fn receive(&self) -> Result<Receive> {
        let delivery = self.client.receive().map_err(LcmError::from_transport)?;
        Ok(match delivery {
            Some(delivery) => Receive::Message(ReceivedMessage {
                channel: delivery.channel,
                payload: delivery.payload,
                recv_utime: delivery.recv_utime,
                source: Some(delivery.sender),
            }),
            None => Receive::Pending,
        })
    }

    fn close(&self) {
        self.client.close();
    }

    fn stats(&self) -> Option<TransportStats> {
        Some(self.client.stats())
    }
}

/// Replays a log as incoming traffic. Publishing is not supported.
pub struct LogPlaybackProvider {
    player: Mutex<Player>,
    cancel: Arc<AtomicBool>,
}

impl LogPlaybackProvider {
    pub fn new(player: Player) -> Self {
        let cancel = player.cancel_handle();
        Self {
            player: Mutex::new(player),
            cancel,
        }
    }
}

impl Provider for LogPlaybackProvider {
    fn publish(&self, _channel: &str, _payload: &[u8]) -> Result<()> {
        Err(LcmError::Unsupported("publishing to a log being read"))
    }

    fn receive(&self) -> Result<Receive> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(LcmError::Closed);
        }
        let mut player = self.player.lock().map_err(|_| LcmError::Closed)?;
        match player.next_paced()? {
            Some(event) => Ok(Receive::Message(ReceivedMessage {
                channel: event.channel,
                payload: event.payload,
                recv_utime: event.timestamp,
                source: None,
            })),
            None if player.is_cancelled() => Err(LcmError::Closed),
            None => Ok(Receive::Finished),
        }
    }

    fn close(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }
}

/// Appends published messages to a log. Nothing is ever received.
pub struct LogWriterProvider {
    writer: Mutex<LogWriter>,
    closed: AtomicBool,
}

impl LogWriterProvider {
    pub fn create(path: &Path) -> Result<Self> {
        Ok(Self::new(LogWriter::create(path)?))
    }

    pub fn new(writer: LogWriter) -> Self {
        Self {
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
        }
    }
}

impl Provider for LogWriterProvider {
    fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LcmError::Closed);
        }
        let mut writer = self.writer.lock().map_err(|_| LcmError::Closed)?;
        writer.append_now(channel, payload)?;
        Ok(())
    }

    fn receive(&self) -> Result<Receive> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LcmError::Closed);
        }
        std::thread::sleep(IDLE_POLL);
        Ok(Receive::Pending)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut writer) = self.writer.lock() {
            if let Err(err) = writer.close() {
                warn!(%err, "closing log writer failed");
            }
        }
    }
}
