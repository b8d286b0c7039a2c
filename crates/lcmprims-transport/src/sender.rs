use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::config::PublishMode;
use crate::error::{Result, TransportError};
use crate::stats::TransportCounters;
use crate::traits::DatagramSocket;

/// One published message, already split and encoded.
pub(crate) struct Outgoing {
    pub channel: String,
    pub datagrams: Vec<Bytes>,
}

/// Bounded queue drained by a dedicated sender thread.
///
/// A message is queued whole or not at all, so a full queue never leaves a
/// partial fragment set on the wire.
pub(crate) struct SendQueue {
    tx: Mutex<Option<SyncSender<Outgoing>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
}

impl SendQueue {
    pub fn spawn<S: DatagramSocket>(
        socket: Arc<S>,
        capacity: usize,
        counters: Arc<TransportCounters>,
        closed: Arc<AtomicBool>,
    ) -> io::Result<Self> {
        let (tx, rx) = mpsc::sync_channel(capacity);
        let worker_closed = Arc::clone(&closed);
        let worker = std::thread::Builder::new()
            .name("lcmprims-send".to_string())
            .spawn(move || drain(rx, socket.as_ref(), &counters, &worker_closed))?;

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            closed,
        })
    }

    pub fn enqueue(&self, message: Outgoing, mode: PublishMode) -> Result<()> {
        let tx = match self.tx.lock() {
            Ok(guard) => guard.clone().ok_or(TransportError::Closed)?,
            Err(_) => return Err(TransportError::Closed),
        };

        match mode {
            PublishMode::Block => tx.send(message).map_err(|_| TransportError::Closed)?,
            PublishMode::FailFast => tx.try_send(message).map_err(|err| match err {
                TrySendError::Full(_) => TransportError::WouldBlock,
                TrySendError::Disconnected(_) => TransportError::Closed,
            })?,
        }

        // A blocked sender can be let through by the drain that follows close.
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    /// Stop accepting messages and wait for the sender thread to finish.
    pub fn shutdown(&self) {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(worker) = worker {
            if worker.join().is_err() {
                warn!("sender thread panicked");
            }
        }
    }
}

fn drain<S: DatagramSocket + ?Sized>(
    rx: Receiver<Outgoing>,
    socket: &S,
    counters: &TransportCounters,
    closed: &AtomicBool,
) {
    for message in rx {
        if closed.load(Ordering::SeqCst) {
            TransportCounters::add(&counters.messages_discarded, 1);
            continue;
        }
        if send_all(socket, &message, counters) {
            TransportCounters::add(&counters.messages_sent, 1);
        } else {
            TransportCounters::add(&counters.messages_discarded, 1);
        }
    }
    debug!("sender thread exiting");
}

fn send_all<S: DatagramSocket + ?Sized>(
    socket: &S,
    message: &Outgoing,
    counters: &TransportCounters,
) -> bool {
    for datagram in &message.datagrams {
        loop {
            match socket.send_datagram(datagram) {
                Ok(n) => {
                    TransportCounters::add(&counters.datagrams_sent, 1);
                    TransportCounters::add(&counters.bytes_sent, n as u64);
                    break;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    TransportCounters::add(&counters.send_errors, 1);
                    warn!(channel = %message.channel, %err, "send failed; message discarded");
                    return false;
                }
            }
        }
    }
    true
}
