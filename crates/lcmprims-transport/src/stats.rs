use std::sync::atomic::{AtomicU64, Ordering};

use crate::reassembly::ReassemblyStats;

/// Live transport counters, shared between the caller and the sender thread.
#[derive(Debug, Default)]
pub(crate) struct TransportCounters {
    pub messages_published: AtomicU64,
    pub messages_sent: AtomicU64,
    pub messages_discarded: AtomicU64,
    pub datagrams_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub send_errors: AtomicU64,
    pub datagrams_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub malformed_datagrams: AtomicU64,
    pub messages_delivered: AtomicU64,
}

impl TransportCounters {
    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    pub fn snapshot(&self, reassembly: ReassemblyStats) -> TransportStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        TransportStats {
            messages_published: load(&self.messages_published),
            messages_sent: load(&self.messages_sent),
            messages_discarded: load(&self.messages_discarded),
            datagrams_sent: load(&self.datagrams_sent),
            bytes_sent: load(&self.bytes_sent),
            send_errors: load(&self.send_errors),
            datagrams_received: load(&self.datagrams_received),
            bytes_received: load(&self.bytes_received),
            malformed_datagrams: load(&self.malformed_datagrams),
            messages_delivered: load(&self.messages_delivered),
            messages_dropped: reassembly.dropped(),
            duplicate_fragments: reassembly.duplicate_fragments,
        }
    }
}

/// Point-in-time transport counters.
///
/// Message loss is never reported as an error; these counters are the only
/// place it shows up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Messages accepted by `publish`.
    pub messages_published: u64,
    /// Messages whose datagrams all left the socket.
    pub messages_sent: u64,
    /// Queued messages thrown away because of a send error or close.
    pub messages_discarded: u64,
    pub datagrams_sent: u64,
    pub bytes_sent: u64,
    pub send_errors: u64,
    pub datagrams_received: u64,
    pub bytes_received: u64,
    /// Datagrams that did not decode as envelopes.
    pub malformed_datagrams: u64,
    /// Complete messages returned by `receive`.
    pub messages_delivered: u64,
    /// Incomplete messages discarded by the reassembly buffer.
    pub messages_dropped: u64,
    pub duplicate_fragments: u64,
}
