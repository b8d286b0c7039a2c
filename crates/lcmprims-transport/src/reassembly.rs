use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use lcmprims_frame::Envelope;
use tracing::{debug, warn};

use crate::config::ReassemblyConfig;

/// Fragment sets are namespaced by sender so concurrent publishers never
/// mix their sequence numbers.
pub type FragmentKey = (SocketAddr, u32);

/// A message whose fragments have all arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedMessage {
    pub sender: SocketAddr,
    pub sequence_number: u32,
    pub channel: String,
    pub payload: Bytes,
}

/// Counters kept by the reassembler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReassemblyStats {
    /// Messages handed back complete.
    pub completed: u64,
    /// Incomplete messages discarded after the timeout.
    pub expired: u64,
    /// Incomplete messages evicted to stay within the buffer limits.
    pub evicted: u64,
    /// Incomplete messages replaced by a conflicting fragment set.
    pub replaced: u64,
    /// Fragments received more than once.
    pub duplicate_fragments: u64,
}

impl ReassemblyStats {
    /// Messages that will never be delivered.
    pub fn dropped(&self) -> u64 {
        self.expired + self.evicted + self.replaced
    }
}

struct PendingMessage {
    channel: String,
    chunks: Vec<Option<Bytes>>,
    received: usize,
    bytes: usize,
    started: Instant,
    generation: u64,
}

/// Bounded buffer of partially received messages.
///
/// The caller supplies the current time so expiry is deterministic. Sets are
/// evicted oldest first, both on timeout and under memory pressure.
pub struct Reassembler {
    config: ReassemblyConfig,
    pending: HashMap<FragmentKey, PendingMessage>,
    by_age: BTreeMap<u64, FragmentKey>,
    next_generation: u64,
    pending_bytes: usize,
    stats: ReassemblyStats,
}

impl Reassembler {
    pub fn new(config: ReassemblyConfig) -> Self {
        Self {
            config,
            pending: HashMap::new(),
            by_age: BTreeMap::new(),
            next_generation: 0,
            pending_bytes: 0,
            stats: ReassemblyStats::default(),
        }
    }

    /// Feed one fragment. Returns the message once its last fragment arrives.
    pub fn accept(
        &mut self,
        sender: SocketAddr,
        envelope: Envelope,
        now: Instant,
    ) -> Option<CompletedMessage> {
        self.expire(now);

        if envelope.fragment_total == 1 {
            self.stats.completed += 1;
            return Some(CompletedMessage {
                sender,
                sequence_number: envelope.sequence_number,
                channel: envelope.channel,
                payload: envelope.payload,
            });
        }

        let key = (sender, envelope.sequence_number);
        let conflicting = self.pending.get(&key).is_some_and(|pending| {
            pending.chunks.len() != envelope.fragment_total as usize
                || pending.channel != envelope.channel
        });
        if conflicting {
            debug!(?key, "fragment set changed shape; discarding partial message");
            self.remove(&key);
            self.stats.replaced += 1;
        }

        if !self.pending.contains_key(&key) {
            while self.pending.len() >= self.config.max_pending_messages {
                if !self.evict_oldest() {
                    break;
                }
            }
            let generation = self.next_generation;
            self.next_generation += 1;
            self.by_age.insert(generation, key);
            self.pending.insert(
                key,
                PendingMessage {
                    channel: envelope.channel.clone(),
                    chunks: vec![None; envelope.fragment_total as usize],
                    received: 0,
                    bytes: 0,
                    started: now,
                    generation,
                },
            );
        }

        let pending = self.pending.get_mut(&key)?;
        let slot = pending.chunks.get_mut(envelope.fragment_offset as usize)?;
        if slot.is_some() {
            self.stats.duplicate_fragments += 1;
            return None;
        }

        let len = envelope.payload.len();
        *slot = Some(envelope.payload);
        pending.received += 1;
        pending.bytes += len;
        self.pending_bytes += len;

        if pending.received == pending.chunks.len() {
            let done = self.remove(&key)?;
            self.stats.completed += 1;
            return Some(CompletedMessage {
                sender,
                sequence_number: key.1,
                channel: done.channel,
                payload: join(done.chunks, done.bytes),
            });
        }

        while self.pending_bytes > self.config.max_pending_bytes {
            if !self.evict_oldest() {
                break;
            }
        }

        None
    }

    /// Discard incomplete messages older than the configured timeout.
    pub fn expire(&mut self, now: Instant) -> usize {
        let mut expired = 0;
        while let Some((_, key)) = self.by_age.first_key_value() {
            let key = *key;
            let stale = self.pending.get(&key).is_some_and(|pending| {
                now.saturating_duration_since(pending.started) >= self.config.timeout
            });
            if !stale {
                break;
            }
            if let Some(pending) = self.remove(&key) {
                warn!(
                    sender = %key.0,
                    sequence = key.1,
                    channel = %pending.channel,
                    received = pending.received,
                    total = pending.chunks.len(),
                    "dropping incomplete message after timeout"
                );
            }
            self.stats.expired += 1;
            expired += 1;
        }
        expired
    }

    /// Number of incomplete messages held.
    pub fn pending_messages(&self) -> usize {
        self.pending.len()
    }

    /// Payload bytes held across incomplete messages.
    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    pub fn stats(&self) -> ReassemblyStats {
        self.stats
    }

    fn evict_oldest(&mut self) -> bool {
        let Some((_, key)) = self.by_age.first_key_value() else {
            return false;
        };
        let key = *key;
        if let Some(pending) = self.remove(&key) {
            warn!(
                sender = %key.0,
                sequence = key.1,
                channel = %pending.channel,
                "evicting incomplete message; reassembly buffer full"
            );
        }
        self.stats.evicted += 1;
        true
    }

    fn remove(&mut self, key: &FragmentKey) -> Option<PendingMessage> {
        let pending = self.pending.remove(key)?;
        self.by_age.remove(&pending.generation);
        self.pending_bytes -= pending.bytes;
        Some(pending)
    }
}

fn join(chunks: Vec<Option<Bytes>>, len: usize) -> Bytes {
    let mut out = BytesMut::with_capacity(len);
    for chunk in chunks.into_iter().flatten() {
        out.extend_from_slice(&chunk);
    }
    out.freeze()
}
