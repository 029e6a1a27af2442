use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use log::debug;

use super::wire::Fragment;

pub const MAX_PENDING_MESSAGES: usize = 1000;
pub const MAX_PENDING_BYTES: usize = 16 * 1024 * 1024;

/// In-flight messages are keyed by sender address and message sequence.
type Key = (SocketAddr, u32);

#[derive(Debug, PartialEq, Eq)]
pub struct Reassembled {
    pub channel: String,
    pub payload: Vec<u8>,
    /// Receive time of the first fragment.
    pub recv_timestamp_us: i64,
}

struct Partial {
    channel: Option<String>,
    data: Vec<u8>,
    received: Vec<bool>,
    remaining: usize,
    first_recv_us: i64,
    last_touch: Instant,
}

/// Bounded table of partially received fragmented messages.
///
/// Entries idle longer than the staleness timeout are evicted whenever a
/// fragment arrives or [`Reassembler::evict_stale`] runs; when the table is
/// full by count or bytes, the least recently touched entry goes first.
pub struct Reassembler {
    pending: HashMap<Key, Partial>,
    pending_bytes: usize,
    max_messages: usize,
    max_bytes: usize,
    timeout: Duration,
}

impl Reassembler {
    pub fn new(timeout: Duration) -> Self {
        Self::with_limits(timeout, MAX_PENDING_MESSAGES, MAX_PENDING_BYTES)
    }

    pub fn with_limits(timeout: Duration, max_messages: usize, max_bytes: usize) -> Self {
        Self {
            pending: HashMap::new(),
            pending_bytes: 0,
            max_messages,
            max_bytes,
            timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    /// Adds one fragment, returning the message it completes.
    pub fn insert(
        &mut self,
        sender: SocketAddr,
        fragment: Fragment<'_>,
        now: Instant,
        recv_us: i64,
    ) -> Option<Reassembled> {
        self.evict_stale(now);

        let size = fragment.msg_size as usize;
        if size > self.max_bytes {
            debug!("udpm: dropping {size} byte message from {sender}: exceeds reassembly limit");
            return None;
        }

        let key = (sender, fragment.seq);
        let mismatched = self.pending.get(&key).map_or(false, |p| {
            p.data.len() != size || p.received.len() != fragment.count as usize
        });
        if mismatched {
            debug!("udpm: {sender} reused sequence {} with a new shape", fragment.seq);
            self.remove(&key);
        }

        if !self.pending.contains_key(&key) {
            self.make_room(size);
            self.pending.insert(
                key,
                Partial {
                    channel: None,
                    data: vec![0u8; size],
                    received: vec![false; fragment.count as usize],
                    remaining: fragment.count as usize,
                    first_recv_us: recv_us,
                    last_touch: now,
                },
            );
            self.pending_bytes += size;
        }

        let partial = self.pending.get_mut(&key)?;
        partial.last_touch = now;
        let index = fragment.index as usize;
        let start = fragment.offset as usize;
        let end = start.checked_add(fragment.data.len())?;
        if index >= partial.received.len() || end > partial.data.len() || partial.received[index] {
            return None;
        }
        partial.received[index] = true;
        partial.remaining -= 1;
        if let Some(channel) = fragment.channel {
            partial.channel = Some(channel.to_string());
        }
        partial.data[start..end].copy_from_slice(fragment.data);

        if partial.remaining > 0 {
            return None;
        }
        let done = self.remove(&key)?;
        match done.channel {
            Some(channel) => Some(Reassembled {
                channel,
                payload: done.data,
                recv_timestamp_us: done.first_recv_us,
            }),
            None => None,
        }
    }

    /// Drops entries that have not seen a fragment within the timeout.
    pub fn evict_stale(&mut self, now: Instant) {
        let timeout = self.timeout;
        let stale: Vec<Key> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.last_touch) > timeout)
            .map(|(key, _)| *key)
            .collect();
        for key in stale {
            if let Some(p) = self.remove(&key) {
                debug!(
                    "udpm: evicting stale message {} from {} ({} fragments missing)",
                    key.1, key.0, p.remaining
                );
            }
        }
    }

    fn make_room(&mut self, incoming: usize) {
        while !self.pending.is_empty()
            && (self.pending.len() >= self.max_messages
                || self.pending_bytes + incoming > self.max_bytes)
        {
            let oldest = self
                .pending
                .iter()
                .min_by_key(|(_, p)| p.last_touch)
                .map(|(key, _)| *key);
            match oldest {
                Some(key) => {
                    debug!("udpm: reassembly table full, evicting message {} from {}", key.1, key.0);
                    self.remove(&key);
                }
                None => break,
            }
        }
    }

    fn remove(&mut self, key: &Key) -> Option<Partial> {
        let partial = self.pending.remove(key)?;
        self.pending_bytes -= partial.data.len();
        Some(partial)
    }
}
