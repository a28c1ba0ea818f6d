use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use anyhow::anyhow;
use bytes::Bytes;
use tokio::time::Instant;
use tracing::trace;

use crate::seqno::Seqno;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum XmitLookup {
    Found(Bytes),
    /// the seqno is no longer buffered; the requester should move on to `first_available`
    Purged { first_available: Seqno },
    /// the seqno was never sent
    NotSent,
}

struct SentEntry {
    payload: Bytes,
    sent_at: Instant,
}

#[derive(Default)]
struct BufferInner {
    entries: BTreeMap<Seqno, SentEntry>,
    highest_sent: Seqno,
    /// everything at or below this seqno was purged
    low: Seqno,
    num_bytes: usize,
}

impl BufferInner {
    fn remove_up_to(&mut self, up_to: Seqno) -> usize {
        let mut released = 0;
        while let Some(entry) = self.entries.first_entry() {
            if *entry.key() > up_to {
                break;
            }
            released += entry.remove().payload.len();
        }
        self.num_bytes -= released;
        if up_to > self.low {
            self.low = up_to;
        }
        released
    }
}

/// The sending side's copy of messages that may still be requested for retransmission. Seqnos
///  are assigned here, so they are strictly increasing without gaps.
///
/// Entries are removed when they are known to be stable / acknowledged, or optionally when they
///  exceed a maximum age.
#[derive(Default)]
pub struct RetransmitBuffer {
    inner: RwLock<BufferInner>,
}

impl RetransmitBuffer {
    pub fn new() -> RetransmitBuffer {
        Default::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BufferInner> {
        self.inner.read()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BufferInner> {
        self.inner.write()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Assigns the next seqno to a message and stores it. Seqno exhaustion is an error.
    pub fn append(&self, payload: Bytes) -> anyhow::Result<Seqno> {
        let mut inner = self.write();
        let seqno = inner.highest_sent.next()
            .ok_or_else(|| anyhow!("seqnos are exhausted"))?;

        inner.num_bytes += payload.len();
        inner.entries.insert(seqno, SentEntry {
            payload,
            sent_at: Instant::now(),
        });
        inner.highest_sent = seqno;
        Ok(seqno)
    }

    pub fn lookup(&self, seqno: Seqno) -> XmitLookup {
        let inner = self.read();
        if let Some(entry) = inner.entries.get(&seqno) {
            return XmitLookup::Found(entry.payload.clone());
        }
        if seqno > inner.highest_sent || seqno == Seqno::ZERO {
            return XmitLookup::NotSent;
        }
        let first_available = inner.entries.range(seqno..)
            .next()
            .map(|(&s, _)| s)
            .unwrap_or_else(|| inner.highest_sent.saturating_add(1));
        XmitLookup::Purged { first_available }
    }

    /// Removes everything up to and including `up_to`, returning the number of payload bytes
    ///  released.
    pub fn purge(&self, up_to: Seqno) -> usize {
        let mut inner = self.write();
        let up_to = up_to.min(inner.highest_sent);
        if up_to <= inner.low {
            return 0;
        }
        let released = inner.remove_up_to(up_to);
        trace!("purged retransmission buffer up to {}, released {} bytes", up_to, released);
        released
    }

    /// Removes the oldest entries that were sent more than `max_age` ago, returning the number of
    ///  payload bytes released.
    pub fn expire(&self, now: Instant, max_age: Duration) -> usize {
        let mut inner = self.write();
        let expired_up_to = inner.entries.iter()
            .take_while(|(_, e)| e.sent_at + max_age <= now)
            .last()
            .map(|(&s, _)| s);

        match expired_up_to {
            Some(up_to) => inner.remove_up_to(up_to),
            None => 0,
        }
    }

    /// the oldest message that is still buffered
    pub fn first(&self) -> Option<(Seqno, Bytes)> {
        self.read().entries.first_key_value()
            .map(|(&s, e)| (s, e.payload.clone()))
    }

    pub fn highest_sent(&self) -> Seqno {
        self.read().highest_sent
    }

    pub fn low(&self) -> Seqno {
        self.read().low
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    pub fn num_bytes(&self) -> usize {
        self.read().num_bytes
    }
}
