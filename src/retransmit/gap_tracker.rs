use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::config::RetransmitConfig;
use crate::retransmit::backoff::XmitBackoff;
use crate::seqno::Seqno;
use crate::table::missing::SeqnoRanges;
use crate::util::random::{jittered, Random};

struct PendingXmit {
    detected_at_tick: u64,
    attempts: u32,
    interval: Duration,
    due: Instant,
}

/// The result of a retransmission tick for one table
#[derive(Debug, Default, Eq, PartialEq)]
pub struct GapTick {
    /// seqnos to request now
    pub request: SeqnoRanges,
    /// seqnos for which the maximum number of requests went unanswered
    pub exhausted: SeqnoRanges,
}

/// Retransmission state for the gaps of a single table.
///
/// Every tick is passed the table's current gaps. A seqno that shows up for the first time is
///  'detected'; with first-tick suppression, it is requested only from the following tick on to
///  give messages that are merely reordered a chance to arrive. After a request, the seqno is
///  'pending' until its (backed off, jittered) deadline passes, and it is then requested again
///  until the maximum number of attempts is reached. Seqnos that are no longer missing are
///  dropped, and an empty set of gaps resets all state.
pub struct GapTracker {
    backoff: XmitBackoff,
    jitter_ratio: f64,
    suppress_first_tick: bool,
    max_attempts: u32,
    max_request_size: u64,

    tick_counter: u64,
    pending: BTreeMap<Seqno, PendingXmit>,
}

impl GapTracker {
    pub fn new(config: &RetransmitConfig) -> GapTracker {
        GapTracker {
            backoff: XmitBackoff::new(config),
            jitter_ratio: config.jitter_ratio,
            suppress_first_tick: config.suppress_first_tick,
            max_attempts: config.max_attempts,
            max_request_size: config.max_xmit_req_size,
            tick_counter: 0,
            pending: Default::default(),
        }
    }

    pub fn tick<R: Random>(&mut self, now: Instant, missing: &SeqnoRanges) -> GapTick {
        self.tick_counter += 1;

        let mut result = GapTick::default();
        if missing.is_empty() {
            self.pending.clear();
            return result;
        }

        self.pending.retain(|seqno, _| missing.contains(*seqno));

        let mut num_requested = 0;
        for seqno in missing.iter() {
            if num_requested >= self.max_request_size {
                break;
            }

            let pending = match self.pending.entry(seqno) {
                Entry::Vacant(e) => {
                    let pending = e.insert(PendingXmit {
                        detected_at_tick: self.tick_counter,
                        attempts: 0,
                        interval: self.backoff.initial(),
                        due: now,
                    });
                    if self.suppress_first_tick {
                        continue;
                    }
                    pending
                }
                Entry::Occupied(e) => {
                    let pending = e.into_mut();
                    if pending.detected_at_tick == self.tick_counter || pending.due > now {
                        continue;
                    }
                    pending
                }
            };

            if pending.attempts >= self.max_attempts {
                result.exhausted.push(seqno);
                continue;
            }

            if pending.attempts > 0 {
                pending.interval = self.backoff.next(pending.interval);
            }
            pending.attempts += 1;
            pending.due = now + jittered::<R>(pending.interval, self.jitter_ratio);
            result.request.push(seqno);
            num_requested += 1;
        }

        for seqno in result.exhausted.iter() {
            self.pending.remove(&seqno);
        }

        if !result.request.is_empty() || !result.exhausted.is_empty() {
            trace!("retransmission tick: requesting {:?}, exhausted {:?}", result.request, result.exhausted);
        }
        result
    }

    /// number of seqnos that were detected missing and not yet resolved
    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
