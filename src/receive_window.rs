use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{DeliveryMode, GroupConfig};
use crate::delivery::{Delivery, MessageListener};
use crate::error::DeliveryError;
use crate::messaging::node_addr::NodeAddr;
use crate::retransmit::gap_tracker::GapTracker;
use crate::seqno::Seqno;
use crate::table::missing::SeqnoRanges;
use crate::table::{SeqnoTable, Watermarks};
use crate::util::random::Random;

/// Everything a delivery layer keeps per remote sender on the receiving side: the sender's table,
///  the state of its gaps, and the application listener messages are delivered to.
pub struct ReceiveWindow {
    sender: NodeAddr,
    multicast: bool,
    table: SeqnoTable<Bytes>,
    gap_tracker: Mutex<GapTracker>,
    /// set after a permanent loss in strict mode
    halted: AtomicBool,

    delivery_mode: DeliveryMode,
    max_drain_batch: usize,
    max_gap_scan: u64,
    listener: Arc<dyn MessageListener>,
}

impl ReceiveWindow {
    pub fn new(sender: NodeAddr, multicast: bool, watermarks: Watermarks, config: &GroupConfig, listener: Arc<dyn MessageListener>) -> ReceiveWindow {
        ReceiveWindow {
            sender,
            multicast,
            table: SeqnoTable::with_watermarks(watermarks, &config.table),
            gap_tracker: Mutex::new(GapTracker::new(&config.retransmit)),
            halted: AtomicBool::new(false),
            delivery_mode: config.delivery_mode,
            max_drain_batch: config.table.max_drain_batch,
            max_gap_scan: config.retransmit.max_xmit_req_size.saturating_mul(4),
            listener,
        }
    }

    pub fn sender(&self) -> NodeAddr {
        self.sender
    }

    pub fn table(&self) -> &SeqnoTable<Bytes> {
        &self.table
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    pub fn add(&self, seqno: Seqno, payload: Bytes) -> bool {
        if self.is_halted() {
            return false;
        }
        self.table.add(seqno, payload)
    }

    /// Delivers everything that is deliverable, unless some other task is delivering from this
    ///  window already. Returns the number of delivered messages.
    pub fn drain(&self) -> usize {
        if self.is_halted() {
            return 0;
        }
        let Some(mut guard) = self.table.try_drain() else {
            return 0;
        };

        let mut num_delivered = 0;
        loop {
            let batch = guard.remove_many(self.max_drain_batch);
            if !batch.is_empty() {
                num_delivered += batch.len();
                for (seqno, payload) in batch {
                    self.listener.deliver(Delivery {
                        sender: self.sender,
                        seqno,
                        multicast: self.multicast,
                        payload,
                    });
                }
                continue;
            }
            match guard.try_release() {
                Ok(()) => break,
                Err(g) => guard = g,
            }
        }
        num_delivered
    }

    /// Drains, and then drops everything that was delivered. For windows whose messages are never
    ///  served to other members, so that rows are released as delivery progresses.
    pub fn drain_and_purge(&self) -> usize {
        let num_delivered = self.drain();
        let watermarks = self.table.watermarks();
        if watermarks.highest_delivered > watermarks.low {
            self.table.purge(watermarks.highest_delivered);
        }
        num_delivered
    }

    /// One retransmission tick: returns the seqnos to request from the sender now, and the
    ///  number of seqnos that were skipped because they exhausted their retries.
    pub fn retransmit_tick<R: Random>(&self, now: Instant) -> (SeqnoRanges, u64) {
        if self.is_halted() {
            return (SeqnoRanges::new(), 0);
        }

        let missing = self.table.missing(self.max_gap_scan);
        let tick = self.gap_tracker.lock()
            .unwrap_or_else(|e| e.into_inner())
            .tick::<R>(now, &missing);

        let num_skipped = if tick.exhausted.is_empty() {
            0
        }
        else {
            warn!("giving up on retransmission of {:?} from {:?}", tick.exhausted, self.sender);
            self.on_lost(tick.exhausted)
        };
        (tick.request, num_skipped)
    }

    /// The sender no longer has anything below `first_available`. Returns the number of skipped
    ///  seqnos.
    pub fn on_first_available(&self, first_available: Seqno) -> u64 {
        if self.is_halted() {
            return 0;
        }

        let up_to = first_available.prev();
        self.table.raise_highest_received(up_to);
        let mut lost = self.table.missing(u64::MAX);
        lost.remove_higher_than(up_to);
        if lost.is_empty() {
            debug!("{:?} has nothing below {}, but nothing is missing there", self.sender, first_available);
            return 0;
        }

        warn!("{:?} no longer has {:?}", self.sender, lost);
        self.on_lost(lost)
    }

    fn on_lost(&self, lost: SeqnoRanges) -> u64 {
        match self.delivery_mode {
            DeliveryMode::Lenient => {
                let num_skipped = self.table.mark_lost(&lost);
                self.listener.on_delivery_error(DeliveryError::MessagesSkipped {
                    sender: self.sender,
                    missing: lost,
                });
                self.drain();
                num_skipped
            }
            DeliveryMode::Strict => {
                self.halted.store(true, Ordering::Release);
                self.gap_tracker.lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clear();
                self.listener.on_delivery_error(DeliveryError::PermanentLoss {
                    sender: self.sender,
                    missing: lost,
                });
                0
            }
        }
    }
}
