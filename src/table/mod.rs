//! The per-sender receive buffer.
//!
//! A [SeqnoTable] stores messages that were received out of order, indexed by sequence number,
//!  and hands them out strictly in order once gaps are closed. It tracks three watermarks:
//!
//! ```ascii
//!        low        highest_delivered   highest_received
//!         |                 |                  |
//!   ... --+-----------------+------------------+--> seqno
//!  purged  delivered,        stored or missing
//!          retained until
//!          purged
//! ```
//!
//! `low <= highest_delivered <= highest_received` holds at all times, and all three are
//!  monotonic. Messages are stored in fixed-size rows, and a row is freed once all of its slots
//!  are at or below `low`.

pub mod drain;
pub mod missing;

use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::sync::{Mutex, MutexGuard};

use tracing::{trace, warn};

use crate::config::TableConfig;
use crate::seqno::Seqno;
use crate::table::drain::DrainFlag;
use crate::table::missing::SeqnoRanges;

#[derive(Clone, Copy, Default, Eq, PartialEq, Debug)]
pub struct Watermarks {
    pub low: Seqno,
    pub highest_delivered: Seqno,
    pub highest_received: Seqno,
}

impl Watermarks {
    pub fn new(low: Seqno, highest_delivered: Seqno, highest_received: Seqno) -> Watermarks {
        Watermarks {
            low,
            highest_delivered,
            highest_received,
        }
    }

    /// all three watermarks at the same value, which is what a fresh table starts with
    pub fn at(seqno: Seqno) -> Watermarks {
        Watermarks::new(seqno, seqno, seqno)
    }

    pub fn is_consistent(&self) -> bool {
        self.low <= self.highest_delivered && self.highest_delivered <= self.highest_received
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TableStats {
    pub size: usize,
    pub num_rows: usize,
    pub capacity: usize,
    pub num_purges: u64,
    pub num_row_allocations: u64,
}

enum Slot<T> {
    Present(T),
    /// given up on; drained like a message, but never delivered
    Lost,
}

type Row<T> = Vec<Option<Slot<T>>>;

struct TableInner<T> {
    rows: VecDeque<Option<Row<T>>>,
    /// seqno of the first slot of the first row
    offset: u64,
    low: Seqno,
    hd: Seqno,
    hr: Seqno,
    size: usize,
    num_purges: u64,
    num_row_allocations: u64,
}

impl<T> TableInner<T> {
    fn locate(&self, seqno: Seqno, row_size: usize) -> Option<(usize, usize)> {
        let idx = seqno.to_raw().checked_sub(self.offset)?;
        let row = usize::try_from(idx / row_size as u64).ok()?;
        Some((row, (idx % row_size as u64) as usize))
    }

    fn slot(&self, seqno: Seqno, row_size: usize) -> Option<&Slot<T>> {
        let (row, col) = self.locate(seqno, row_size)?;
        self.rows.get(row)?.as_ref()?[col].as_ref()
    }

    fn slot_mut(&mut self, seqno: Seqno, row_size: usize) -> Option<&mut Option<Slot<T>>> {
        let (row, col) = self.locate(seqno, row_size)?;
        self.rows.get_mut(row)?
            .as_mut()
            .map(|r| &mut r[col])
    }

    fn slot_mut_allocating(&mut self, seqno: Seqno, row_size: usize) -> Option<&mut Option<Slot<T>>> {
        let (row, col) = self.locate(seqno, row_size)?;
        if row >= self.rows.len() {
            self.rows.resize_with(row + 1, || None);
        }
        let r = &mut self.rows[row];
        if r.is_none() {
            *r = Some((0..row_size).map(|_| None).collect());
            self.num_row_allocations += 1;
        }
        r.as_mut().map(|r| &mut r[col])
    }

    fn clear_slot(&mut self, seqno: Seqno, row_size: usize) {
        if let Some(slot) = self.slot_mut(seqno, row_size) {
            if let Some(Slot::Present(_)) = slot.take() {
                self.size -= 1;
            }
        }
    }

    /// drops all rows that lie entirely at or below `low`
    fn free_rows(&mut self, row_size: usize) {
        while !self.rows.is_empty() && self.offset + row_size as u64 - 1 <= self.low.to_raw() {
            if let Some(Some(row)) = self.rows.pop_front() {
                self.size -= row.iter().filter(|s| matches!(s, Some(Slot::Present(_)))).count();
            }
            self.offset += row_size as u64;
        }
    }

    /// discards all rows and restarts indexing immediately above the highest delivered seqno
    fn rebase(&mut self) {
        self.rows.clear();
        self.size = 0;
        self.offset = self.hd.to_raw() + 1;
    }

    fn allocated_up_to(&self, row_size: usize) -> u64 {
        (self.offset + (self.rows.len() * row_size) as u64).saturating_sub(1)
    }
}

/// Receive buffer for the messages of a single sender. All operations take `&self` and are safe
///  to call concurrently; removing messages for delivery requires holding the table's drain flag
///  (see [SeqnoTable::try_drain]).
pub struct SeqnoTable<T> {
    row_size: usize,
    max_window: u64,
    discard_delivered: bool,
    inner: Mutex<TableInner<T>>,
    drain_flag: DrainFlag,
}

impl<T: Clone> Debug for SeqnoTable<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let wm = self.watermarks();
        write!(f, "SeqnoTable{{low:{},hd:{},hr:{}}}", wm.low, wm.highest_delivered, wm.highest_received)
    }
}

impl<T: Clone> SeqnoTable<T> {
    pub fn new(initial: Seqno, config: &TableConfig) -> SeqnoTable<T> {
        Self::with_watermarks(Watermarks::at(initial), config)
    }

    /// The watermarks are assumed to be consistent, i.e. `low <= hd <= hr`.
    pub fn with_watermarks(watermarks: Watermarks, config: &TableConfig) -> SeqnoTable<T> {
        SeqnoTable {
            row_size: config.row_size.max(1),
            max_window: config.max_window.max(1),
            discard_delivered: config.discard_delivered,
            inner: Mutex::new(TableInner {
                rows: VecDeque::new(),
                offset: watermarks.highest_delivered.to_raw() + 1,
                low: watermarks.low,
                hd: watermarks.highest_delivered,
                hr: watermarks.highest_received,
                size: 0,
                num_purges: 0,
                num_row_allocations: 0,
            }),
            drain_flag: DrainFlag::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TableInner<T>> {
        self.inner.lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn window_end(&self, hd: Seqno) -> Seqno {
        hd.saturating_add(self.max_window)
    }

    /// Stores a message. Returns `false` if the seqno was already delivered or purged, if the
    ///  slot is already filled, or if the seqno is too far ahead of the delivered watermark.
    pub fn add(&self, seqno: Seqno, msg: T) -> bool {
        let mut inner = self.lock();
        let window_end = self.window_end(inner.hd);
        Self::do_add(&mut inner, seqno, msg, self.row_size, window_end)
    }

    fn do_add(inner: &mut TableInner<T>, seqno: Seqno, msg: T, row_size: usize, window_end: Seqno) -> bool {
        if seqno <= inner.hd {
            trace!("seqno {} was already delivered - ignoring", seqno);
            return false;
        }
        if seqno > window_end {
            warn!("seqno {} is beyond the receive window ending at {} - ignoring", seqno, window_end);
            return false;
        }

        let slot = match inner.slot_mut_allocating(seqno, row_size) {
            Some(slot) => slot,
            None => return false,
        };
        if let Some(Slot::Present(_)) = slot {
            trace!("duplicate seqno {} - ignoring", seqno);
            return false;
        }
        *slot = Some(Slot::Present(msg));
        inner.size += 1;
        if seqno > inner.hr {
            inner.hr = seqno;
        }
        true
    }

    /// Adds a batch of messages under a single lock, returning the number of messages that were
    ///  actually stored.
    pub fn add_all(&self, msgs: impl IntoIterator<Item=(Seqno, T)>) -> usize {
        let mut inner = self.lock();
        let window_end = self.window_end(inner.hd);
        msgs.into_iter()
            .map(|(seqno, msg)| Self::do_add(&mut inner, seqno, msg, self.row_size, window_end))
            .filter(|&added| added)
            .count()
    }

    /// Returns a stored message. Delivered messages are available until they are purged, unless
    ///  the table discards messages on delivery.
    pub fn get(&self, seqno: Seqno) -> Option<T> {
        let inner = self.lock();
        if seqno <= inner.low {
            return None;
        }
        match inner.slot(seqno, self.row_size) {
            Some(Slot::Present(msg)) => Some(msg.clone()),
            _ => None,
        }
    }

    /// Tries to become the (single) drainer of this table. This never blocks: if some other task
    ///  is draining, it returns `None`, and that other task is guaranteed to see everything that
    ///  was added before this call.
    pub fn try_drain(&self) -> Option<DrainGuard<'_, T>> {
        self.drain_flag.try_acquire()
            .map(|observed| DrainGuard {
                table: self,
                observed,
                released: false,
            })
    }

    fn remove_many(&self, max: usize) -> Vec<(Seqno, T)> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let mut result = Vec::new();

        while result.len() < max && inner.hd < inner.hr {
            let Some(seqno) = inner.hd.next() else { break };
            let Some(slot) = inner.slot_mut(seqno, self.row_size) else { break };
            let delivered = match slot {
                Some(Slot::Present(msg)) => {
                    let msg = msg.clone();
                    if self.discard_delivered {
                        *slot = None;
                    }
                    Some(msg)
                }
                Some(Slot::Lost) => {
                    *slot = None;
                    None
                }
                None => break,
            };
            if let Some(msg) = delivered {
                if self.discard_delivered {
                    inner.size -= 1;
                }
                result.push((seqno, msg));
            }
            inner.hd = seqno;
        }
        result
    }

    /// Raises `low` to `up_to`, but never above the highest delivered seqno: undelivered messages
    ///  are never purged. Returns the resulting `low`.
    pub fn purge(&self, up_to: Seqno) -> Seqno {
        let mut inner = self.lock();
        let mut up_to = up_to;
        if up_to > inner.hd {
            warn!("request to purge up to {} which is above highest delivered {} - purging only up to {}", up_to, inner.hd, inner.hd);
            up_to = inner.hd;
        }
        if up_to <= inner.low {
            return inner.low;
        }

        let mut seqno = inner.low.max(Seqno::from_raw(inner.offset.saturating_sub(1)));
        while seqno < up_to && seqno.to_raw() < inner.offset + (inner.rows.len() * self.row_size) as u64 {
            let Some(next) = seqno.next() else { break };
            seqno = next;
            inner.clear_slot(seqno, self.row_size);
        }

        inner.low = up_to;
        inner.num_purges += 1;
        inner.free_rows(self.row_size);
        inner.low
    }

    /// Gives up on the given seqnos: they are drained without being delivered. Seqnos that are
    ///  already delivered or present are not affected. Returns the number of seqnos that were
    ///  actually marked.
    pub fn mark_lost(&self, seqnos: &SeqnoRanges) -> u64 {
        let mut inner = self.lock();
        let window_end = self.window_end(inner.hd);
        let mut num_marked = 0;
        for seqno in seqnos.iter() {
            if seqno <= inner.hd {
                continue;
            }
            if seqno > window_end {
                break;
            }
            if let Some(slot) = inner.slot_mut_allocating(seqno, self.row_size) {
                if slot.is_none() {
                    *slot = Some(Slot::Lost);
                    num_marked += 1;
                }
            }
            if seqno > inner.hr {
                inner.hr = seqno;
            }
        }
        num_marked
    }

    /// Raises the highest received seqno without storing a message, e.g. because the sender
    ///  announced its highest seqno. This makes the gap up to `seqno` visible as missing.
    pub fn raise_highest_received(&self, seqno: Seqno) -> bool {
        let mut inner = self.lock();
        let seqno = seqno.min(self.window_end(inner.hd));
        if seqno > inner.hr {
            inner.hr = seqno;
            true
        }
        else {
            false
        }
    }

    /// Merges remote watermarks into this table, raising every watermark that is lower locally
    ///  and never lowering any. Messages at or below a raised `highest_delivered` are dropped
    ///  without being delivered. This is idempotent.
    pub fn raise_watermarks(&self, remote: Watermarks) -> bool {
        let mut inner = self.lock();
        let mut changed = false;

        if remote.highest_delivered > inner.hd {
            let old_hd = inner.hd;
            inner.hd = remote.highest_delivered;
            if inner.hd.to_raw() >= inner.allocated_up_to(self.row_size) {
                inner.rebase();
            }
            else {
                let mut seqno = old_hd;
                while seqno < remote.highest_delivered {
                    let Some(next) = seqno.next() else { break };
                    seqno = next;
                    inner.clear_slot(seqno, self.row_size);
                }
            }
            changed = true;
        }

        let new_hr = remote.highest_received.max(inner.hd);
        if new_hr > inner.hr {
            inner.hr = new_hr.min(self.window_end(inner.hd));
            changed = true;
        }

        let new_low = remote.low.min(inner.hd);
        if new_low > inner.low {
            inner.low = new_low;
            inner.free_rows(self.row_size);
            changed = true;
        }

        changed
    }

    /// Missing seqnos between highest delivered and highest received, oldest first and limited to
    ///  `max` seqnos.
    pub fn missing(&self, max: u64) -> SeqnoRanges {
        let inner = self.lock();
        let mut result = SeqnoRanges::new();
        let mut num_missing = 0;
        let mut seqno = inner.hd;
        while seqno < inner.hr && num_missing < max {
            let Some(next) = seqno.next() else { break };
            seqno = next;
            if inner.slot(seqno, self.row_size).is_none() {
                result.push(seqno);
                num_missing += 1;
            }
        }
        result
    }

    pub fn num_missing(&self) -> u64 {
        self.missing(u64::MAX).num_seqnos()
    }

    /// the highest seqno that would be reached by draining now
    pub fn highest_deliverable(&self) -> Seqno {
        let inner = self.lock();
        let mut seqno = inner.hd;
        while seqno < inner.hr {
            let Some(next) = seqno.next() else { break };
            if inner.slot(next, self.row_size).is_none() {
                break;
            }
            seqno = next;
        }
        seqno
    }

    pub fn watermarks(&self) -> Watermarks {
        let inner = self.lock();
        Watermarks::new(inner.low, inner.hd, inner.hr)
    }

    /// true if everything up to the highest received seqno was delivered
    pub fn is_fully_delivered(&self) -> bool {
        let inner = self.lock();
        inner.hd == inner.hr
    }

    /// number of stored messages, including delivered messages that are retained
    pub fn size(&self) -> usize {
        self.lock().size
    }

    pub fn stats(&self) -> TableStats {
        let inner = self.lock();
        TableStats {
            size: inner.size,
            num_rows: inner.rows.iter().filter(|r| r.is_some()).count(),
            capacity: inner.rows.len() * self.row_size,
            num_purges: inner.num_purges,
            num_row_allocations: inner.num_row_allocations,
        }
    }
}

/// Proof of holding a table's drain flag. Drain in a loop until [DrainGuard::try_release]
///  succeeds:
///
/// ```ignore
/// if let Some(mut guard) = table.try_drain() {
///     loop {
///         let batch = guard.remove_many(100);
///         if !batch.is_empty() {
///             deliver(batch);
///             continue;
///         }
///         match guard.try_release() {
///             Ok(()) => break,
///             Err(g) => guard = g,
///         }
///     }
/// }
/// ```
pub struct DrainGuard<'a, T: Clone> {
    table: &'a SeqnoTable<T>,
    observed: usize,
    released: bool,
}

impl<T: Clone> DrainGuard<'_, T> {
    /// Removes up to `max` messages in seqno order, advancing the highest delivered seqno across
    ///  the contiguous run of present (or given-up) slots.
    pub fn remove_many(&mut self, max: usize) -> Vec<(Seqno, T)> {
        self.table.remove_many(max)
    }

    /// Releases the drain flag, unless more messages were added while draining, in which case
    ///  the guard is handed back for another pass.
    pub fn try_release(mut self) -> Result<(), Self> {
        match self.table.drain_flag.try_release(self.observed) {
            Ok(()) => {
                self.released = true;
                Ok(())
            }
            Err(pending) => {
                self.observed = pending;
                Err(self)
            }
        }
    }
}

impl<T: Clone> Drop for DrainGuard<'_, T> {
    fn drop(&mut self) {
        if !self.released {
            self.table.drain_flag.reset();
        }
    }
}
