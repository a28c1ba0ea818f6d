use std::sync::atomic::{AtomicUsize, Ordering};

/// Single-drainer flag: of all tasks adding to a table concurrently, at most one removes and
///  delivers messages at any given time. The flag is never waited on.
///
/// The flag is a counter of 'drain requests'. A task increments it after adding to the table,
///  and the task that moves it away from zero becomes the drainer. The drainer only gives up
///  the flag when no further requests arrived while it was draining, so a message added
///  concurrently with the end of a drain pass is picked up by the drainer rather than being
///  stranded.
#[derive(Debug, Default)]
pub struct DrainFlag {
    requests: AtomicUsize,
}

impl DrainFlag {
    pub fn new() -> DrainFlag {
        Default::default()
    }

    /// Registers a drain request. Returns the number of requests this caller is now responsible
    ///  for if it became the drainer, `None` if some other task currently holds the flag.
    pub fn try_acquire(&self) -> Option<usize> {
        if self.requests.fetch_add(1, Ordering::AcqRel) == 0 {
            Some(1)
        }
        else {
            None
        }
    }

    /// Attempts to hand back the flag after `observed` requests were handled. Returns `Ok` if the
    ///  flag was released, or the number of requests that arrived in the meantime if the caller
    ///  must do another drain pass.
    pub fn try_release(&self, observed: usize) -> Result<(), usize> {
        let prev = self.requests.fetch_sub(observed, Ordering::AcqRel);
        if prev == observed {
            Ok(())
        }
        else {
            Err(prev - observed)
        }
    }

    /// Unconditionally clears the flag. This is for abandoning a drain, e.g. when a drain guard
    ///  is dropped without being released. Requests that arrived meanwhile are dropped with it:
    ///  the next caller of [DrainFlag::try_acquire] becomes the drainer and picks up their
    ///  messages, whereas a counter left above zero would have no drainer.
    pub fn reset(&self) {
        self.requests.store(0, Ordering::Release);
    }

    #[cfg(test)]
    fn is_held(&self) -> bool {
        self.requests.load(Ordering::Acquire) != 0
    }
}
