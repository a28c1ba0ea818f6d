use std::sync::atomic::{AtomicU64, Ordering};

/// Counters of a delivery layer. They are updated with relaxed atomics and read as a (not
///  necessarily consistent) [DeliveryStatsSnapshot].
#[derive(Debug, Default)]
pub struct DeliveryStats {
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub duplicates_received: AtomicU64,
    pub xmit_requests_sent: AtomicU64,
    pub xmit_requests_received: AtomicU64,
    pub xmit_responses_sent: AtomicU64,
    pub xmit_responses_received: AtomicU64,
    pub messages_skipped: AtomicU64,
    pub acks_sent: AtomicU64,
    pub acks_received: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct DeliveryStatsSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub duplicates_received: u64,
    pub xmit_requests_sent: u64,
    pub xmit_requests_received: u64,
    pub xmit_responses_sent: u64,
    pub xmit_responses_received: u64,
    pub messages_skipped: u64,
    pub acks_sent: u64,
    pub acks_received: u64,
}

impl DeliveryStats {
    pub fn inc(counter: &AtomicU64) {
        Self::add(counter, 1);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        if n > 0 {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> DeliveryStatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        DeliveryStatsSnapshot {
            messages_sent: get(&self.messages_sent),
            messages_received: get(&self.messages_received),
            duplicates_received: get(&self.duplicates_received),
            xmit_requests_sent: get(&self.xmit_requests_sent),
            xmit_requests_received: get(&self.xmit_requests_received),
            xmit_responses_sent: get(&self.xmit_responses_sent),
            xmit_responses_received: get(&self.xmit_responses_received),
            messages_skipped: get(&self.messages_skipped),
            acks_sent: get(&self.acks_sent),
            acks_received: get(&self.acks_received),
        }
    }
}
