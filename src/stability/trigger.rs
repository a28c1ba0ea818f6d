use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Notify;

/// Counts payload bytes received by the multicast layer and wakes up the stability layer once
///  the configured threshold is crossed. The count is reset whenever a round starts.
#[derive(Debug)]
pub struct StabilityTrigger {
    max_bytes: u64,
    num_bytes: AtomicU64,
    notify: Notify,
}

impl StabilityTrigger {
    /// `max_bytes == 0` disables the trigger
    pub fn new(max_bytes: u64) -> StabilityTrigger {
        StabilityTrigger {
            max_bytes,
            num_bytes: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    pub fn add_bytes(&self, n: u64) {
        if self.max_bytes == 0 {
            return;
        }
        let prev = self.num_bytes.fetch_add(n, Ordering::AcqRel);
        if prev < self.max_bytes && prev.saturating_add(n) >= self.max_bytes {
            self.notify.notify_one();
        }
    }

    /// Completes once the threshold was crossed. A crossing that happens while nobody waits is
    ///  remembered for the next call.
    pub async fn triggered(&self) {
        self.notify.notified().await
    }

    pub fn reset(&self) {
        self.num_bytes.store(0, Ordering::Release);
    }

    pub fn num_bytes(&self) -> u64 {
        self.num_bytes.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_trigger() {
        let trigger = StabilityTrigger::new(100);
        trigger.add_bytes(60);
        assert!(timeout(Duration::from_millis(10), trigger.triggered()).await.is_err());

        trigger.add_bytes(60);
        assert!(timeout(Duration::from_millis(10), trigger.triggered()).await.is_ok());
        assert_eq!(trigger.num_bytes(), 120);

        // no second notification without a reset
        trigger.add_bytes(60);
        assert!(timeout(Duration::from_millis(10), trigger.triggered()).await.is_err());

        trigger.reset();
        trigger.add_bytes(100);
        assert!(timeout(Duration::from_millis(10), trigger.triggered()).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled() {
        let trigger = StabilityTrigger::new(0);
        trigger.add_bytes(1_000_000);
        assert_eq!(trigger.num_bytes(), 0);
        assert!(timeout(Duration::from_millis(10), trigger.triggered()).await.is_err());
    }
}
