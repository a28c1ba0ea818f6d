use std::cmp::min;
use std::time::Duration;

use crate::config::RetransmitConfig;

/// Growth of the interval between retransmission requests for the same seqno: multiplied by a
///  factor (in eighths) per unanswered request, capped at a maximum.
#[derive(Debug, Clone)]
pub struct XmitBackoff {
    initial: Duration,
    max: Duration,
    factor_eighths: u32,
}

impl XmitBackoff {
    pub fn new(config: &RetransmitConfig) -> XmitBackoff {
        XmitBackoff {
            initial: config.interval,
            max: config.max_interval,
            factor_eighths: config.backoff_factor_eighths.max(8),
        }
    }

    pub fn initial(&self) -> Duration {
        self.initial
    }

    #[must_use]
    pub fn next(&self, current: Duration) -> Duration {
        let grown = (current * self.factor_eighths) / 8;
        min(grown, self.max)
    }
}
