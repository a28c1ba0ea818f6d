use std::time::Duration;

use anyhow::bail;

/// The layers that can be part of a group's protocol stack.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ProtocolKind {
    /// reliable, per-sender ordered multicast
    NakAck,
    /// reliable, ordered point-to-point messages
    Unicast,
    /// distributed garbage collection of multicast buffers; requires [ProtocolKind::NakAck]
    Stable,
}

/// What happens when a message is lost for good, i.e. its sender no longer has it or the
///  maximum number of retransmission requests was exhausted
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DeliveryMode {
    /// skip the lost messages, continue delivering everything after them and report the loss
    ///  to the application
    Lenient,
    /// report a fatal error and stop delivering messages from the affected sender
    Strict,
}

/// Behavior of a send call that finds no flow control credit
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FlowControlMode {
    /// wait for credit to become available
    Block,
    /// return immediately, leaving it to the caller to retry
    NonBlocking,
}

#[derive(Debug)]
pub struct GroupConfig {
    pub protocols: Vec<ProtocolKind>,

    pub delivery_mode: DeliveryMode,
    pub flow_control_mode: FlowControlMode,

    /// upper bound for an application payload. Larger messages are rejected on the send path;
    ///  fragmentation is the job of some other layer.
    pub max_message_size: usize,

    pub table: TableConfig,
    pub retransmit: RetransmitConfig,
    pub stability: StabilityConfig,
    pub unicast: UnicastConfig,
}

#[derive(Debug, Clone)]
pub struct TableConfig {
    /// number of slots per row of a table
    pub row_size: usize,
    /// maximum distance of an accepted seqno from the highest delivered seqno. This bounds the
    ///  memory a misbehaving or confused sender can make a receiver allocate.
    pub max_window: u64,
    /// If `false`, delivered messages are retained until they are purged by stability, which
    ///  allows answering retransmission requests for messages of other members.
    pub discard_delivered: bool,
    /// maximum number of messages removed from a table in one go
    pub max_drain_batch: usize,
}

#[derive(Debug, Clone)]
pub struct RetransmitConfig {
    /// base interval of the retransmission tick; configure to roughly twice the RTT
    pub interval: Duration,
    /// random jitter applied to retransmission deadlines, as a fraction of the interval
    pub jitter_ratio: f64,
    /// multiplicative backoff per unanswered request, in eighths (16 means doubling)
    pub backoff_factor_eighths: u32,
    pub max_interval: Duration,
    /// Seqnos still missing after this many requests are given up on, which is reported to the
    ///  application according to the [DeliveryMode]
    pub max_attempts: u32,
    /// If `true`, a seqno is requested only from the second tick on which it is found missing,
    ///  giving reordered messages one tick to arrive.
    pub suppress_first_tick: bool,
    /// maximum number of seqnos per XMIT_REQ
    pub max_xmit_req_size: u64,
    /// Ask a random other member instead of the original sender. Only useful if members retain
    ///  delivered messages (see [TableConfig::discard_delivered]).
    pub xmit_from_random_member: bool,
    /// periodically announce the highest sent seqno while idle, so that loss of the last message
    ///  is detected
    pub resend_last_seqno: bool,
    pub resend_last_seqno_max_times: u32,
}

#[derive(Debug, Clone)]
pub struct StabilityConfig {
    pub interval: Duration,
    pub jitter_ratio: f64,
    /// start a round early once this many payload bytes were received since the last round;
    ///  0 disables the trigger
    pub max_bytes: u64,
    pub round_timeout: Duration,
    /// Members that did not send a single digest in the current view are excluded from rounds
    ///  once the view is this old. Until then, rounds without them are abandoned.
    pub exclude_unresponsive_after: Duration,
    /// stability is resumed automatically if it stays suspended for longer than this
    pub max_suspend_time: Duration,
}

#[derive(Debug, Clone)]
pub struct UnicastConfig {
    /// acknowledge after this many delivered messages (and on every tick)
    pub ack_threshold: u32,
    /// Unacknowledged messages are dropped from the retransmission buffer after this time.
    ///  `None` keeps them until they are acknowledged.
    pub max_retransmit_time: Option<Duration>,
}

impl GroupConfig {
    pub fn new() -> GroupConfig {
        GroupConfig {
            protocols: vec![ProtocolKind::NakAck, ProtocolKind::Unicast, ProtocolKind::Stable],
            delivery_mode: DeliveryMode::Lenient,
            flow_control_mode: FlowControlMode::Block,
            max_message_size: 16*1024*1024,
            table: TableConfig {
                row_size: 1024,
                max_window: 1024*1024,
                discard_delivered: true,
                max_drain_batch: 100,
            },
            retransmit: RetransmitConfig {
                interval: Duration::from_millis(500),
                jitter_ratio: 0.1,
                backoff_factor_eighths: 16,
                max_interval: Duration::from_secs(8),
                max_attempts: 32,
                suppress_first_tick: true,
                max_xmit_req_size: 1024,
                xmit_from_random_member: false,
                resend_last_seqno: true,
                resend_last_seqno_max_times: 1,
            },
            stability: StabilityConfig {
                interval: Duration::from_secs(10),
                jitter_ratio: 0.2,
                max_bytes: 4*1024*1024,
                round_timeout: Duration::from_secs(2),
                exclude_unresponsive_after: Duration::from_secs(30),
                max_suspend_time: Duration::from_secs(60),
            },
            unicast: UnicastConfig {
                ack_threshold: 100,
                max_retransmit_time: Some(Duration::from_secs(60)),
            },
        }
    }

    pub fn has_protocol(&self, kind: ProtocolKind) -> bool {
        self.protocols.contains(&kind)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for (i, p) in self.protocols.iter().enumerate() {
            if self.protocols[..i].contains(p) {
                bail!("protocol {:?} is configured more than once", p);
            }
        }
        if self.has_protocol(ProtocolKind::Stable) && !self.has_protocol(ProtocolKind::NakAck) {
            bail!("stability requires the multicast delivery layer");
        }
        if self.max_message_size == 0 {
            bail!("max message size must be positive");
        }

        if self.table.row_size == 0 {
            bail!("row size must be positive");
        }
        if self.table.max_window < self.table.row_size as u64 {
            bail!("the receive window must hold at least one row");
        }
        if self.table.max_drain_batch == 0 {
            bail!("drain batch size must be positive");
        }

        if self.retransmit.interval.is_zero() {
            bail!("retransmission interval must be positive");
        }
        if !(0.0..1.0).contains(&self.retransmit.jitter_ratio) {
            bail!("retransmission jitter ratio must be in [0.0, 1.0)");
        }
        if self.retransmit.backoff_factor_eighths < 8 {
            bail!("backoff factor must be at least 8 eighths");
        }
        if self.retransmit.max_interval < self.retransmit.interval {
            bail!("max retransmission interval must not be smaller than the base interval");
        }
        if self.retransmit.max_attempts == 0 {
            bail!("max retransmission attempts must be positive");
        }
        if self.retransmit.max_xmit_req_size == 0 {
            bail!("max xmit request size must be positive");
        }
        if self.retransmit.xmit_from_random_member && self.table.discard_delivered {
            bail!("retransmission from random members requires retaining delivered messages");
        }

        if self.stability.interval.is_zero() || self.stability.round_timeout.is_zero() {
            bail!("stability interval and round timeout must be positive");
        }
        if !(0.0..1.0).contains(&self.stability.jitter_ratio) {
            bail!("stability jitter ratio must be in [0.0, 1.0)");
        }

        if self.unicast.ack_threshold == 0 {
            bail!("ack threshold must be positive");
        }

        Ok(())
    }
}

impl Default for GroupConfig {
    fn default() -> Self {
        GroupConfig::new()
    }
}
