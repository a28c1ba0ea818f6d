//! Interface to credit-based flow control. Credit accounting itself happens elsewhere: the
//!  delivery layers reserve credit before sending a message and release it once the message is
//!  known to be stable (multicast) or acknowledged (unicast).

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tracing::trace;

use crate::config::FlowControlMode;
use crate::messaging::node_addr::NodeAddr;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum FlowTarget {
    Multicast,
    Unicast(NodeAddr),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Credit {
    Granted,
    Blocked,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait FlowControl: Send + Sync + 'static {
    /// reserves credit for `num_bytes`, never blocking
    fn reserve_credit(&self, target: FlowTarget, num_bytes: usize) -> Credit;

    /// completes when credit for `target` may have become available
    async fn credit_available(&self, target: FlowTarget);

    fn release(&self, target: FlowTarget, num_bytes: usize);
}

/// Reserves credit for a message on the send path. With [FlowControlMode::Block] this waits until
///  credit is granted, with [FlowControlMode::NonBlocking] it returns [Credit::Blocked] right away.
pub async fn reserve_credit(flow_control: &dyn FlowControl, mode: FlowControlMode, target: FlowTarget, num_bytes: usize) -> Credit {
    loop {
        match flow_control.reserve_credit(target, num_bytes) {
            Credit::Granted => return Credit::Granted,
            Credit::Blocked => match mode {
                FlowControlMode::Block => {
                    trace!("waiting for credit for {:?}", target);
                    flow_control.credit_available(target).await;
                }
                FlowControlMode::NonBlocking => return Credit::Blocked,
            }
        }
    }
}

/// Flow control that always grants credit
#[derive(Debug, Default)]
pub struct NoFlowControl {}

#[async_trait]
impl FlowControl for NoFlowControl {
    fn reserve_credit(&self, _target: FlowTarget, _num_bytes: usize) -> Credit {
        Credit::Granted
    }

    async fn credit_available(&self, _target: FlowTarget) {}

    fn release(&self, _target: FlowTarget, _num_bytes: usize) {}
}
