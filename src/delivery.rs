use bytes::Bytes;
#[cfg(test)] use mockall::automock;

use crate::error::DeliveryError;
use crate::messaging::node_addr::NodeAddr;
use crate::seqno::Seqno;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Delivery {
    pub sender: NodeAddr,
    pub seqno: Seqno,
    /// `true` for messages sent to the group, `false` for point-to-point messages
    pub multicast: bool,
    pub payload: Bytes,
}

/// The result of a send call that did not fail
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SendOutcome {
    Sent(Seqno),
    /// no flow control credit was available, and the send was configured not to block. Nothing
    ///  was sent.
    NoCredit,
}

/// The application's side of message delivery. Calls for a given sender (and delivery layer)
///  never overlap, and messages arrive in seqno order with each seqno delivered at most once.
#[cfg_attr(test, automock)]
pub trait MessageListener: Send + Sync + 'static {
    fn deliver(&self, delivery: Delivery);

    fn on_delivery_error(&self, error: DeliveryError);
}
