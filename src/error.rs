use crate::messaging::node_addr::NodeAddr;
use crate::table::missing::SeqnoRanges;

/// Delivery problems that are visible to the application. Transient loss is repaired internally
///  and never shows up here.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum DeliveryError {
    /// Lenient mode: the seqnos are skipped, and delivery from the sender continues after them.
    #[error("messages {missing:?} from {sender:?} are lost and were skipped")]
    MessagesSkipped {
        sender: NodeAddr,
        missing: SeqnoRanges,
    },
    /// Strict mode: delivery from the sender stops for good.
    #[error("messages {missing:?} from {sender:?} are permanently lost - delivery from this sender is halted")]
    PermanentLoss {
        sender: NodeAddr,
        missing: SeqnoRanges,
    },
}

impl DeliveryError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, DeliveryError::PermanentLoss { .. })
    }

    pub fn sender(&self) -> NodeAddr {
        match self {
            DeliveryError::MessagesSkipped { sender, .. } => *sender,
            DeliveryError::PermanentLoss { sender, .. } => *sender,
        }
    }
}
