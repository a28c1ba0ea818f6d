use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::messaging::message::{Message, MessageSender};
use crate::messaging::node_addr::NodeAddr;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SentTo {
    Unicast(NodeAddr),
    Multicast,
}

/// A [MessageSender] that records all messages instead of sending them
#[derive(Debug)]
pub struct TrackingMockMessageSender {
    myself: NodeAddr,
    tracker: Arc<RwLock<Vec<(SentTo, Box<dyn Any + Send + Sync>)>>>,
}
impl TrackingMockMessageSender {
    pub fn new(myself: NodeAddr) -> Self {
        TrackingMockMessageSender {
            myself,
            tracker: Default::default()
        }
    }

    async fn assert_next_sent<M: Message + PartialEq>(&self, to: SentTo, message: M) {
        let mut lock = self.tracker.write().await;
        if lock.is_empty() {
            panic!("no message was sent, expected {:?}", message);
        }

        let (actual_to, actual_msg) = lock.remove(0);
        match actual_msg.downcast::<M>() {
            Ok(actual_msg) => {
                assert_eq!(actual_msg.as_ref(), &message);
                assert_eq!(actual_to, to);
            }
            Err(_) => panic!("expected message {:?}, a message of a different type was sent", message),
        }
    }

    /// checks the oldest recorded message and removes it
    pub async fn assert_message_sent<M: Message + PartialEq>(&self, to: NodeAddr, message: M) {
        self.assert_next_sent(SentTo::Unicast(to), message).await
    }

    pub async fn assert_multicast_sent<M: Message + PartialEq>(&self, message: M) {
        self.assert_next_sent(SentTo::Multicast, message).await
    }

    pub async fn assert_no_remaining_messages(&self) {
        let lock = self.tracker.read().await;
        assert!(lock.is_empty(), "{} unexpected messages were sent", lock.len());
    }

    /// returns all recorded messages of type `M`, clearing the record
    pub async fn sent_messages<M: Message + Clone>(&self) -> Vec<(SentTo, M)> {
        let mut lock = self.tracker.write().await;
        std::mem::take(&mut *lock)
            .into_iter()
            .filter_map(|(to, msg)| msg.downcast::<M>().ok().map(|m| (to, m.as_ref().clone())))
            .collect()
    }
}

#[async_trait]
impl MessageSender for TrackingMockMessageSender {
    fn get_self_addr(&self) -> NodeAddr {
        self.myself
    }

    async fn try_send_to<T: Message>(&self, to: NodeAddr, msg: &T) -> anyhow::Result<()> {
        self.tracker.write().await.push((SentTo::Unicast(to), msg.box_clone()));
        Ok(())
    }

    async fn try_multicast<T: Message>(&self, msg: &T) -> anyhow::Result<()> {
        self.tracker.write().await.push((SentTo::Multicast, msg.box_clone()));
        Ok(())
    }
}
