use std::any::Any;
use std::fmt::Debug;

use async_trait::async_trait;
use bytes::BytesMut;
use tracing::error;

use crate::messaging::node_addr::NodeAddr;
use crate::messaging::protocol_id::ProtocolId;

/// Messages are pluggable: each protocol layer has its own message type, which knows how to
///  serialize itself. Deserialization is done by the protocol layer that receives it, identified
///  by the [ProtocolId] in the envelope.
pub trait Message: Debug + Send + Sync + Any + 'static {
    fn protocol_id(&self) -> ProtocolId;

    fn ser(&self, buf: &mut BytesMut);

    /// for inspecting sent messages in tests
    fn box_clone(&self) -> Box<dyn Any + Send + Sync>;
}

#[async_trait]
pub trait MessageSender: Debug + Send + Sync + 'static {
    fn get_self_addr(&self) -> NodeAddr;

    async fn send_to<T: Message>(&self, to: NodeAddr, msg: &T) {
        if let Err(e) = self.try_send_to(to, msg).await {
            error!("error sending message to {:?}: {}", to, e);
        }
    }

    async fn try_send_to<T: Message>(&self, to: NodeAddr, msg: &T) -> anyhow::Result<()>;

    /// Sends a message to all members of the group. The transport does not loop multicast
    ///  messages back to the sender.
    async fn multicast<T: Message>(&self, msg: &T) {
        if let Err(e) = self.try_multicast(msg).await {
            error!("error multicasting message: {}", e);
        }
    }

    async fn try_multicast<T: Message>(&self, msg: &T) -> anyhow::Result<()>;
}
