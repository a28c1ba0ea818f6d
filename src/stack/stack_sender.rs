use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use tracing::trace;

use crate::messaging::envelope::{Checksum, Envelope};
use crate::messaging::message::{Message, MessageSender};
use crate::messaging::node_addr::NodeAddr;
use crate::messaging::transport::Transport;

/// The [MessageSender] used by protocol layers: frames messages with an envelope and passes them
///  to the transport.
pub struct StackSender {
    myself: NodeAddr,
    transport: Arc<dyn Transport>,
}

impl Debug for StackSender {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "StackSender{{myself:{:?}}}", &self.myself)
    }
}

impl StackSender {
    pub fn new(transport: Arc<dyn Transport>) -> StackSender {
        StackSender {
            myself: transport.local_addr(),
            transport,
        }
    }

    fn frame(&self, msg: &dyn Message) -> BytesMut {
        let mut msg_buf = BytesMut::new();
        msg.ser(&mut msg_buf);

        let protocol_id = msg.protocol_id();
        let checksum = Checksum::new(self.myself, protocol_id, &msg_buf);

        let mut buf = BytesMut::with_capacity(msg_buf.len() + 64);
        Envelope::write(self.myself, checksum, protocol_id, &mut buf);
        buf.extend_from_slice(&msg_buf);
        buf
    }
}

#[async_trait]
impl MessageSender for StackSender {
    fn get_self_addr(&self) -> NodeAddr {
        self.myself
    }

    async fn try_send_to<T: Message>(&self, to: NodeAddr, msg: &T) -> anyhow::Result<()> {
        trace!(from=?self.myself, ?to, "sending message");
        let buf = self.frame(msg);
        self.transport.send_unicast(to, &buf).await
    }

    async fn try_multicast<T: Message>(&self, msg: &T) -> anyhow::Result<()> {
        trace!(from=?self.myself, "multicasting message");
        let buf = self.frame(msg);
        self.transport.send_multicast(&buf).await
    }
}
