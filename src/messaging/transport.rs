use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::messaging::node_addr::NodeAddr;

/// Best-effort delivery of raw buffers: messages may be lost, duplicated or reordered. Received
///  buffers are passed to [crate::group::Group::on_message] by whoever owns the transport.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn local_addr(&self) -> NodeAddr;

    async fn send_unicast(&self, to: NodeAddr, buf: &[u8]) -> anyhow::Result<()>;

    /// sends to all members except the local one
    async fn send_multicast(&self, buf: &[u8]) -> anyhow::Result<()>;
}
