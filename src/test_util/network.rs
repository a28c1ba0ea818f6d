use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::group::Group;
use crate::messaging::node_addr::NodeAddr;
use crate::messaging::transport::Transport;

type DropRule = Box<dyn FnMut(NodeAddr, NodeAddr, &[u8]) -> bool + Send>;

/// An in-process network connecting [Group]s for end-to-end tests. Buffers are passed through
///  unbounded channels, and a configurable rule decides which of them get lost.
#[derive(Default)]
pub struct InMemoryNetwork {
    nodes: RwLock<FxHashMap<NodeAddr, mpsc::UnboundedSender<Bytes>>>,
    drop_rule: Mutex<Option<DropRule>>,
}

impl InMemoryNetwork {
    pub fn new() -> Arc<InMemoryNetwork> {
        Default::default()
    }

    /// Registers a node, returning its transport and the receiving end for buffers sent to it
    pub fn attach(self: &Arc<Self>, addr: NodeAddr) -> (Arc<dyn Transport>, mpsc::UnboundedReceiver<Bytes>) {
        let (send, recv) = mpsc::unbounded_channel();
        self.nodes.write()
            .unwrap()
            .insert(addr, send);

        let transport = Arc::new(InMemoryTransport {
            myself: addr,
            network: self.clone(),
        });
        (transport, recv)
    }

    pub fn detach(&self, addr: &NodeAddr) {
        self.nodes.write()
            .unwrap()
            .remove(addr);
    }

    /// The rule is called with sender, recipient and buffer (including the envelope) of every
    ///  buffer; buffers for which it returns `true` are dropped.
    pub fn set_drop_rule(&self, rule: impl FnMut(NodeAddr, NodeAddr, &[u8]) -> bool + Send + 'static) {
        *self.drop_rule.lock().unwrap() = Some(Box::new(rule));
    }

    pub fn clear_drop_rule(&self) {
        *self.drop_rule.lock().unwrap() = None;
    }

    /// Feeds everything a node receives into its [Group]
    pub fn spawn_receiver(group: Arc<Group>, mut receiver: mpsc::UnboundedReceiver<Bytes>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(buf) = receiver.recv().await {
                group.on_message(&buf).await;
            }
        })
    }

    fn should_drop(&self, from: NodeAddr, to: NodeAddr, buf: &[u8]) -> bool {
        match self.drop_rule.lock().unwrap().as_mut() {
            Some(rule) => rule(from, to, buf),
            None => false,
        }
    }

    fn deliver(&self, from: NodeAddr, to: NodeAddr, buf: &[u8]) {
        if self.should_drop(from, to, buf) {
            trace!("dropping buffer from {:?} to {:?}", from, to);
            return;
        }
        if let Some(node) = self.nodes.read().unwrap().get(&to) {
            let _ = node.send(Bytes::copy_from_slice(buf));
        }
    }
}

struct InMemoryTransport {
    myself: NodeAddr,
    network: Arc<InMemoryNetwork>,
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn local_addr(&self) -> NodeAddr {
        self.myself
    }

    async fn send_unicast(&self, to: NodeAddr, buf: &[u8]) -> anyhow::Result<()> {
        self.network.deliver(self.myself, to, buf);
        Ok(())
    }

    async fn send_multicast(&self, buf: &[u8]) -> anyhow::Result<()> {
        let recipients = self.network.nodes.read()
            .unwrap()
            .keys()
            .filter(|&&addr| addr != self.myself)
            .copied()
            .collect::<Vec<_>>();
        for to in recipients {
            self.network.deliver(self.myself, to, buf);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::test_util::node::test_node_addr_from_number;
    use super::*;

    #[tokio::test]
    async fn test_multicast_and_drop_rule() {
        let network = InMemoryNetwork::new();
        let (transport1, mut recv1) = network.attach(test_node_addr_from_number(1));
        let (_transport2, mut recv2) = network.attach(test_node_addr_from_number(2));
        let (_transport3, mut recv3) = network.attach(test_node_addr_from_number(3));

        let lossy = test_node_addr_from_number(3);
        network.set_drop_rule(move |_, to, buf| to == lossy && buf == b"b");

        transport1.send_multicast(b"a").await.unwrap();
        transport1.send_multicast(b"b").await.unwrap();
        transport1.send_unicast(test_node_addr_from_number(2), b"c").await.unwrap();

        assert_eq!(recv2.recv().await.unwrap(), Bytes::from_static(b"a"));
        assert_eq!(recv2.recv().await.unwrap(), Bytes::from_static(b"b"));
        assert_eq!(recv2.recv().await.unwrap(), Bytes::from_static(b"c"));
        assert_eq!(recv3.recv().await.unwrap(), Bytes::from_static(b"a"));
        assert!(recv3.try_recv().is_err());
        assert!(recv1.try_recv().is_err());

        network.detach(&test_node_addr_from_number(2));
        network.clear_drop_rule();
        transport1.send_multicast(b"d").await.unwrap();
        assert_eq!(recv3.recv().await.unwrap(), Bytes::from_static(b"d"));
        assert!(recv2.recv().await.is_none());
    }
}
