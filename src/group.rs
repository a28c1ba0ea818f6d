//! The application's entry point: a [Group] assembles the configured protocol layers on top of a
//!  transport and runs their periodic work.
//!
//! ```ascii
//!   application            Group::multicast / send_to          MessageListener
//!        |                          |                                ^
//!        v                          v                                |
//!   +---------+   +--------+   +---------+                           |
//!   | Stable  |   | NakAck |   | Unicast |  -- deliver in order -----+
//!   +---------+   +--------+   +---------+
//!        \             |            /
//!         +------ ProtocolStack ---+   <-- Group::on_message
//!                      |
//!                  Transport
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::{GroupConfig, ProtocolKind};
use crate::delivery::{MessageListener, SendOutcome};
use crate::digest::Digest;
use crate::flow_control::FlowControl;
use crate::membership::View;
use crate::messaging::message::MessageSender;
use crate::messaging::node_addr::NodeAddr;
use crate::messaging::transport::Transport;
use crate::nakack::NakAck;
use crate::stability::trigger::StabilityTrigger;
use crate::stability::{DigestSource, Stability};
use crate::stack::stack_sender::StackSender;
use crate::stack::{ProtocolLayer, ProtocolStack};
use crate::stats::DeliveryStatsSnapshot;
use crate::table::TableStats;
use crate::unicast::Unicast;

pub struct Group {
    myself: NodeAddr,
    stack: ProtocolStack,
    nakack: Option<Arc<NakAck<StackSender>>>,
    unicast: Option<Arc<Unicast<StackSender>>>,
    stability: Option<Arc<Stability<StackSender>>>,
    /// stability was suspended by the application, and stays suspended across view changes
    stability_suspended: AtomicBool,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for Group {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Group {
    /// Creates the configured layers and spawns their periodic work. This must be called from
    ///  within a tokio runtime.
    pub async fn new(config: GroupConfig, transport: Arc<dyn Transport>, listener: Arc<dyn MessageListener>, flow_control: Arc<dyn FlowControl>) -> anyhow::Result<Group> {
        config.validate()?;
        let config = Arc::new(config);

        let sender = Arc::new(StackSender::new(transport));
        let myself = sender.get_self_addr();
        let stack = ProtocolStack::new(myself, config.max_message_size);

        let trigger = config.has_protocol(ProtocolKind::Stable)
            .then(|| Arc::new(StabilityTrigger::new(config.stability.max_bytes)));

        let nakack = config.has_protocol(ProtocolKind::NakAck)
            .then(|| Arc::new(NakAck::new(config.clone(), sender.clone(), listener.clone(), flow_control.clone(), trigger.clone())));
        let unicast = config.has_protocol(ProtocolKind::Unicast)
            .then(|| Arc::new(Unicast::new(config.clone(), sender.clone(), listener.clone(), flow_control.clone())));
        let stability = match (&nakack, trigger) {
            (Some(nakack), Some(trigger)) => {
                let digest_source: Arc<dyn DigestSource> = nakack.clone();
                Some(Arc::new(Stability::new(config.clone(), sender.clone(), digest_source, trigger)))
            }
            _ => None,
        };

        for kind in &config.protocols {
            let layer: Option<Arc<dyn ProtocolLayer>> = match kind {
                ProtocolKind::NakAck => nakack.clone().map(|l| l as Arc<dyn ProtocolLayer>),
                ProtocolKind::Unicast => unicast.clone().map(|l| l as Arc<dyn ProtocolLayer>),
                ProtocolKind::Stable => stability.clone().map(|l| l as Arc<dyn ProtocolLayer>),
            };
            let layer = layer.ok_or_else(|| anyhow!("protocol {:?} could not be created", kind))?;
            stack.register_layer(layer).await?;
        }

        let tasks = stack.layers().await
            .into_iter()
            .map(|layer| tokio::spawn(layer.run()))
            .collect();

        info!("started group member {:?} with protocols {:?}", myself, config.protocols);
        Ok(Group {
            myself,
            stack,
            nakack,
            unicast,
            stability,
            stability_suspended: AtomicBool::new(false),
            tasks,
        })
    }

    pub fn myself(&self) -> NodeAddr {
        self.myself
    }

    /// Entry point for everything the transport receives
    pub async fn on_message(&self, buf: &[u8]) {
        self.stack.on_message(buf).await
    }

    pub async fn multicast(&self, payload: Bytes) -> anyhow::Result<SendOutcome> {
        self.nakack()?.multicast(payload).await
    }

    pub async fn send_to(&self, to: NodeAddr, payload: Bytes) -> anyhow::Result<SendOutcome> {
        self.unicast()?.send_to(to, payload).await
    }

    /// Installs a new view. A digest passed with the view (typically on join or after a merge)
    ///  sets the starting point for every sender it contains before the layers see the view.
    ///  Stability rounds are suspended meanwhile.
    pub async fn install_view(&self, view: View, digest: Option<&Digest>) {
        debug!("installing view {} with {} members", view.id, view.len());

        let suspended_here = !self.stability_suspended.load(Ordering::Acquire);
        if suspended_here {
            if let Some(stability) = &self.stability {
                stability.suspend().await;
            }
        }
        if let (Some(nakack), Some(digest)) = (&self.nakack, digest) {
            nakack.set_digest(digest).await;
        }
        self.stack.on_view_change(&view).await;
        if suspended_here && !self.stability_suspended.load(Ordering::Acquire) {
            if let Some(stability) = &self.stability {
                stability.resume().await;
            }
        }
    }

    /// The local member's digest, e.g. for passing it to a joining member
    pub async fn digest(&self) -> anyhow::Result<Digest> {
        Ok(self.nakack()?.digest().await)
    }

    /// Suspends stability rounds until [Group::resume_stability] is called (or the configured
    ///  maximum suspension time elapses). Installing a view does not end the suspension.
    pub async fn suspend_stability(&self) {
        self.stability_suspended.store(true, Ordering::Release);
        if let Some(stability) = &self.stability {
            stability.suspend().await;
        }
    }

    pub async fn resume_stability(&self) {
        self.stability_suspended.store(false, Ordering::Release);
        if let Some(stability) = &self.stability {
            stability.resume().await;
        }
    }

    pub fn multicast_stats(&self) -> Option<DeliveryStatsSnapshot> {
        self.nakack.as_ref().map(|n| n.stats())
    }

    pub fn unicast_stats(&self) -> Option<DeliveryStatsSnapshot> {
        self.unicast.as_ref().map(|u| u.stats())
    }

    pub async fn table_stats(&self) -> Vec<(NodeAddr, TableStats)> {
        match &self.nakack {
            Some(nakack) => nakack.table_stats().await,
            None => Vec::new(),
        }
    }

    fn nakack(&self) -> anyhow::Result<&NakAck<StackSender>> {
        self.nakack.as_deref()
            .ok_or_else(|| anyhow!("multicast is not configured for this group"))
    }

    fn unicast(&self) -> anyhow::Result<&Unicast<StackSender>> {
        self.unicast.as_deref()
            .ok_or_else(|| anyhow!("point-to-point messages are not configured for this group"))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time;

    use crate::flow_control::NoFlowControl;
    use crate::messaging::envelope::Envelope;
    use crate::nakack::nakack_messages::{NakAckMessage, NAKACK_PROTOCOL_ID};
    use crate::seqno::Seqno;
    use crate::test_util::listener::CollectingListener;
    use crate::test_util::network::InMemoryNetwork;
    use crate::test_util::node::{test_node_addr_from_number, test_view};
    use super::*;

    fn test_config() -> GroupConfig {
        let mut config = GroupConfig::new();
        config.retransmit.interval = Duration::from_millis(100);
        config.retransmit.max_interval = Duration::from_millis(800);
        config.retransmit.jitter_ratio = 0.0;
        config.stability.interval = Duration::from_millis(500);
        config.stability.round_timeout = Duration::from_millis(200);
        config.unicast.ack_threshold = 2;
        config
    }

    /// `true` for the original (not retransmitted) multicast of `seqno`
    fn is_multicast_data(buf: &[u8], seqno: u64) -> bool {
        let mut buf = buf;
        let Ok(envelope) = Envelope::try_read(&mut buf) else {
            return false;
        };
        if envelope.protocol_id != NAKACK_PROTOCOL_ID {
            return false;
        }
        matches!(NakAckMessage::deser(buf), Ok(NakAckMessage::Data(data)) if data.seqno == Seqno::from_raw(seqno) && !data.xmit)
    }

    struct Member {
        group: Arc<Group>,
        listener: Arc<CollectingListener>,
    }

    async fn start_members(network: &Arc<InMemoryNetwork>, config: fn() -> GroupConfig, numbers: &[u16]) -> Vec<Member> {
        let view = test_view(1, numbers);
        let mut result = Vec::new();
        for &number in numbers {
            let listener = Arc::new(CollectingListener::new());
            let (transport, receiver) = network.attach(test_node_addr_from_number(number));
            let group = Arc::new(Group::new(config(), transport, listener.clone(), Arc::new(NoFlowControl::default())).await.unwrap());
            InMemoryNetwork::spawn_receiver(group.clone(), receiver);
            group.install_view(view.clone(), None).await;
            result.push(Member { group, listener });
        }
        result
    }

    #[tokio::test(start_paused = true)]
    async fn test_multicast_to_all_members() {
        let network = InMemoryNetwork::new();
        let members = start_members(&network, test_config, &[1, 2, 3]).await;

        for payload in ["a", "b", "c"] {
            members[0].group.multicast(Bytes::from(payload)).await.unwrap();
        }

        for member in &members {
            time::timeout(Duration::from_secs(5), member.listener.wait_for_deliveries(3)).await.unwrap();
            assert_eq!(member.listener.seqnos_from(test_node_addr_from_number(1), true), vec![1, 2, 3]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_multicast_is_repaired() {
        let network = InMemoryNetwork::new();
        let members = start_members(&network, test_config, &[1, 2, 3]).await;

        let lossy = test_node_addr_from_number(3);
        network.set_drop_rule(move |_, to, buf| to == lossy && is_multicast_data(buf, 2));

        for payload in ["a", "b", "c"] {
            members[0].group.multicast(Bytes::from(payload)).await.unwrap();
        }

        time::timeout(Duration::from_secs(5), members[2].listener.wait_for_deliveries(3)).await.unwrap();
        assert_eq!(members[2].listener.payloads_from(test_node_addr_from_number(1), true), vec![Bytes::from("a"), Bytes::from("b"), Bytes::from("c")]);
        assert!(members[2].listener.errors().is_empty());
        assert!(members[2].group.multicast_stats().unwrap().xmit_requests_sent >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_last_message_is_detected() {
        let network = InMemoryNetwork::new();
        let members = start_members(&network, test_config, &[1, 2]).await;

        network.set_drop_rule(|_, _, buf| is_multicast_data(buf, 2));
        members[0].group.multicast(Bytes::from("a")).await.unwrap();
        members[0].group.multicast(Bytes::from("b")).await.unwrap();

        time::timeout(Duration::from_secs(5), members[1].listener.wait_for_deliveries(2)).await.unwrap();
        assert_eq!(members[1].listener.seqnos_from(test_node_addr_from_number(1), true), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_to() {
        let network = InMemoryNetwork::new();
        let members = start_members(&network, test_config, &[1, 2]).await;
        let to = test_node_addr_from_number(2);

        network.set_drop_rule({
            let mut num_dropped = 0;
            move |_, _, _| {
                num_dropped += 1;
                num_dropped == 2
            }
        });
        for payload in ["a", "b", "c", "d"] {
            members[0].group.send_to(to, Bytes::from(payload)).await.unwrap();
        }

        time::timeout(Duration::from_secs(5), members[1].listener.wait_for_deliveries(4)).await.unwrap();
        assert_eq!(members[1].listener.seqnos_from(test_node_addr_from_number(1), false), vec![1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stability_purges_buffers() {
        let network = InMemoryNetwork::new();
        let members = start_members(&network, test_config, &[1, 2, 3]).await;

        for payload in ["a", "b", "c"] {
            members[0].group.multicast(Bytes::from(payload)).await.unwrap();
        }
        for member in &members {
            time::timeout(Duration::from_secs(5), member.listener.wait_for_deliveries(3)).await.unwrap();
        }

        time::sleep(Duration::from_secs(2)).await;
        let nakack = members[0].group.nakack.as_ref().unwrap();
        assert!(nakack.retransmit_buffer().is_empty());
        assert_eq!(nakack.retransmit_buffer().low(), Seqno::from_raw(3));

        let digest = members[1].group.digest().await.unwrap();
        assert_eq!(digest.get(&test_node_addr_from_number(1)).unwrap().low, Seqno::from_raw(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_view_change_keeps_application_suspension() {
        let network = InMemoryNetwork::new();
        let members = start_members(&network, test_config, &[1, 2, 3]).await;

        members[0].group.suspend_stability().await;
        for member in &members {
            member.group.install_view(test_view(2, &[1, 2, 3]), None).await;
        }

        for payload in ["a", "b", "c"] {
            members[0].group.multicast(Bytes::from(payload)).await.unwrap();
        }
        for member in &members {
            time::timeout(Duration::from_secs(5), member.listener.wait_for_deliveries(3)).await.unwrap();
        }

        // no rounds while suspended, so nothing is purged
        time::sleep(Duration::from_secs(2)).await;
        let nakack = members[0].group.nakack.as_ref().unwrap();
        assert_eq!(nakack.retransmit_buffer().len(), 3);

        members[0].group.resume_stability().await;
        time::sleep(Duration::from_secs(2)).await;
        assert!(nakack.retransmit_buffer().is_empty());
    }

    #[tokio::test]
    async fn test_missing_protocol() {
        let network = InMemoryNetwork::new();
        let mut config = test_config();
        config.protocols = vec![ProtocolKind::Unicast];
        let (transport, _receiver) = network.attach(test_node_addr_from_number(1));
        let group = Group::new(config, transport, Arc::new(CollectingListener::new()), Arc::new(NoFlowControl::default())).await.unwrap();

        assert!(group.multicast(Bytes::from("a")).await.is_err());
        assert!(group.digest().await.is_err());
        assert!(group.multicast_stats().is_none());
        assert!(group.unicast_stats().is_some());
    }

    #[tokio::test]
    async fn test_invalid_config() {
        let network = InMemoryNetwork::new();
        let mut config = test_config();
        config.protocols = vec![ProtocolKind::Stable];
        let (transport, _receiver) = network.attach(test_node_addr_from_number(1));
        assert!(Group::new(config, transport, Arc::new(CollectingListener::new()), Arc::new(NoFlowControl::default())).await.is_err());
    }
}
