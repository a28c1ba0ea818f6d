//! Reliable multicast: every member multicasts messages with its own strictly increasing seqnos,
//!  and every member delivers each other member's messages exactly once and in seqno order.
//!
//! Loss is detected by the receivers (negative acknowledgement): a receiver keeps a table per
//!  sender, and the periodic retransmission tick requests missing seqnos from the sender that
//!  multicast them. Senders keep their messages in a retransmission buffer until the stability
//!  layer reports them as delivered everywhere.

pub mod nakack_messages;

use std::sync::{Arc, Mutex};

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::RwLock;
use tokio::time;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::config::GroupConfig;
use crate::delivery::{MessageListener, SendOutcome};
use crate::digest::Digest;
use crate::flow_control::{reserve_credit, Credit, FlowControl, FlowTarget};
use crate::membership::View;
use crate::messaging::envelope::Envelope;
use crate::messaging::message::MessageSender;
use crate::messaging::node_addr::NodeAddr;
use crate::messaging::protocol_id::ProtocolId;
use crate::nakack::nakack_messages::{DataMessage, NakAckMessage, NAKACK_PROTOCOL_ID};
use crate::receive_window::ReceiveWindow;
use crate::retransmit::send_buffer::{RetransmitBuffer, XmitLookup};
use crate::seqno::Seqno;
use crate::stability::trigger::StabilityTrigger;
use crate::stability::DigestSource;
use crate::stack::ProtocolLayer;
use crate::stats::{DeliveryStats, DeliveryStatsSnapshot};
use crate::table::missing::SeqnoRanges;
use crate::table::{TableStats, Watermarks};
use crate::util::random::{Random, RngRandom};

#[derive(Default)]
struct NakAckState {
    windows: FxHashMap<NodeAddr, Arc<ReceiveWindow>>,
    view: Option<View>,
    /// senders that left the view, kept until everything they sent was delivered
    retired: FxHashSet<NodeAddr>,
}

/// Announces the highest sent seqno on ticks during which nothing new was sent
#[derive(Default)]
struct LastSeqnoResender {
    last_seen: Seqno,
    num_announced: u32,
}

impl LastSeqnoResender {
    fn on_tick(&mut self, highest_sent: Seqno, max_times: u32) -> bool {
        if highest_sent != self.last_seen {
            self.last_seen = highest_sent;
            self.num_announced = 0;
            return false;
        }
        if highest_sent == Seqno::ZERO || self.num_announced >= max_times {
            return false;
        }
        self.num_announced += 1;
        true
    }
}

pub struct NakAck<S: MessageSender> {
    myself: NodeAddr,
    config: Arc<GroupConfig>,
    sender: Arc<S>,
    listener: Arc<dyn MessageListener>,
    flow_control: Arc<dyn FlowControl>,
    stability_trigger: Option<Arc<StabilityTrigger>>,

    send_buffer: RetransmitBuffer,
    /// messages sent locally are delivered through this window
    own_window: Arc<ReceiveWindow>,
    state: RwLock<NakAckState>,
    last_seqno_resender: Mutex<LastSeqnoResender>,
    stats: DeliveryStats,
}

impl<S: MessageSender> NakAck<S> {
    pub fn new(config: Arc<GroupConfig>, sender: Arc<S>, listener: Arc<dyn MessageListener>, flow_control: Arc<dyn FlowControl>, stability_trigger: Option<Arc<StabilityTrigger>>) -> NakAck<S> {
        let myself = sender.get_self_addr();
        let own_window = Arc::new(ReceiveWindow::new(myself, true, Watermarks::default(), &config, listener.clone()));

        let mut state = NakAckState::default();
        state.windows.insert(myself, own_window.clone());

        NakAck {
            myself,
            config,
            sender,
            listener,
            flow_control,
            stability_trigger,
            send_buffer: RetransmitBuffer::new(),
            own_window,
            state: RwLock::new(state),
            last_seqno_resender: Default::default(),
            stats: Default::default(),
        }
    }

    /// Multicasts a message to the group. With [crate::config::FlowControlMode::Block], this waits
    ///  for flow control credit.
    pub async fn multicast(&self, payload: Bytes) -> anyhow::Result<SendOutcome> {
        if payload.len() > self.config.max_message_size {
            bail!("message of {} bytes exceeds the maximum message size of {} bytes", payload.len(), self.config.max_message_size);
        }

        let num_bytes = payload.len();
        if reserve_credit(self.flow_control.as_ref(), self.config.flow_control_mode, FlowTarget::Multicast, num_bytes).await == Credit::Blocked {
            return Ok(SendOutcome::NoCredit);
        }

        let seqno = match self.send_buffer.append(payload.clone()) {
            Ok(seqno) => seqno,
            Err(e) => {
                self.flow_control.release(FlowTarget::Multicast, num_bytes);
                return Err(e);
            }
        };

        // the own window has no retransmission source, so it is filled before awaiting the transport
        self.own_window.add(seqno, payload.clone());
        self.own_window.drain();

        trace!("multicasting message {}", seqno);
        self.sender.multicast(&NakAckMessage::Data(DataMessage {
            seqno,
            first: seqno == Seqno::FIRST,
            xmit: false,
            original_sender: None,
            payload,
        })).await;
        DeliveryStats::inc(&self.stats.messages_sent);
        Ok(SendOutcome::Sent(seqno))
    }

    async fn window(&self, sender: &NodeAddr) -> Option<Arc<ReceiveWindow>> {
        self.state.read().await
            .windows.get(sender)
            .cloned()
    }

    /// A message flagged `first` introduces a sender that is not known yet, provided it is a member
    ///  of the current view (if there is one).
    async fn window_for_data(&self, sender: NodeAddr, data: &DataMessage) -> Option<Arc<ReceiveWindow>> {
        if let Some(window) = self.window(&sender).await {
            return Some(window);
        }
        if !data.first {
            return None;
        }

        let mut state = self.state.write().await;
        if state.view.as_ref().is_some_and(|v| !v.contains(&sender)) {
            return None;
        }
        let window = state.windows.entry(sender)
            .or_insert_with(|| {
                debug!("creating table for {:?} starting at {}", sender, data.seqno);
                Arc::new(ReceiveWindow::new(sender, true, Watermarks::at(data.seqno.prev()), &self.config, self.listener.clone()))
            });
        Some(window.clone())
    }

    async fn on_data(&self, from: NodeAddr, data: DataMessage) {
        let sender = data.original_sender.unwrap_or(from);
        if sender == self.myself {
            trace!("ignoring retransmission of my own message {}", data.seqno);
            return;
        }

        if data.xmit {
            DeliveryStats::inc(&self.stats.xmit_responses_received);
        }
        else {
            DeliveryStats::inc(&self.stats.messages_received);
        }

        let Some(window) = self.window_for_data(sender, &data).await else {
            trace!("dropping message {} from unknown sender {:?}", data.seqno, sender);
            return;
        };

        let num_bytes = data.payload.len() as u64;
        if window.add(data.seqno, data.payload) {
            if let Some(trigger) = &self.stability_trigger {
                trigger.add_bytes(num_bytes);
            }
        }
        else {
            trace!("discarding duplicate {} from {:?}", data.seqno, sender);
            DeliveryStats::inc(&self.stats.duplicates_received);
        }
        window.drain();
    }

    async fn on_xmit_req(&self, requester: NodeAddr, original_sender: NodeAddr, missing: SeqnoRanges) {
        DeliveryStats::inc(&self.stats.xmit_requests_received);
        trace!("{:?} requests retransmission of {:?} from {:?}", requester, missing, original_sender);

        let max_seqnos = self.config.retransmit.max_xmit_req_size as usize;

        if original_sender == self.myself {
            let mut sent_first_available = false;
            for seqno in missing.iter().take(max_seqnos) {
                match self.send_buffer.lookup(seqno) {
                    XmitLookup::Found(payload) => {
                        self.send_xmit(requester, seqno, None, payload).await;
                    }
                    XmitLookup::Purged { first_available } => {
                        if !sent_first_available {
                            debug!("{:?} requested purged seqno {}, first available is {}", requester, seqno, first_available);
                            self.sender.send_to(requester, &NakAckMessage::XmitFirstAvailable {
                                original_sender: self.myself,
                                first: first_available,
                            }).await;
                            sent_first_available = true;
                        }
                    }
                    XmitLookup::NotSent => {
                        warn!("{:?} requested seqno {} which was never sent - ignoring", requester, seqno);
                        break;
                    }
                }
            }
            return;
        }

        // a request for another member's messages, which are served if they are retained
        let Some(window) = self.window(&original_sender).await else {
            debug!("{:?} requested messages from unknown sender {:?}", requester, original_sender);
            return;
        };
        for seqno in missing.iter().take(max_seqnos) {
            if let Some(payload) = window.table().get(seqno) {
                self.send_xmit(requester, seqno, Some(original_sender), payload).await;
            }
        }
    }

    async fn send_xmit(&self, to: NodeAddr, seqno: Seqno, original_sender: Option<NodeAddr>, payload: Bytes) {
        self.sender.send_to(to, &NakAckMessage::Data(DataMessage {
            seqno,
            first: seqno == Seqno::FIRST,
            xmit: true,
            original_sender,
            payload,
        })).await;
        DeliveryStats::inc(&self.stats.xmit_responses_sent);
    }

    async fn on_first_available(&self, from: NodeAddr, original_sender: NodeAddr, first: Seqno) {
        if original_sender == self.myself {
            return;
        }
        if from != original_sender {
            warn!("{:?} announced the first available message of {:?} - ignoring", from, original_sender);
            return;
        }
        if let Some(window) = self.window(&original_sender).await {
            let num_skipped = window.on_first_available(first);
            DeliveryStats::add(&self.stats.messages_skipped, num_skipped);
        }
    }

    async fn on_highest_seqno(&self, from: NodeAddr, seqno: Seqno) {
        if let Some(window) = self.window(&from).await {
            if window.table().raise_highest_received(seqno) {
                debug!("{:?} announced highest seqno {} - requesting the tail", from, seqno);
            }
        }
    }

    async fn on_retransmit_tick<R: Random>(&self) {
        let now = Instant::now();
        let (windows, members) = {
            let state = self.state.read().await;
            let windows = state.windows.values()
                .filter(|w| w.sender() != self.myself)
                .cloned()
                .collect::<Vec<_>>();
            let members = state.view.iter()
                .flat_map(|v| v.members())
                .filter(|m| **m != self.myself)
                .copied()
                .collect::<Vec<_>>();
            (windows, members)
        };

        for window in windows {
            let (request, num_skipped) = window.retransmit_tick::<R>(now);
            DeliveryStats::add(&self.stats.messages_skipped, num_skipped);
            if request.is_empty() {
                continue;
            }

            let target = self.xmit_target::<R>(window.sender(), &members);
            trace!("requesting {:?} from {:?} at {:?}", request, window.sender(), target);
            self.sender.send_to(target, &NakAckMessage::XmitReq {
                original_sender: window.sender(),
                missing: request,
            }).await;
            DeliveryStats::inc(&self.stats.xmit_requests_sent);
        }

        self.resend_last_seqno().await;
        self.remove_retired_windows().await;
    }

    fn xmit_target<R: Random>(&self, original_sender: NodeAddr, members: &[NodeAddr]) -> NodeAddr {
        if !self.config.retransmit.xmit_from_random_member || members.is_empty() {
            return original_sender;
        }
        members[R::gen_usize_range(0..members.len())]
    }

    async fn resend_last_seqno(&self) {
        if !self.config.retransmit.resend_last_seqno {
            return;
        }

        let highest_sent = self.send_buffer.highest_sent();
        let should_announce = self.last_seqno_resender.lock()
            .unwrap_or_else(|e| e.into_inner())
            .on_tick(highest_sent, self.config.retransmit.resend_last_seqno_max_times);
        if should_announce {
            trace!("announcing highest seqno {}", highest_sent);
            self.sender.multicast(&NakAckMessage::HighestSeqno(highest_sent)).await;
        }
    }

    async fn remove_retired_windows(&self) {
        let mut state = self.state.write().await;
        let retired = state.retired.iter().copied().collect::<Vec<_>>();
        for sender in retired {
            let is_done = state.windows.get(&sender)
                .map(|w| w.is_halted() || w.table().is_fully_delivered())
                .unwrap_or(true);
            if is_done {
                debug!("removing table for {:?} which left the group", sender);
                state.windows.remove(&sender);
                state.retired.remove(&sender);
            }
        }
    }

    /// Raises the local tables' watermarks to those of a digest, creating tables for senders
    ///  that are not known yet.
    pub async fn set_digest(&self, digest: &Digest) {
        let mut state = self.state.write().await;
        for (sender, watermarks) in digest.iter() {
            if *sender == self.myself {
                continue;
            }
            if let Some(window) = state.windows.get(sender) {
                if window.table().raise_watermarks(*watermarks) {
                    debug!("raised watermarks for {:?} to {:?}", sender, watermarks);
                }
                window.drain();
            }
            else if !state.retired.contains(sender) {
                debug!("creating table for {:?} from digest: {:?}", sender, watermarks);
                state.windows.insert(*sender, Arc::new(ReceiveWindow::new(*sender, true, *watermarks, &self.config, self.listener.clone())));
            }
        }
    }

    pub fn stats(&self) -> DeliveryStatsSnapshot {
        self.stats.snapshot()
    }

    pub async fn table_stats(&self) -> Vec<(NodeAddr, TableStats)> {
        self.state.read().await
            .windows.iter()
            .map(|(sender, w)| (*sender, w.table().stats()))
            .collect()
    }

    pub fn retransmit_buffer(&self) -> &RetransmitBuffer {
        &self.send_buffer
    }

    async fn _on_message(&self, envelope: &Envelope, buf: &[u8]) -> anyhow::Result<()> {
        match NakAckMessage::deser(buf)? {
            NakAckMessage::Data(data) => self.on_data(envelope.from, data).await,
            NakAckMessage::XmitReq { original_sender, missing } => self.on_xmit_req(envelope.from, original_sender, missing).await,
            NakAckMessage::XmitFirstAvailable { original_sender, first } => self.on_first_available(envelope.from, original_sender, first).await,
            NakAckMessage::HighestSeqno(seqno) => self.on_highest_seqno(envelope.from, seqno).await,
        }
        Ok(())
    }
}

#[async_trait]
impl<S: MessageSender> ProtocolLayer for NakAck<S> {
    fn id(&self) -> ProtocolId {
        NAKACK_PROTOCOL_ID
    }

    async fn on_message(&self, envelope: &Envelope, buf: &[u8]) {
        if let Err(e) = self._on_message(envelope, buf).await {
            warn!("malformed message from {:?}: {}", envelope.from, e);
        }
    }

    /// Joining members get a table starting at zero, unless a digest introduced them before.
    ///  Members that left are retired.
    async fn on_view_change(&self, view: &View) {
        let mut state = self.state.write().await;
        let joined = match &state.view {
            Some(previous) => view.joined_since(previous),
            None => view.members().copied().collect(),
        };
        let left = state.view.as_ref()
            .map(|previous| view.left_since(previous))
            .unwrap_or_default();

        for member in joined {
            if member == self.myself || state.windows.contains_key(&member) {
                continue;
            }
            state.retired.remove(&member);
            debug!("creating table for new member {:?}", member);
            state.windows.insert(member, Arc::new(ReceiveWindow::new(member, true, Watermarks::default(), &self.config, self.listener.clone())));
        }
        for member in left {
            if state.windows.contains_key(&member) {
                debug!("{:?} left the group - retiring its table", member);
                state.retired.insert(member);
            }
        }
        state.view = Some(view.clone());
    }

    async fn run(self: Arc<Self>) {
        let mut ticks = time::interval(self.config.retransmit.interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticks.tick().await;
            self.on_retransmit_tick::<RngRandom>().await;
        }
    }
}

#[async_trait]
impl<S: MessageSender> DigestSource for NakAck<S> {
    async fn digest(&self) -> Digest {
        let state = self.state.read().await;
        state.windows.iter()
            .filter(|(sender, _)| !state.retired.contains(sender))
            .map(|(sender, w)| (*sender, w.table().watermarks()))
            .collect()
    }

    /// Purges every table up to the stable seqno of its sender, and the retransmission buffer up
    ///  to the local entry.
    async fn apply_stability(&self, stable: &Digest) {
        let state = self.state.read().await;
        for (sender, watermarks) in stable.iter() {
            let Some(window) = state.windows.get(sender) else {
                continue;
            };
            window.table().purge(watermarks.highest_delivered);

            if *sender == self.myself {
                let num_released = self.send_buffer.purge(watermarks.highest_delivered);
                if num_released > 0 {
                    self.flow_control.release(FlowTarget::Multicast, num_released);
                }
            }
            else if window.table().raise_highest_received(watermarks.highest_received) {
                debug!("stability shows messages from {:?} up to {} - requesting the tail", sender, watermarks.highest_received);
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::BytesMut;

    use crate::config::{DeliveryMode, FlowControlMode};
    use crate::error::DeliveryError;
    use crate::flow_control::{MockFlowControl, NoFlowControl};
    use crate::messaging::envelope::Checksum;
    use crate::messaging::message::Message;
    use crate::test_util::listener::CollectingListener;
    use crate::test_util::message::{SentTo, TrackingMockMessageSender};
    use crate::test_util::node::{test_node_addr_from_number, test_view};
    use super::*;

    fn test_config() -> GroupConfig {
        let mut config = GroupConfig::new();
        config.retransmit.jitter_ratio = 0.0;
        config.retransmit.interval = Duration::from_millis(100);
        config.retransmit.resend_last_seqno = false;
        config
    }

    struct Fixture {
        nakack: NakAck<TrackingMockMessageSender>,
        sender: Arc<TrackingMockMessageSender>,
        listener: Arc<CollectingListener>,
    }

    fn fixture(config: GroupConfig) -> Fixture {
        fixture_with_flow_control(config, Arc::new(NoFlowControl::default()))
    }

    fn fixture_with_flow_control(config: GroupConfig, flow_control: Arc<dyn FlowControl>) -> Fixture {
        let sender = Arc::new(TrackingMockMessageSender::new(test_node_addr_from_number(1)));
        let listener = Arc::new(CollectingListener::new());
        let nakack = NakAck::new(Arc::new(config), sender.clone(), listener.clone(), flow_control, None);
        Fixture { nakack, sender, listener }
    }

    async fn receive(nakack: &NakAck<TrackingMockMessageSender>, from: u16, msg: NakAckMessage) {
        let mut buf = BytesMut::new();
        msg.ser(&mut buf);
        let envelope = Envelope {
            from: test_node_addr_from_number(from),
            checksum: Checksum(0),
            protocol_id: NAKACK_PROTOCOL_ID,
        };
        nakack.on_message(&envelope, &buf).await;
    }

    fn data(seqno: u64) -> NakAckMessage {
        NakAckMessage::Data(DataMessage {
            seqno: Seqno::from_raw(seqno),
            first: seqno == 1,
            xmit: false,
            original_sender: None,
            payload: Bytes::from(format!("m{}", seqno)),
        })
    }

    fn xmit_data(seqno: u64, original_sender: Option<u16>) -> NakAckMessage {
        NakAckMessage::Data(DataMessage {
            seqno: Seqno::from_raw(seqno),
            first: seqno == 1,
            xmit: true,
            original_sender: original_sender.map(test_node_addr_from_number),
            payload: Bytes::from(format!("m{}", seqno)),
        })
    }

    fn ranges(seqnos: &[u64]) -> SeqnoRanges {
        seqnos.iter().map(|&s| Seqno::from_raw(s)).collect()
    }

    #[tokio::test]
    async fn test_multicast_delivers_locally() {
        let f = fixture(test_config());

        assert_eq!(f.nakack.multicast(Bytes::from_static(b"a")).await.unwrap(), SendOutcome::Sent(Seqno::from_raw(1)));
        assert_eq!(f.nakack.multicast(Bytes::from_static(b"b")).await.unwrap(), SendOutcome::Sent(Seqno::from_raw(2)));

        f.sender.assert_multicast_sent(NakAckMessage::Data(DataMessage {
            seqno: Seqno::from_raw(1),
            first: true,
            xmit: false,
            original_sender: None,
            payload: Bytes::from_static(b"a"),
        })).await;
        f.sender.assert_multicast_sent(NakAckMessage::Data(DataMessage {
            seqno: Seqno::from_raw(2),
            first: false,
            xmit: false,
            original_sender: None,
            payload: Bytes::from_static(b"b"),
        })).await;
        f.sender.assert_no_remaining_messages().await;

        assert_eq!(f.listener.seqnos_from(test_node_addr_from_number(1), true), vec![1, 2]);
        assert_eq!(f.nakack.retransmit_buffer().len(), 2);
        assert_eq!(f.nakack.stats().messages_sent, 2);
    }

    #[tokio::test]
    async fn test_multicast_too_big() {
        let mut config = test_config();
        config.max_message_size = 4;
        let f = fixture(config);

        assert!(f.nakack.multicast(Bytes::from_static(b"12345")).await.is_err());
        f.sender.assert_no_remaining_messages().await;
    }

    #[tokio::test]
    async fn test_multicast_non_blocking_without_credit() {
        let mut config = test_config();
        config.flow_control_mode = FlowControlMode::NonBlocking;

        let mut flow_control = MockFlowControl::new();
        flow_control.expect_reserve_credit()
            .once()
            .withf(|target, n| *target == FlowTarget::Multicast && *n == 3)
            .return_const(Credit::Blocked);
        let f = fixture_with_flow_control(config, Arc::new(flow_control));

        assert_eq!(f.nakack.multicast(Bytes::from_static(b"abc")).await.unwrap(), SendOutcome::NoCredit);
        f.sender.assert_no_remaining_messages().await;
        assert!(f.nakack.retransmit_buffer().is_empty());
    }

    #[tokio::test]
    async fn test_multicast_blocking_waits_for_credit() {
        let mut flow_control = MockFlowControl::new();
        let mut seq = mockall::Sequence::new();
        flow_control.expect_reserve_credit()
            .once()
            .in_sequence(&mut seq)
            .return_const(Credit::Blocked);
        flow_control.expect_credit_available()
            .once()
            .in_sequence(&mut seq)
            .returning(|_| ());
        flow_control.expect_reserve_credit()
            .once()
            .in_sequence(&mut seq)
            .return_const(Credit::Granted);
        let f = fixture_with_flow_control(test_config(), Arc::new(flow_control));

        assert_eq!(f.nakack.multicast(Bytes::from_static(b"abc")).await.unwrap(), SendOutcome::Sent(Seqno::FIRST));
    }

    #[tokio::test]
    async fn test_receive_in_order_and_reordered() {
        let f = fixture(test_config());
        f.nakack.on_view_change(&test_view(1, &[1, 2])).await;

        for seqno in [1, 2, 4, 3, 3, 5] {
            receive(&f.nakack, 2, data(seqno)).await;
        }

        assert_eq!(f.listener.seqnos_from(test_node_addr_from_number(2), true), vec![1, 2, 3, 4, 5]);
        assert_eq!(f.nakack.stats().duplicates_received, 1);
        assert!(f.listener.errors().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_sender() {
        let f = fixture(test_config());

        receive(&f.nakack, 3, data(7)).await;
        assert_eq!(f.listener.num_deliveries(), 0);

        // a message flagged 'first' introduces the sender
        receive(&f.nakack, 3, data(1)).await;
        receive(&f.nakack, 3, data(2)).await;
        assert_eq!(f.listener.seqnos_from(test_node_addr_from_number(3), true), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gap_is_requested_from_original_sender() {
        let f = fixture(test_config());
        f.nakack.on_view_change(&test_view(1, &[1, 2])).await;

        for seqno in [1, 2, 3, 4, 6, 8] {
            receive(&f.nakack, 2, data(seqno)).await;
        }
        assert_eq!(f.listener.seqnos_from(test_node_addr_from_number(2), true), vec![1, 2, 3, 4]);

        // first tick only detects the gap
        f.nakack.on_retransmit_tick::<RngRandom>().await;
        f.sender.assert_no_remaining_messages().await;

        time::advance(Duration::from_millis(100)).await;
        f.nakack.on_retransmit_tick::<RngRandom>().await;
        f.sender.assert_message_sent(test_node_addr_from_number(2), NakAckMessage::XmitReq {
            original_sender: test_node_addr_from_number(2),
            missing: ranges(&[5, 7]),
        }).await;
        f.sender.assert_no_remaining_messages().await;

        receive(&f.nakack, 2, xmit_data(5, None)).await;
        receive(&f.nakack, 2, xmit_data(7, None)).await;
        assert_eq!(f.listener.seqnos_from(test_node_addr_from_number(2), true), vec![1, 2, 3, 4, 5, 6, 7, 8]);

        time::advance(Duration::from_millis(1000)).await;
        f.nakack.on_retransmit_tick::<RngRandom>().await;
        f.sender.assert_no_remaining_messages().await;

        let stats = f.nakack.stats();
        assert_eq!(stats.xmit_requests_sent, 1);
        assert_eq!(stats.xmit_responses_received, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retransmission_lenient() {
        let mut config = test_config();
        config.retransmit.max_attempts = 1;
        let f = fixture(config);
        f.nakack.on_view_change(&test_view(1, &[1, 2])).await;

        for seqno in [1, 3] {
            receive(&f.nakack, 2, data(seqno)).await;
        }
        for _ in 0..3 {
            f.nakack.on_retransmit_tick::<RngRandom>().await;
            time::advance(Duration::from_millis(200)).await;
        }

        assert_eq!(f.listener.seqnos_from(test_node_addr_from_number(2), true), vec![1, 3]);
        assert_eq!(f.listener.errors(), vec![DeliveryError::MessagesSkipped {
            sender: test_node_addr_from_number(2),
            missing: ranges(&[2]),
        }]);
        assert_eq!(f.nakack.stats().messages_skipped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retransmission_strict() {
        let mut config = test_config();
        config.retransmit.max_attempts = 1;
        config.delivery_mode = DeliveryMode::Strict;
        let f = fixture(config);
        let sender = test_node_addr_from_number(2);
        f.nakack.on_view_change(&test_view(1, &[1, 2])).await;

        for seqno in [1, 3] {
            receive(&f.nakack, 2, data(seqno)).await;
        }
        for _ in 0..3 {
            f.nakack.on_retransmit_tick::<RngRandom>().await;
            time::advance(Duration::from_millis(200)).await;
        }

        assert_eq!(f.listener.errors(), vec![DeliveryError::PermanentLoss {
            sender,
            missing: ranges(&[2]),
        }]);
        assert!(f.nakack.window(&sender).await.unwrap().is_halted());

        // a late retransmission does not resume delivery
        receive(&f.nakack, 2, xmit_data(2, None)).await;
        assert_eq!(f.listener.seqnos_from(sender, true), vec![1]);
        assert_eq!(f.nakack.stats().messages_skipped, 0);
    }

    #[tokio::test]
    async fn test_answer_xmit_req() {
        let f = fixture(test_config());
        for payload in ["a", "b", "c"] {
            f.nakack.multicast(Bytes::from(payload)).await.unwrap();
        }
        f.sender.sent_messages::<NakAckMessage>().await;

        receive(&f.nakack, 2, NakAckMessage::XmitReq {
            original_sender: test_node_addr_from_number(1),
            missing: ranges(&[1, 3]),
        }).await;

        let requester = test_node_addr_from_number(2);
        f.sender.assert_message_sent(requester, NakAckMessage::Data(DataMessage {
            seqno: Seqno::from_raw(1),
            first: true,
            xmit: true,
            original_sender: None,
            payload: Bytes::from_static(b"a"),
        })).await;
        f.sender.assert_message_sent(requester, NakAckMessage::Data(DataMessage {
            seqno: Seqno::from_raw(3),
            first: false,
            xmit: true,
            original_sender: None,
            payload: Bytes::from_static(b"c"),
        })).await;
        f.sender.assert_no_remaining_messages().await;
    }

    #[tokio::test]
    async fn test_answer_xmit_req_for_purged() {
        let f = fixture(test_config());
        for payload in ["a", "b", "c"] {
            f.nakack.multicast(Bytes::from(payload)).await.unwrap();
        }
        f.sender.sent_messages::<NakAckMessage>().await;

        f.nakack.apply_stability(&[(test_node_addr_from_number(1), Watermarks::at(Seqno::from_raw(2)))].into_iter().collect()).await;
        assert_eq!(f.nakack.retransmit_buffer().len(), 1);

        receive(&f.nakack, 2, NakAckMessage::XmitReq {
            original_sender: test_node_addr_from_number(1),
            missing: ranges(&[1, 2, 3]),
        }).await;

        let requester = test_node_addr_from_number(2);
        f.sender.assert_message_sent(requester, NakAckMessage::XmitFirstAvailable {
            original_sender: test_node_addr_from_number(1),
            first: Seqno::from_raw(3),
        }).await;
        f.sender.assert_message_sent(requester, NakAckMessage::Data(DataMessage {
            seqno: Seqno::from_raw(3),
            first: false,
            xmit: true,
            original_sender: None,
            payload: Bytes::from_static(b"c"),
        })).await;
        f.sender.assert_no_remaining_messages().await;
    }

    #[tokio::test]
    async fn test_first_available_fast_forwards() {
        let f = fixture(test_config());
        f.nakack.on_view_change(&test_view(1, &[1, 2])).await;

        for seqno in [1, 5, 6] {
            receive(&f.nakack, 2, data(seqno)).await;
        }
        receive(&f.nakack, 2, NakAckMessage::XmitFirstAvailable {
            original_sender: test_node_addr_from_number(2),
            first: Seqno::from_raw(4),
        }).await;
        assert_eq!(f.listener.seqnos_from(test_node_addr_from_number(2), true), vec![1]);

        receive(&f.nakack, 2, xmit_data(4, None)).await;
        assert_eq!(f.listener.seqnos_from(test_node_addr_from_number(2), true), vec![1, 4, 5, 6]);
        assert_eq!(f.listener.errors(), vec![DeliveryError::MessagesSkipped {
            sender: test_node_addr_from_number(2),
            missing: ranges(&[2, 3]),
        }]);
    }

    #[tokio::test]
    async fn test_first_available_only_from_original_sender() {
        let f = fixture(test_config());
        let sender = test_node_addr_from_number(2);
        f.nakack.on_view_change(&test_view(1, &[1, 2, 3])).await;

        for seqno in [1, 5] {
            receive(&f.nakack, 2, data(seqno)).await;
        }
        let first_available = NakAckMessage::XmitFirstAvailable {
            original_sender: sender,
            first: Seqno::from_raw(4),
        };

        receive(&f.nakack, 3, first_available.clone()).await;
        assert!(f.listener.errors().is_empty());
        assert_eq!(f.nakack.stats().messages_skipped, 0);
        assert_eq!(f.nakack.window(&sender).await.unwrap().table().num_missing(), 3);

        receive(&f.nakack, 2, first_available).await;
        assert_eq!(f.listener.errors(), vec![DeliveryError::MessagesSkipped {
            sender,
            missing: ranges(&[2, 3]),
        }]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_highest_seqno_reveals_lost_tail() {
        let mut config = test_config();
        config.retransmit.suppress_first_tick = false;
        let f = fixture(config);
        f.nakack.on_view_change(&test_view(1, &[1, 2])).await;

        receive(&f.nakack, 2, data(1)).await;
        receive(&f.nakack, 2, NakAckMessage::HighestSeqno(Seqno::from_raw(2))).await;
        f.nakack.on_retransmit_tick::<RngRandom>().await;

        f.sender.assert_message_sent(test_node_addr_from_number(2), NakAckMessage::XmitReq {
            original_sender: test_node_addr_from_number(2),
            missing: ranges(&[2]),
        }).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_resend_last_seqno() {
        let mut config = test_config();
        config.retransmit.resend_last_seqno = true;
        config.retransmit.resend_last_seqno_max_times = 2;
        let f = fixture(config);

        f.nakack.on_retransmit_tick::<RngRandom>().await;
        f.sender.assert_no_remaining_messages().await;

        f.nakack.multicast(Bytes::from_static(b"a")).await.unwrap();
        f.sender.sent_messages::<NakAckMessage>().await;

        // the first tick after sending notices the new seqno, the next ones are idle
        for _ in 0..4 {
            f.nakack.on_retransmit_tick::<RngRandom>().await;
        }
        f.sender.assert_multicast_sent(NakAckMessage::HighestSeqno(Seqno::FIRST)).await;
        f.sender.assert_multicast_sent(NakAckMessage::HighestSeqno(Seqno::FIRST)).await;
        f.sender.assert_no_remaining_messages().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_xmit_from_random_member() {
        let mut config = test_config();
        config.table.discard_delivered = false;
        config.retransmit.xmit_from_random_member = true;
        config.retransmit.suppress_first_tick = false;
        let f = fixture(config);
        f.nakack.on_view_change(&test_view(1, &[1, 2, 3])).await;

        // answering for a member whose messages are retained
        receive(&f.nakack, 2, data(1)).await;
        receive(&f.nakack, 3, NakAckMessage::XmitReq {
            original_sender: test_node_addr_from_number(2),
            missing: ranges(&[1]),
        }).await;
        f.sender.assert_message_sent(test_node_addr_from_number(3), xmit_data(1, Some(2))).await;

        // a retransmission from a member other than the original sender
        receive(&f.nakack, 2, xmit_data(1, Some(3))).await;
        receive(&f.nakack, 2, xmit_data(2, Some(3))).await;
        assert_eq!(f.listener.seqnos_from(test_node_addr_from_number(3), true), vec![1, 2]);

        receive(&f.nakack, 3, data(4)).await;
        f.nakack.on_retransmit_tick::<RngRandom>().await;
        let sent = f.sender.sent_messages::<NakAckMessage>().await;
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0].0, SentTo::Unicast(to) if to == test_node_addr_from_number(2) || to == test_node_addr_from_number(3)));
        assert_eq!(sent[0].1, NakAckMessage::XmitReq {
            original_sender: test_node_addr_from_number(3),
            missing: ranges(&[3]),
        });
    }

    #[tokio::test]
    async fn test_digest_and_set_digest() {
        let f = fixture(test_config());
        f.nakack.on_view_change(&test_view(1, &[1, 2])).await;
        f.nakack.multicast(Bytes::from_static(b"a")).await.unwrap();
        receive(&f.nakack, 2, data(1)).await;

        let digest = f.nakack.digest().await;
        assert_eq!(digest.get(&test_node_addr_from_number(1)), Some(Watermarks::new(Seqno::ZERO, Seqno::FIRST, Seqno::FIRST)));
        assert_eq!(digest.get(&test_node_addr_from_number(2)), Some(Watermarks::new(Seqno::ZERO, Seqno::FIRST, Seqno::FIRST)));
        assert_eq!(digest.len(), 2);

        let remote: Digest = [
            (test_node_addr_from_number(1), Watermarks::at(Seqno::from_raw(50))),
            (test_node_addr_from_number(2), Watermarks::new(Seqno::ZERO, Seqno::FIRST, Seqno::from_raw(3))),
            (test_node_addr_from_number(3), Watermarks::at(Seqno::from_raw(10))),
        ].into_iter().collect();
        f.nakack.set_digest(&remote).await;
        f.nakack.set_digest(&remote).await;

        let digest = f.nakack.digest().await;
        // own table is never changed by a digest
        assert_eq!(digest.get(&test_node_addr_from_number(1)), Some(Watermarks::new(Seqno::ZERO, Seqno::FIRST, Seqno::FIRST)));
        assert_eq!(digest.get(&test_node_addr_from_number(2)), Some(Watermarks::new(Seqno::ZERO, Seqno::FIRST, Seqno::from_raw(3))));
        assert_eq!(digest.get(&test_node_addr_from_number(3)), Some(Watermarks::at(Seqno::from_raw(10))));

        // messages of a sender introduced by the digest are delivered from its watermarks on
        receive(&f.nakack, 3, data(11)).await;
        assert_eq!(f.listener.seqnos_from(test_node_addr_from_number(3), true), vec![11]);
    }

    #[tokio::test]
    async fn test_stability_purges_and_releases_credit() {
        let mut flow_control = MockFlowControl::new();
        flow_control.expect_reserve_credit()
            .return_const(Credit::Granted);
        flow_control.expect_release()
            .once()
            .withf(|target, n| *target == FlowTarget::Multicast && *n == 2)
            .return_const(());
        let f = fixture_with_flow_control(test_config(), Arc::new(flow_control));
        f.nakack.on_view_change(&test_view(1, &[1, 2])).await;

        for payload in ["a", "b", "c"] {
            f.nakack.multicast(Bytes::from(payload)).await.unwrap();
        }
        for seqno in 1..=4 {
            receive(&f.nakack, 2, data(seqno)).await;
        }

        let stable: Digest = [
            (test_node_addr_from_number(1), Watermarks::at(Seqno::from_raw(2))),
            (test_node_addr_from_number(2), Watermarks::at(Seqno::from_raw(3))),
        ].into_iter().collect();
        f.nakack.apply_stability(&stable).await;
        f.nakack.apply_stability(&stable).await;

        assert_eq!(f.nakack.retransmit_buffer().len(), 1);
        let digest = f.nakack.digest().await;
        assert_eq!(digest.get(&test_node_addr_from_number(1)).unwrap().low, Seqno::from_raw(2));
        assert_eq!(digest.get(&test_node_addr_from_number(2)).unwrap().low, Seqno::from_raw(3));
    }

    #[tokio::test]
    async fn test_view_change_retires_departed_members() {
        let f = fixture(test_config());
        f.nakack.on_view_change(&test_view(1, &[1, 2, 3])).await;
        receive(&f.nakack, 2, data(1)).await;
        receive(&f.nakack, 3, data(1)).await;
        receive(&f.nakack, 3, data(3)).await;

        f.nakack.on_view_change(&test_view(2, &[1, 4])).await;
        let digest = f.nakack.digest().await;
        assert_eq!(digest.senders().copied().collect::<Vec<_>>(), vec![
            test_node_addr_from_number(1),
            test_node_addr_from_number(4),
        ]);

        // node 2 has nothing left to deliver, node 3 has a gap
        f.nakack.remove_retired_windows().await;
        assert!(f.nakack.window(&test_node_addr_from_number(2)).await.is_none());
        assert!(f.nakack.window(&test_node_addr_from_number(3)).await.is_some());

        receive(&f.nakack, 3, xmit_data(2, None)).await;
        f.nakack.remove_retired_windows().await;
        assert!(f.nakack.window(&test_node_addr_from_number(3)).await.is_none());
        assert_eq!(f.listener.seqnos_from(test_node_addr_from_number(3), true), vec![1, 2, 3]);

        // retired senders are not re-introduced by late messages
        receive(&f.nakack, 2, data(1)).await;
        assert!(f.nakack.window(&test_node_addr_from_number(2)).await.is_none());
    }

    #[tokio::test]
    async fn test_malformed_message_is_ignored() {
        let f = fixture(test_config());
        let envelope = Envelope {
            from: test_node_addr_from_number(2),
            checksum: Checksum(0),
            protocol_id: NAKACK_PROTOCOL_ID,
        };
        f.nakack.on_message(&envelope, b"\x01\x02").await;
        assert_eq!(f.listener.num_deliveries(), 0);
    }

    #[derive(Debug)]
    struct SlowMulticastSender {
        inner: TrackingMockMessageSender,
    }

    #[async_trait]
    impl MessageSender for SlowMulticastSender {
        fn get_self_addr(&self) -> NodeAddr {
            self.inner.get_self_addr()
        }

        async fn try_send_to<T: Message>(&self, to: NodeAddr, msg: &T) -> anyhow::Result<()> {
            self.inner.try_send_to(to, msg).await
        }

        async fn try_multicast<T: Message>(&self, msg: &T) -> anyhow::Result<()> {
            time::sleep(Duration::from_millis(50)).await;
            self.inner.try_multicast(msg).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_multicast_is_delivered_locally() {
        let myself = test_node_addr_from_number(1);
        let sender = Arc::new(SlowMulticastSender { inner: TrackingMockMessageSender::new(myself) });
        let listener = Arc::new(CollectingListener::new());
        let nakack = NakAck::new(Arc::new(test_config()), sender, listener.clone(), Arc::new(NoFlowControl::default()), None);

        assert!(time::timeout(Duration::from_millis(5), nakack.multicast(Bytes::from_static(b"a"))).await.is_err());
        assert_eq!(nakack.multicast(Bytes::from_static(b"b")).await.unwrap(), SendOutcome::Sent(Seqno::from_raw(2)));

        assert_eq!(listener.seqnos_from(myself, true), vec![1, 2]);
        assert_eq!(nakack.own_window.table().watermarks().highest_delivered, Seqno::from_raw(2));
        assert_eq!(nakack.retransmit_buffer().len(), 2);
    }

    #[test]
    fn test_last_seqno_resender() {
        let mut resender = LastSeqnoResender::default();
        assert!(!resender.on_tick(Seqno::ZERO, 2));
        assert!(!resender.on_tick(Seqno::from_raw(3), 2));
        assert!(resender.on_tick(Seqno::from_raw(3), 2));
        assert!(resender.on_tick(Seqno::from_raw(3), 2));
        assert!(!resender.on_tick(Seqno::from_raw(3), 2));
        assert!(!resender.on_tick(Seqno::from_raw(4), 2));
        assert!(resender.on_tick(Seqno::from_raw(4), 2));
    }
}
