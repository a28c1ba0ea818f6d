//! Reliable, ordered point-to-point messages.
//!
//! Each pair of members has a connection per direction. The sender numbers its messages and
//!  keeps them in a retransmission buffer, the receiver delivers them in order through a table and
//!  requests gaps like the multicast layer does. Unlike multicast, the receiver acknowledges what
//!  it delivered: after a configurable number of deliveries and on every retransmission tick. An
//!  acknowledgement lets the sender purge its buffer and release flow control credit.
//!
//! Connections are identified by a `conn_id` that the sender picks when it starts sending to a
//!  peer. A receiver that gets a message for an unknown connection asks the sender for its first
//!  buffered message, which (re)starts the connection on the receiving side.

pub mod unicast_messages;

use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tokio::time;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::config::GroupConfig;
use crate::delivery::{MessageListener, SendOutcome};
use crate::flow_control::{reserve_credit, Credit, FlowControl, FlowTarget};
use crate::membership::View;
use crate::messaging::envelope::Envelope;
use crate::messaging::message::MessageSender;
use crate::messaging::node_addr::NodeAddr;
use crate::messaging::protocol_id::ProtocolId;
use crate::receive_window::ReceiveWindow;
use crate::retransmit::send_buffer::{RetransmitBuffer, XmitLookup};
use crate::seqno::Seqno;
use crate::stack::ProtocolLayer;
use crate::stats::{DeliveryStats, DeliveryStatsSnapshot};
use crate::table::missing::SeqnoRanges;
use crate::table::Watermarks;
use crate::unicast::unicast_messages::{UnicastMessage, UNICAST_PROTOCOL_ID};
use crate::util::random::{Random, RngRandom};

struct SendEntry {
    conn_id: u16,
    buffer: RetransmitBuffer,
    /// highest sent seqno as of the previous tick, for detecting an idle connection
    highest_sent_at_last_tick: Mutex<Seqno>,
}

struct ReceiveEntry {
    conn_id: u16,
    window: ReceiveWindow,
    delivered_since_ack: AtomicU32,
    last_acked: Mutex<Seqno>,
}

impl ReceiveEntry {
    /// returns the seqno to acknowledge, if there is progress since the last acknowledgement
    fn take_ack(&self, force: bool) -> Option<Seqno> {
        let highest_delivered = self.window.table().watermarks().highest_delivered;
        let mut last_acked = self.last_acked.lock()
            .unwrap_or_else(|e| e.into_inner());
        if highest_delivered == Seqno::ZERO || (!force && highest_delivered <= *last_acked) {
            return None;
        }
        *last_acked = highest_delivered;
        self.delivered_since_ack.store(0, Ordering::Release);
        Some(highest_delivered)
    }
}

pub struct Unicast<S: MessageSender> {
    myself: NodeAddr,
    config: Arc<GroupConfig>,
    sender: Arc<S>,
    listener: Arc<dyn MessageListener>,
    flow_control: Arc<dyn FlowControl>,

    next_conn_id: AtomicU16,
    send_entries: RwLock<FxHashMap<NodeAddr, Arc<SendEntry>>>,
    receive_entries: RwLock<FxHashMap<NodeAddr, Arc<ReceiveEntry>>>,
    /// messages to the local member bypass the transport
    loopback: ReceiveWindow,
    loopback_seqno: Mutex<Seqno>,
    stats: DeliveryStats,
}

impl<S: MessageSender> Unicast<S> {
    pub fn new(config: Arc<GroupConfig>, sender: Arc<S>, listener: Arc<dyn MessageListener>, flow_control: Arc<dyn FlowControl>) -> Unicast<S> {
        Self::new_with_random::<RngRandom>(config, sender, listener, flow_control)
    }

    fn new_with_random<R: Random>(config: Arc<GroupConfig>, sender: Arc<S>, listener: Arc<dyn MessageListener>, flow_control: Arc<dyn FlowControl>) -> Unicast<S> {
        let myself = sender.get_self_addr();
        let loopback = ReceiveWindow::new(myself, false, Watermarks::default(), &config, listener.clone());
        Unicast {
            myself,
            config,
            sender,
            listener,
            flow_control,
            next_conn_id: AtomicU16::new(R::next_u32() as u16),
            send_entries: Default::default(),
            receive_entries: Default::default(),
            loopback,
            loopback_seqno: Default::default(),
            stats: Default::default(),
        }
    }

    /// Sends a message to a single member. With [crate::config::FlowControlMode::Block], this
    ///  waits for flow control credit.
    pub async fn send_to(&self, to: NodeAddr, payload: Bytes) -> anyhow::Result<SendOutcome> {
        if payload.len() > self.config.max_message_size {
            bail!("message of {} bytes exceeds the maximum message size of {} bytes", payload.len(), self.config.max_message_size);
        }

        if to == self.myself {
            return self.send_to_self(payload);
        }

        let num_bytes = payload.len();
        if reserve_credit(self.flow_control.as_ref(), self.config.flow_control_mode, FlowTarget::Unicast(to), num_bytes).await == Credit::Blocked {
            return Ok(SendOutcome::NoCredit);
        }

        let entry = self.send_entry(to).await;
        let seqno = match entry.buffer.append(payload.clone()) {
            Ok(seqno) => seqno,
            Err(e) => {
                self.flow_control.release(FlowTarget::Unicast(to), num_bytes);
                return Err(e);
            }
        };

        trace!("sending message {} to {:?}", seqno, to);
        self.sender.send_to(to, &UnicastMessage::Data {
            seqno,
            conn_id: entry.conn_id,
            first: seqno == Seqno::FIRST,
            xmit: false,
            payload,
        }).await;
        DeliveryStats::inc(&self.stats.messages_sent);
        Ok(SendOutcome::Sent(seqno))
    }

    fn send_to_self(&self, payload: Bytes) -> anyhow::Result<SendOutcome> {
        let seqno = {
            let mut loopback_seqno = self.loopback_seqno.lock()
                .unwrap_or_else(|e| e.into_inner());
            let Some(seqno) = loopback_seqno.next() else {
                bail!("seqnos are exhausted");
            };
            *loopback_seqno = seqno;
            seqno
        };
        self.loopback.add(seqno, payload);
        self.loopback.drain_and_purge();
        DeliveryStats::inc(&self.stats.messages_sent);
        Ok(SendOutcome::Sent(seqno))
    }

    async fn send_entry(&self, to: NodeAddr) -> Arc<SendEntry> {
        if let Some(entry) = self.send_entries.read().await.get(&to) {
            return entry.clone();
        }
        self.send_entries.write().await
            .entry(to)
            .or_insert_with(|| {
                let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
                debug!("starting connection {} to {:?}", conn_id, to);
                Arc::new(SendEntry {
                    conn_id,
                    buffer: RetransmitBuffer::new(),
                    highest_sent_at_last_tick: Default::default(),
                })
            })
            .clone()
    }

    /// the send entry for a peer, if it belongs to the given connection
    async fn send_entry_for(&self, peer: &NodeAddr, conn_id: u16) -> Option<Arc<SendEntry>> {
        let entry = self.send_entries.read().await.get(peer).cloned()?;
        if entry.conn_id != conn_id {
            debug!("ignoring message from {:?} for stale connection {} (current is {})", peer, conn_id, entry.conn_id);
            return None;
        }
        Some(entry)
    }

    async fn receive_entry_for(&self, peer: &NodeAddr, conn_id: u16) -> Option<Arc<ReceiveEntry>> {
        self.receive_entries.read().await
            .get(peer)
            .filter(|e| e.conn_id == conn_id)
            .cloned()
    }

    async fn on_data(&self, from: NodeAddr, seqno: Seqno, conn_id: u16, first: bool, xmit: bool, payload: Bytes) {
        if xmit {
            DeliveryStats::inc(&self.stats.xmit_responses_received);
        }
        else {
            DeliveryStats::inc(&self.stats.messages_received);
        }

        let entry = match self.receive_entry_for(&from, conn_id).await {
            Some(entry) => entry,
            None if first => self.start_receive_connection(from, conn_id, seqno).await,
            None => {
                debug!("message {} from {:?} for unknown connection {} - asking for the first message", seqno, from, conn_id);
                self.sender.send_to(from, &UnicastMessage::SendFirstSeqno { conn_id }).await;
                return;
            }
        };

        if !entry.window.add(seqno, payload) {
            // the sender may have missed our acknowledgement
            trace!("discarding duplicate {} from {:?}", seqno, from);
            DeliveryStats::inc(&self.stats.duplicates_received);
            self.send_ack(from, &entry, true).await;
            return;
        }

        let num_delivered = entry.window.drain_and_purge() as u32;
        let delivered_since_ack = entry.delivered_since_ack.fetch_add(num_delivered, Ordering::AcqRel) + num_delivered;
        if delivered_since_ack >= self.config.unicast.ack_threshold {
            self.send_ack(from, &entry, false).await;
        }
    }

    async fn start_receive_connection(&self, from: NodeAddr, conn_id: u16, first_seqno: Seqno) -> Arc<ReceiveEntry> {
        let mut receive_entries = self.receive_entries.write().await;
        if let Some(existing) = receive_entries.get(&from) {
            if existing.conn_id == conn_id {
                return existing.clone();
            }
            debug!("{:?} started a new connection {} replacing {}", from, conn_id, existing.conn_id);
        }
        else {
            debug!("{:?} started connection {} at {}", from, conn_id, first_seqno);
        }

        let entry = Arc::new(ReceiveEntry {
            conn_id,
            window: ReceiveWindow::new(from, false, Watermarks::at(first_seqno.prev()), &self.config, self.listener.clone()),
            delivered_since_ack: AtomicU32::new(0),
            last_acked: Mutex::new(first_seqno.prev()),
        });
        receive_entries.insert(from, entry.clone());
        entry
    }

    async fn send_ack(&self, to: NodeAddr, entry: &ReceiveEntry, force: bool) {
        if let Some(seqno) = entry.take_ack(force) {
            trace!("acknowledging {} to {:?}", seqno, to);
            self.sender.send_to(to, &UnicastMessage::Ack { seqno, conn_id: entry.conn_id }).await;
            DeliveryStats::inc(&self.stats.acks_sent);
        }
    }

    async fn on_ack(&self, from: NodeAddr, seqno: Seqno, conn_id: u16) {
        DeliveryStats::inc(&self.stats.acks_received);
        let Some(entry) = self.send_entry_for(&from, conn_id).await else {
            return;
        };
        if seqno > entry.buffer.highest_sent() {
            warn!("{:?} acknowledged {} which was never sent - ignoring", from, seqno);
            return;
        }
        let num_released = entry.buffer.purge(seqno);
        if num_released > 0 {
            self.flow_control.release(FlowTarget::Unicast(from), num_released);
        }
    }

    async fn on_xmit_req(&self, from: NodeAddr, conn_id: u16, missing: SeqnoRanges) {
        DeliveryStats::inc(&self.stats.xmit_requests_received);
        let Some(entry) = self.send_entry_for(&from, conn_id).await else {
            return;
        };

        let mut sent_first_available = false;
        for seqno in missing.iter().take(self.config.retransmit.max_xmit_req_size as usize) {
            match entry.buffer.lookup(seqno) {
                XmitLookup::Found(payload) => {
                    self.send_xmit(from, &entry, seqno, seqno == Seqno::FIRST, payload).await;
                }
                XmitLookup::Purged { first_available } => {
                    if !sent_first_available {
                        debug!("{:?} requested purged seqno {}, first available is {}", from, seqno, first_available);
                        self.sender.send_to(from, &UnicastMessage::XmitFirstAvailable { conn_id, first: first_available }).await;
                        sent_first_available = true;
                    }
                }
                XmitLookup::NotSent => {
                    warn!("{:?} requested seqno {} which was never sent - ignoring", from, seqno);
                    break;
                }
            }
        }
    }

    async fn send_xmit(&self, to: NodeAddr, entry: &SendEntry, seqno: Seqno, first: bool, payload: Bytes) {
        self.sender.send_to(to, &UnicastMessage::Data {
            seqno,
            conn_id: entry.conn_id,
            first,
            xmit: true,
            payload,
        }).await;
        DeliveryStats::inc(&self.stats.xmit_responses_sent);
    }

    async fn on_first_available(&self, from: NodeAddr, conn_id: u16, first: Seqno) {
        if let Some(entry) = self.receive_entry_for(&from, conn_id).await {
            let num_skipped = entry.window.on_first_available(first);
            DeliveryStats::add(&self.stats.messages_skipped, num_skipped);
            entry.window.drain_and_purge();
        }
    }

    async fn on_send_first_seqno(&self, from: NodeAddr, conn_id: u16) {
        let Some(entry) = self.send_entry_for(&from, conn_id).await else {
            return;
        };
        match entry.buffer.first() {
            Some((seqno, payload)) => {
                debug!("{:?} asked for the first message - resending {}", from, seqno);
                self.send_xmit(from, &entry, seqno, true, payload).await;
            }
            None => debug!("{:?} asked for the first message, but all messages were acknowledged", from),
        }
    }

    async fn on_retransmit_tick<R: Random>(&self) {
        let now = Instant::now();

        let receive_entries = self.receive_entries.read().await
            .iter()
            .map(|(peer, e)| (*peer, e.clone()))
            .collect::<Vec<_>>();
        for (peer, entry) in receive_entries {
            let (request, num_skipped) = entry.window.retransmit_tick::<R>(now);
            DeliveryStats::add(&self.stats.messages_skipped, num_skipped);
            if !request.is_empty() {
                trace!("requesting {:?} from {:?}", request, peer);
                self.sender.send_to(peer, &UnicastMessage::XmitReq { conn_id: entry.conn_id, missing: request }).await;
                DeliveryStats::inc(&self.stats.xmit_requests_sent);
            }
            self.send_ack(peer, &entry, false).await;
        }

        let send_entries = self.send_entries.read().await
            .iter()
            .map(|(peer, e)| (*peer, e.clone()))
            .collect::<Vec<_>>();
        for (peer, entry) in send_entries {
            if let Some(max_age) = self.config.unicast.max_retransmit_time {
                let num_expired = entry.buffer.expire(now, max_age);
                if num_expired > 0 {
                    debug!("dropped {} bytes of unacknowledged messages to {:?} after {:?}", num_expired, peer, max_age);
                    self.flow_control.release(FlowTarget::Unicast(peer), num_expired);
                }
            }
            self.resend_unacknowledged_tail(peer, &entry).await;
        }
    }

    /// If nothing was sent on a connection since the last tick and the highest message is still
    ///  unacknowledged, it is sent again: either it was lost, or the acknowledgement was.
    async fn resend_unacknowledged_tail(&self, peer: NodeAddr, entry: &SendEntry) {
        let highest_sent = entry.buffer.highest_sent();
        let is_idle = {
            let mut at_last_tick = entry.highest_sent_at_last_tick.lock()
                .unwrap_or_else(|e| e.into_inner());
            let is_idle = *at_last_tick == highest_sent;
            *at_last_tick = highest_sent;
            is_idle
        };
        if !is_idle {
            return;
        }
        if let XmitLookup::Found(payload) = entry.buffer.lookup(highest_sent) {
            trace!("resending unacknowledged message {} to {:?}", highest_sent, peer);
            self.send_xmit(peer, entry, highest_sent, highest_sent == Seqno::FIRST, payload).await;
        }
    }

    pub fn stats(&self) -> DeliveryStatsSnapshot {
        self.stats.snapshot()
    }

    async fn _on_message(&self, envelope: &Envelope, buf: &[u8]) -> anyhow::Result<()> {
        let from = envelope.from;
        match UnicastMessage::deser(buf)? {
            UnicastMessage::Data { seqno, conn_id, first, xmit, payload } => self.on_data(from, seqno, conn_id, first, xmit, payload).await,
            UnicastMessage::Ack { seqno, conn_id } => self.on_ack(from, seqno, conn_id).await,
            UnicastMessage::XmitReq { conn_id, missing } => self.on_xmit_req(from, conn_id, missing).await,
            UnicastMessage::XmitFirstAvailable { conn_id, first } => self.on_first_available(from, conn_id, first).await,
            UnicastMessage::SendFirstSeqno { conn_id } => self.on_send_first_seqno(from, conn_id).await,
        }
        Ok(())
    }
}

#[async_trait]
impl<S: MessageSender> ProtocolLayer for Unicast<S> {
    fn id(&self) -> ProtocolId {
        UNICAST_PROTOCOL_ID
    }

    async fn on_message(&self, envelope: &Envelope, buf: &[u8]) {
        if let Err(e) = self._on_message(envelope, buf).await {
            warn!("malformed message from {:?}: {}", envelope.from, e);
        }
    }

    /// Connections to and from members that left the view are closed.
    async fn on_view_change(&self, view: &View) {
        let mut send_entries = self.send_entries.write().await;
        let departed = send_entries.keys()
            .filter(|peer| !view.contains(peer))
            .copied()
            .collect::<Vec<_>>();
        for peer in departed {
            if let Some(entry) = send_entries.remove(&peer) {
                debug!("closing connection to {:?} which left the group", peer);
                let num_bytes = entry.buffer.num_bytes();
                if num_bytes > 0 {
                    self.flow_control.release(FlowTarget::Unicast(peer), num_bytes);
                }
            }
        }
        drop(send_entries);

        self.receive_entries.write().await
            .retain(|peer, _| view.contains(peer));
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
