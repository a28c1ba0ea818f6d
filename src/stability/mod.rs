//! Distributed garbage collection: members agree on the seqnos that were delivered everywhere, and
//!  purge them from their tables and retransmission buffers.
//!
//! The lowest member of the view drives rounds. A round is started periodically, or early when
//!  the multicast layer received a lot of data since the last round:
//!
//! ```ascii
//!  driver                     members
//!    | -- STABLE_REQUEST ------> |   (multicast)
//!    | <----------- STABLE ----- |   (unicast, each member's digest)
//!    |                           |
//!    |   min(highest delivered) per sender, over all votes
//!    |                           |
//!    | -- STABILITY -----------> |   (multicast, applied locally as well)
//! ```
//!
//! Members that do not answer in time contribute the last digest they sent in the current view.

pub mod stability_logic;
pub mod stability_messages;
pub mod trigger;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Instant, MissedTickBehavior};
use tokio::{select, time};
use tracing::{debug, error, trace, warn};

use crate::config::GroupConfig;
use crate::digest::Digest;
use crate::membership::View;
use crate::messaging::envelope::Envelope;
use crate::messaging::message::MessageSender;
use crate::messaging::node_addr::NodeAddr;
use crate::messaging::protocol_id::ProtocolId;
use crate::stability::stability_logic::{StabilityLogic, VoteOutcome};
use crate::stability::stability_messages::{StabilityMessage, STABLE_PROTOCOL_ID};
use crate::stability::trigger::StabilityTrigger;
use crate::stack::ProtocolLayer;
use crate::util::random::{jittered, RngRandom};

/// The layer whose buffers are garbage collected
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DigestSource: Send + Sync + 'static {
    async fn digest(&self) -> Digest;

    async fn apply_stability(&self, stable: &Digest);
}

#[derive(Debug)]
enum StabilityEvent {
    Message(NodeAddr, StabilityMessage),
    ViewChange(View),
    Suspend,
    Resume,
}

pub struct Stability<S: MessageSender> {
    config: Arc<GroupConfig>,
    sender: Arc<S>,
    digest_source: Arc<dyn DigestSource>,
    trigger: Arc<StabilityTrigger>,

    events: mpsc::Sender<StabilityEvent>,
    events_recv: Mutex<Option<mpsc::Receiver<StabilityEvent>>>,
}

impl<S: MessageSender> Stability<S> {
    pub fn new(config: Arc<GroupConfig>, sender: Arc<S>, digest_source: Arc<dyn DigestSource>, trigger: Arc<StabilityTrigger>) -> Stability<S> {
        let (events, events_recv) = mpsc::channel(1024);
        Stability {
            config,
            sender,
            digest_source,
            trigger,
            events,
            events_recv: Mutex::new(Some(events_recv)),
        }
    }

    fn new_logic(&self) -> StabilityLogic {
        StabilityLogic::new(self.sender.get_self_addr(), self.config.stability.clone())
    }

    /// Stops stability rounds, e.g. while a view is being installed. Stability resumes
    ///  automatically after the configured maximum suspension time.
    pub async fn suspend(&self) {
        let _ = self.events.send(StabilityEvent::Suspend).await;
    }

    pub async fn resume(&self) {
        let _ = self.events.send(StabilityEvent::Resume).await;
    }

    async fn on_event(&self, logic: &mut StabilityLogic, event: StabilityEvent) {
        match event {
            StabilityEvent::Message(from, msg) => self.on_stability_message(logic, from, msg).await,
            StabilityEvent::ViewChange(view) => logic.on_view_change(view, Instant::now()),
            StabilityEvent::Suspend => {
                debug!("suspending stability");
                logic.suspend(Instant::now());
            }
            StabilityEvent::Resume => {
                debug!("resuming stability");
                logic.resume();
            }
        }
    }

    async fn on_stability_message(&self, logic: &mut StabilityLogic, from: NodeAddr, msg: StabilityMessage) {
        trace!("received {:?} from {:?}", msg, from);
        match msg {
            StabilityMessage::StableRequest { view_id, round } => {
                if logic.accept_stable_request(from, view_id) {
                    self.trigger.reset();
                    let digest = self.digest_source.digest().await;
                    self.sender.send_to(from, &StabilityMessage::Stable { view_id, round, digest }).await;
                }
            }
            StabilityMessage::Stable { view_id, round, digest } => {
                match logic.on_stable(from, view_id, round, digest) {
                    VoteOutcome::StartRound => self.start_round(logic).await,
                    VoteOutcome::Recorded => self.check_round(logic).await,
                    VoteOutcome::Rejected => {}
                }
            }
            StabilityMessage::Stability { view_id, digest } => {
                if logic.accept_stability(from, view_id) {
                    self.digest_source.apply_stability(&digest).await;
                }
            }
        }
    }

    async fn start_round(&self, logic: &mut StabilityLogic) {
        if !logic.can_start_round() {
            return;
        }
        self.trigger.reset();
        let own_digest = self.digest_source.digest().await;
        if let Some(request) = logic.start_round(Instant::now(), own_digest) {
            self.sender.multicast(&request).await;
        }
        self.check_round(logic).await;
    }

    async fn check_round(&self, logic: &mut StabilityLogic) {
        let Some(view_id) = logic.view_id() else {
            return;
        };
        if let Some(stable) = logic.try_complete(Instant::now()) {
            self.sender.multicast(&StabilityMessage::Stability { view_id, digest: stable.clone() }).await;
            self.digest_source.apply_stability(&stable).await;
        }
    }

    /// Many bytes were received since the last round: the driver starts a round, other members
    ///  send their digest to the driver unsolicited.
    async fn on_threshold_reached(&self, logic: &mut StabilityLogic) {
        if logic.is_suspended() {
            return;
        }
        if logic.is_driver() {
            debug!("received bytes threshold reached - starting a stability round");
            self.start_round(logic).await;
            return;
        }

        if let (Some(driver), Some(view_id)) = (logic.driver(), logic.view_id()) {
            debug!("received bytes threshold reached - sending digest to {:?}", driver);
            self.trigger.reset();
            let digest = self.digest_source.digest().await;
            self.sender.send_to(driver, &StabilityMessage::Stable { view_id, round: 0, digest }).await;
        }
    }

    fn next_round_delay(&self) -> time::Duration {
        jittered::<RngRandom>(self.config.stability.interval, self.config.stability.jitter_ratio)
    }
}

#[async_trait]
impl<S: MessageSender> ProtocolLayer for Stability<S> {
    fn id(&self) -> ProtocolId {
        STABLE_PROTOCOL_ID
    }

    async fn on_message(&self, envelope: &Envelope, buf: &[u8]) {
        match StabilityMessage::deser(buf) {
            Ok(msg) => {
                // must not block the receive loop
                match self.events.try_send(StabilityEvent::Message(envelope.from, msg)) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => warn!("stability event queue is full - dropping message from {:?}", envelope.from),
                    Err(TrySendError::Closed(_)) => debug!("stability layer is shut down - dropping message from {:?}", envelope.from),
                }
            }
            Err(e) => warn!("malformed stability message from {:?}: {}", envelope.from, e),
        }
    }

    async fn on_view_change(&self, view: &View) {
        let _ = self.events.send(StabilityEvent::ViewChange(view.clone())).await;
    }

    async fn run(self: Arc<Self>) {
        let events_recv = self.events_recv.lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(mut events) = events_recv else {
            error!("stability layer is already running");
            return;
        };

        let mut logic = self.new_logic();

        let next_round = time::sleep(self.next_round_delay());
        tokio::pin!(next_round);

        let mut check_ticks = time::interval(self.config.stability.round_timeout / 4);
        check_ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                evt = events.recv() => {
                    match evt {
                        Some(evt) => self.on_event(&mut logic, evt).await,
                        None => return,
                    }
                }
                _ = &mut next_round => {
                    self.start_round(&mut logic).await;
                    next_round.as_mut().reset(Instant::now() + self.next_round_delay());
                }
                _ = self.trigger.triggered() => {
                    self.on_threshold_reached(&mut logic).await;
                }
                _ = check_ticks.tick() => {
                    logic.check_suspend_timeout(Instant::now());
                    self.check_round(&mut logic).await;
                }
            }
        }
    }
}
