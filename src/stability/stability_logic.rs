use std::collections::BTreeMap;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::StabilityConfig;
use crate::digest::Digest;
use crate::membership::View;
use crate::messaging::node_addr::NodeAddr;
use crate::stability::stability_messages::StabilityMessage;
use crate::table::Watermarks;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum VoteOutcome {
    Recorded,
    /// an unsolicited vote reached the driver while no round was in progress
    StartRound,
    Rejected,
}

/// The state of the stability protocol, without any I/O. All members track the view and
///  validate incoming messages; only the driver (the view's lowest member) runs rounds.
pub struct StabilityLogic {
    myself: NodeAddr,
    config: StabilityConfig,

    view: Option<View>,
    view_installed_at: Instant,

    round: u64,
    round_started_at: Option<Instant>,
    votes: BTreeMap<NodeAddr, Digest>,
    /// the most recent digest received from each member in the current view
    last_known: BTreeMap<NodeAddr, Digest>,

    suspended_since: Option<Instant>,
}

impl StabilityLogic {
    pub fn new(myself: NodeAddr, config: StabilityConfig) -> StabilityLogic {
        StabilityLogic {
            myself,
            config,
            view: None,
            view_installed_at: Instant::now(),
            round: 0,
            round_started_at: None,
            votes: Default::default(),
            last_known: Default::default(),
            suspended_since: None,
        }
    }

    pub fn view_id(&self) -> Option<u64> {
        self.view.as_ref().map(|v| v.id)
    }

    pub fn driver(&self) -> Option<NodeAddr> {
        self.view.as_ref().and_then(|v| v.stability_driver())
    }

    pub fn is_driver(&self) -> bool {
        self.driver() == Some(self.myself)
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended_since.is_some()
    }

    pub fn is_collecting(&self) -> bool {
        self.round_started_at.is_some()
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    fn end_round(&mut self) {
        self.round_started_at = None;
        self.votes.clear();
    }

    pub fn on_view_change(&mut self, view: View, now: Instant) {
        if self.is_collecting() {
            debug!("view change abandons stability round {}", self.round);
        }
        self.end_round();
        self.last_known.clear();
        self.view = Some(view);
        self.view_installed_at = now;
    }

    pub fn can_start_round(&self) -> bool {
        self.is_driver() && !self.is_suspended() && !self.is_collecting()
    }

    /// Starts a round with the driver's own digest as the first vote, returning the request to
    ///  multicast.
    pub fn start_round(&mut self, now: Instant, own_digest: Digest) -> Option<StabilityMessage> {
        if !self.can_start_round() {
            return None;
        }
        let view_id = self.view_id()?;

        self.round += 1;
        self.round_started_at = Some(now);
        self.votes.clear();
        self.votes.insert(self.myself, own_digest.clone());
        self.last_known.insert(self.myself, own_digest);

        debug!("starting stability round {} in view {}", self.round, view_id);
        Some(StabilityMessage::StableRequest {
            view_id,
            round: self.round,
        })
    }

    pub fn accept_stable_request(&self, from: NodeAddr, view_id: u64) -> bool {
        if self.is_suspended() {
            debug!("stability is suspended - ignoring stable request from {:?}", from);
            return false;
        }
        if self.view_id() != Some(view_id) {
            debug!("ignoring stable request for view {} in view {:?}", view_id, self.view_id());
            return false;
        }
        if self.driver() != Some(from) {
            warn!("received stable request from {:?} which is not the stability driver - ignoring", from);
            return false;
        }
        true
    }

    pub fn on_stable(&mut self, from: NodeAddr, view_id: u64, round: u64, digest: Digest) -> VoteOutcome {
        if !self.is_driver() {
            warn!("received a stability vote from {:?} though not the stability driver - ignoring", from);
            return VoteOutcome::Rejected;
        }
        if self.view_id() != Some(view_id) {
            debug!("ignoring stability vote from {:?} for view {}", from, view_id);
            return VoteOutcome::Rejected;
        }
        if !self.view.as_ref().is_some_and(|v| v.contains(&from)) {
            warn!("received stability vote from non-member {:?} - ignoring", from);
            return VoteOutcome::Rejected;
        }

        self.last_known.insert(from, digest.clone());
        if self.is_collecting() {
            if round == self.round {
                self.votes.insert(from, digest);
            }
            VoteOutcome::Recorded
        }
        else if self.is_suspended() {
            VoteOutcome::Recorded
        }
        else {
            VoteOutcome::StartRound
        }
    }

    /// Checks if the current round can be completed, returning the stable digest if so. A round
    ///  completes when all members voted, or when it timed out and every member's last known
    ///  digest can stand in for its vote.
    pub fn try_complete(&mut self, now: Instant) -> Option<Digest> {
        let started_at = self.round_started_at?;
        let members = self.view.as_ref()?
            .members()
            .copied()
            .collect::<Vec<_>>();

        let all_voted = members.iter().all(|m| self.votes.contains_key(m));
        if !all_voted {
            if now < started_at + self.config.round_timeout {
                return None;
            }

            let unresponsive = members.iter()
                .filter(|m| !self.votes.contains_key(m) && !self.last_known.contains_key(m))
                .copied()
                .collect::<Vec<_>>();
            if !unresponsive.is_empty() {
                if now < self.view_installed_at + self.config.exclude_unresponsive_after {
                    debug!("abandoning stability round {}: no digest from {:?}", self.round, unresponsive);
                    self.end_round();
                    return None;
                }
                warn!("excluding unresponsive members {:?} from stability round {}", unresponsive, self.round);
            }
        }

        let digests = members.iter()
            .filter_map(|m| self.votes.get(m).or_else(|| self.last_known.get(m)))
            .collect::<Vec<_>>();
        let stable = Self::compute(&digests);
        debug!("stability round {} completed: {:?}", self.round, stable);
        self.end_round();
        Some(stable)
    }

    /// Per sender, the lowest highest-delivered seqno and the highest highest-received seqno of
    ///  all digests. Senders that are missing from any digest are left out.
    pub fn compute(digests: &[&Digest]) -> Digest {
        let Some((first, rest)) = digests.split_first() else {
            return Digest::default();
        };

        first.iter()
            .filter_map(|(sender, wm)| {
                let mut min_delivered = wm.highest_delivered;
                let mut max_received = wm.highest_received;
                for digest in rest {
                    let other = digest.get(sender)?;
                    min_delivered = min_delivered.min(other.highest_delivered);
                    max_received = max_received.max(other.highest_received);
                }
                Some((*sender, Watermarks::new(min_delivered, min_delivered, max_received)))
            })
            .collect()
    }

    pub fn accept_stability(&self, from: NodeAddr, view_id: u64) -> bool {
        if self.view_id() != Some(view_id) {
            warn!("received stability message from {:?} for view {} in view {:?} - ignoring", from, view_id, self.view_id());
            return false;
        }
        if self.driver() != Some(from) {
            warn!("received stability message from {:?} which is not the stability driver - ignoring", from);
            return false;
        }
        if self.is_suspended() {
            debug!("stability is suspended - ignoring stability message");
            return false;
        }
        true
    }

    pub fn suspend(&mut self, now: Instant) {
        if self.is_collecting() {
            debug!("suspending stability abandons round {}", self.round);
        }
        self.end_round();
        if self.suspended_since.is_none() {
            self.suspended_since = Some(now);
        }
    }

    pub fn resume(&mut self) {
        self.suspended_since = None;
    }

    pub fn check_suspend_timeout(&mut self, now: Instant) {
        if let Some(since) = self.suspended_since {
            if now >= since + self.config.max_suspend_time {
                warn!("stability was suspended for more than {:?} - resuming", self.config.max_suspend_time);
                self.resume();
            }
        }
    }
}
