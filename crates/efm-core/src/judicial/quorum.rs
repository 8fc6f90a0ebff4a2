//! Quorum voting over modifiable cognitive-DNA proposals.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::capsule::CapsuleId;
use crate::clock::Tick;

/// Quorum configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuorumConfig {
    /// Fraction of recorded votes that must approve.
    #[serde(default = "default_approval")]
    pub approval_fraction: f64,

    /// Minimum number of recorded votes.
    #[serde(default = "default_min_participants")]
    pub min_participants: u32,

    /// Vote window in ticks; an expired poll rejects.
    #[serde(default = "default_ttl")]
    pub ttl_ticks: u64,
}

const fn default_approval() -> f64 {
    2.0 / 3.0
}

const fn default_min_participants() -> u32 {
    5
}

const fn default_ttl() -> u64 {
    200
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            approval_fraction: default_approval(),
            min_participants: default_min_participants(),
            ttl_ticks: default_ttl(),
        }
    }
}

/// Decision of a closed poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuorumDecision {
    /// The proposal carried.
    Approved,
    /// The proposal failed its threshold or participation floor.
    Rejected,
    /// The vote window expired before closure; timeouts reject.
    TimedOut,
}

/// A single poll over a proposal.
#[derive(Debug, Clone)]
pub struct QuorumPoll {
    /// Proposal description.
    pub proposal: String,

    /// Tick the poll opened.
    pub opened_tick: Tick,

    ttl_ticks: u64,
    votes: HashMap<CapsuleId, bool>,
}

impl QuorumPoll {
    /// Opens a poll.
    #[must_use]
    pub fn open(proposal: impl Into<String>, opened_tick: Tick, config: &QuorumConfig) -> Self {
        Self {
            proposal: proposal.into(),
            opened_tick,
            ttl_ticks: config.ttl_ticks,
            votes: HashMap::new(),
        }
    }

    /// Records a vote. A voter's latest vote wins; votes after expiry are
    /// ignored.
    pub fn vote(&mut self, voter: CapsuleId, approve: bool, now: Tick) {
        if !self.expired(now) {
            self.votes.insert(voter, approve);
        }
    }

    /// Returns true once the vote window has passed.
    #[must_use]
    pub fn expired(&self, now: Tick) -> bool {
        now.since(self.opened_tick) > self.ttl_ticks
    }

    /// Number of recorded votes.
    #[must_use]
    pub fn participants(&self) -> u32 {
        u32::try_from(self.votes.len()).unwrap_or(u32::MAX)
    }

    /// Closes the poll at tick `now` and returns the decision.
    #[must_use]
    pub fn decide(&self, now: Tick, config: &QuorumConfig) -> QuorumDecision {
        if self.expired(now) {
            return QuorumDecision::TimedOut;
        }
        let participants = self.participants();
        if participants < config.min_participants {
            return QuorumDecision::Rejected;
        }
        let approvals = self.votes.values().filter(|v| **v).count();
        #[allow(clippy::cast_precision_loss)]
        let fraction = approvals as f64 / f64::from(participants);
        if fraction >= config.approval_fraction {
            QuorumDecision::Approved
        } else {
            QuorumDecision::Rejected
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voters(n: usize) -> Vec<CapsuleId> {
        (0..n).map(|_| CapsuleId::generate()).collect()
    }

    #[test]
    fn two_thirds_of_five_approves() {
        let config = QuorumConfig::default();
        let mut poll = QuorumPoll::open("widen tether table", Tick::new(0), &config);

        let ids = voters(5);
        for (i, id) in ids.iter().enumerate() {
            poll.vote(*id, i < 4, Tick::new(10));
        }

        assert_eq!(poll.decide(Tick::new(20), &config), QuorumDecision::Approved);
    }

    #[test]
    fn below_two_thirds_rejects() {
        let config = QuorumConfig::default();
        let mut poll = QuorumPoll::open("proposal", Tick::new(0), &config);

        let ids = voters(6);
        for (i, id) in ids.iter().enumerate() {
            poll.vote(*id, i < 3, Tick::new(10));
        }

        assert_eq!(poll.decide(Tick::new(20), &config), QuorumDecision::Rejected);
    }

    #[test]
    fn fewer_than_five_participants_rejects() {
        let config = QuorumConfig::default();
        let mut poll = QuorumPoll::open("proposal", Tick::new(0), &config);

        for id in voters(4) {
            poll.vote(id, true, Tick::new(10));
        }

        assert_eq!(poll.decide(Tick::new(20), &config), QuorumDecision::Rejected);
    }

    #[test]
    fn expiry_times_out_and_ignores_late_votes() {
        let config = QuorumConfig::default();
        let mut poll = QuorumPoll::open("proposal", Tick::new(0), &config);

        for id in voters(5) {
            poll.vote(id, true, Tick::new(10));
        }
        // TTL is 200; tick 201 is past the window.
        poll.vote(CapsuleId::generate(), true, Tick::new(300));
        assert_eq!(poll.participants(), 5);

        assert_eq!(poll.decide(Tick::new(300), &config), QuorumDecision::TimedOut);
    }

    #[test]
    fn revote_replaces_previous_vote() {
        let config = QuorumConfig::default();
        let mut poll = QuorumPoll::open("proposal", Tick::new(0), &config);

        let ids = voters(5);
        for id in &ids {
            poll.vote(*id, false, Tick::new(5));
        }
        for id in &ids {
            poll.vote(*id, true, Tick::new(10));
        }

        assert_eq!(poll.decide(Tick::new(20), &config), QuorumDecision::Approved);
    }
}
