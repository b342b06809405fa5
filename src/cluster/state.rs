//! Term and role bookkeeping for a single node.
//!
//! [`ConsensusState`] is owned exclusively by the node's event loop. Every
//! other component sees it only through [`NodeStatus`] snapshots.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::rpc::Role;

/// Point-in-time copy of a node's consensus state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct NodeStatus {
    /// This node's identity.
    pub id: String,
    /// Current term.
    pub term: u64,
    /// Current role.
    pub role: Role,
    /// Candidate this node voted for in `term`, if any.
    pub voted_for: Option<String>,
    /// Votes collected in `term`; meaningful only while candidate.
    pub vote_count: usize,
    /// Leader known for `term`, if any.
    pub leader: Option<String>,
}

/// Mutable consensus state of one node.
#[derive(Debug)]
pub struct ConsensusState {
    id: String,
    term: u64,
    role: Role,
    voted_for: Option<String>,
    vote_count: usize,
    leader: Option<String>,
    quorum: usize,
}

/// Votes needed to win an election in a cluster with `peers` other members.
pub fn quorum_size(peers: usize) -> usize {
    (peers + 1) / 2 + 1
}

impl ConsensusState {
    /// A follower at term zero in a cluster with `peers` other members.
    pub fn new(id: impl Into<String>, peers: usize) -> Self {
        Self {
            id: id.into(),
            term: 0,
            role: Role::Follower,
            voted_for: None,
            vote_count: 0,
            leader: None,
            quorum: quorum_size(peers),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn voted_for(&self) -> Option<&str> {
        self.voted_for.as_deref()
    }

    pub fn leader(&self) -> Option<&str> {
        self.leader.as_deref()
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    /// Adopt a term learned from another node and fall back to follower.
    ///
    /// Terms never move backwards: a `term` lower than the current one is
    /// ignored.
    pub fn set_term(&mut self, term: u64) {
        if term < self.term {
            return;
        }
        self.term = term;
        self.reset_election_fields();
    }

    /// Move to the next term as a follower.
    pub fn advance_term(&mut self) {
        self.term += 1;
        self.reset_election_fields();
    }

    /// Start campaigning: bump the term and vote for ourselves.
    ///
    /// Returns the term the campaign runs in.
    pub fn become_candidate(&mut self) -> u64 {
        self.advance_term();
        self.role = Role::Candidate;
        self.voted_for = Some(self.id.clone());
        self.vote_count = 1;
        self.term
    }

    /// True once the votes collected in the current campaign reach quorum.
    pub fn has_quorum(&self) -> bool {
        self.role == Role::Candidate && self.vote_count >= self.quorum
    }

    /// Count one granted vote for the campaign of `election_term`.
    ///
    /// Votes for a campaign that is no longer current are dropped. Returns
    /// whether the campaign has reached quorum.
    pub fn record_vote(&mut self, election_term: u64) -> bool {
        if self.role != Role::Candidate || self.term != election_term {
            return false;
        }
        self.vote_count += 1;
        self.has_quorum()
    }

    /// Take leadership won in `election_term`.
    ///
    /// A no-op returning false if the term moved on or the node stopped being
    /// a candidate since the campaign started.
    pub fn promote_to_leader(&mut self, election_term: u64) -> bool {
        if self.role != Role::Candidate || self.term != election_term {
            return false;
        }
        self.role = Role::Leader;
        self.leader = Some(self.id.clone());
        true
    }

    /// Accept `leader` as leader of the current term.
    pub fn step_down(&mut self, leader: &str) {
        self.role = Role::Follower;
        self.vote_count = 0;
        self.leader = Some(leader.to_string());
    }

    /// Record a vote cast for `candidate` in the current term.
    ///
    /// Returns false if a vote already went to someone else.
    pub fn grant_vote(&mut self, candidate: &str) -> bool {
        match self.voted_for.as_deref() {
            Some(existing) if existing != candidate => false,
            _ => {
                self.voted_for = Some(candidate.to_string());
                true
            }
        }
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.id.clone(),
            term: self.term,
            role: self.role,
            voted_for: self.voted_for.clone(),
            vote_count: self.vote_count,
            leader: self.leader.clone(),
        }
    }

    fn reset_election_fields(&mut self) {
        self.role = Role::Follower;
        self.voted_for = None;
        self.vote_count = 0;
        self.leader = None;
    }
}
