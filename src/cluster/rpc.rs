//! Wire types exchanged between cluster nodes and with clients.
//!
//! Every message is JSON with snake_case field names, so a node built from
//! this crate can talk to any peer speaking the same `/request_vote`,
//! `/append_entries` and `/command` endpoints.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Role a node currently plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl Role {
    /// Numeric code used for the role gauge.
    pub fn code(self) -> f64 {
        match self {
            Role::Follower => 0.0,
            Role::Candidate => 1.0,
            Role::Leader => 2.0,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
        };
        f.write_str(name)
    }
}

/// RequestVote RPC arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct VoteRequest {
    /// Term the candidate is campaigning in.
    pub term: u64,
    /// Identity of the candidate requesting the vote.
    pub candidate_id: String,
    /// Index of the candidate's last log entry.
    #[serde(default)]
    pub last_log_index: u64,
    /// Term of the candidate's last log entry.
    #[serde(default)]
    pub last_log_term: u64,
}

/// RequestVote RPC result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct VoteResponse {
    /// Current term of the voter, for the candidate to update itself.
    pub term: u64,
    /// Whether the candidate received this vote.
    pub vote_granted: bool,
}

/// AppendEntries RPC arguments.
///
/// Only the heartbeat form is exchanged: the leader asserts its term and
/// identity, no entries are shipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct EntryRequest {
    /// Leader's term.
    pub term: u64,
    /// Leader's identity, so followers can redirect clients.
    pub leader_id: String,
}

/// AppendEntries RPC result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct EntryResponse {
    /// Current term of the receiver.
    pub term: u64,
    /// True if the receiver accepted the sender as leader for `term`.
    pub success: bool,
}

/// A client command to be admitted into the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CommandRequest {
    /// Client-chosen identifier, echoed in logs only.
    #[serde(default)]
    pub id: i64,
    /// Command name.
    #[serde(default)]
    pub name: String,
    /// Opaque payload.
    #[serde(default)]
    pub body: String,
}

/// Terminal answer for one [`CommandRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CommandResponse {
    /// Whether the command was admitted.
    pub success: bool,
    /// Reason for a rejection, empty on success.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// Log index assigned to an admitted command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u64>,
    /// Leader known to the answering node, for client redirects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader: Option<String>,
}

impl CommandResponse {
    /// An admitted command stored at `index`.
    pub fn admitted(index: u64) -> Self {
        Self {
            success: true,
            message: String::new(),
            index: Some(index),
            leader: None,
        }
    }

    /// A rejected command.
    pub fn rejected(message: impl Into<String>, leader: Option<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            index: None,
            leader,
        }
    }
}
