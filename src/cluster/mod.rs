//! Cluster coordination.
//!
//! Each Pontoon process is one member of a Raft cluster. This module holds
//! the consensus core (term/role state, elections, the event loop that ties
//! them together) and the collaborators it talks to: the peer transport and
//! the command log.

pub mod election;
pub mod log;
pub mod raft;
pub mod rpc;
pub mod state;
pub mod transport;
