//! A single leader campaign.
//!
//! An [`Election`] fans a vote request out to every peer and forwards what
//! comes back to the event loop as [`ElectionEvent`]s. It never touches the
//! consensus state itself. The event loop tears a campaign down with
//! [`Election::cancel`], which returns only after the fan-out task has
//! stopped, so two campaigns can never feed votes into the loop at once.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::rpc::VoteRequest;
use super::transport::Transport;
use crate::metrics::RAFT_RPC_FAILURES_TOTAL;

/// Outcome of one peer's vote, as reported to the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionEvent {
    /// A peer granted its vote for the campaign of `term`.
    VoteGranted { term: u64 },
    /// A peer reported a term newer than ours.
    TermDiscovered(u64),
}

/// Handle to a running campaign.
#[derive(Debug)]
pub struct Election {
    term: u64,
    cancel: CancellationToken,
    done: JoinHandle<()>,
}

impl Election {
    /// Start canvassing `peers` with `request`.
    pub fn start(
        request: VoteRequest,
        peers: Arc<[String]>,
        transport: Arc<dyn Transport>,
        vote_timeout: Duration,
        events: mpsc::UnboundedSender<ElectionEvent>,
    ) -> Self {
        let term = request.term;
        let cancel = CancellationToken::new();
        let done = tokio::spawn(canvass(
            request,
            peers,
            transport,
            vote_timeout,
            events,
            cancel.clone(),
        ));
        Self { term, cancel, done }
    }

    /// Term this campaign runs in.
    pub fn term(&self) -> u64 {
        self.term
    }

    /// Stop the campaign and wait until its fan-out task has exited.
    pub async fn cancel(self) {
        self.cancel.cancel();
        if let Err(e) = self.done.await {
            warn!(term = self.term, "election task ended abnormally: {}", e);
        }
    }
}

async fn canvass(
    request: VoteRequest,
    peers: Arc<[String]>,
    transport: Arc<dyn Transport>,
    vote_timeout: Duration,
    events: mpsc::UnboundedSender<ElectionEvent>,
    cancel: CancellationToken,
) {
    let election_term = request.term;
    let mut pending = JoinSet::new();
    for peer in peers.iter().cloned() {
        let transport = transport.clone();
        let request = request.clone();
        pending.spawn(async move {
            let result = transport.request_vote(&peer, request, vote_timeout).await;
            (peer, result)
        });
    }

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(term = election_term, "election cancelled");
                break;
            }
            joined = pending.join_next() => {
                let Some(joined) = joined else {
                    debug!(term = election_term, "all votes are in without a decision");
                    break;
                };
                let (peer, result) = match joined {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!("vote request task failed: {}", e);
                        continue;
                    }
                };
                match result {
                    Ok(response) if response.term > election_term => {
                        info!(
                            term = election_term,
                            "{} is at term {}, abandoning campaign", peer, response.term
                        );
                        let _ = events.send(ElectionEvent::TermDiscovered(response.term));
                        break;
                    }
                    Ok(response) if response.vote_granted && response.term == election_term => {
                        debug!(term = election_term, "vote granted by {}", peer);
                        if events.send(ElectionEvent::VoteGranted { term: election_term }).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {
                        debug!(term = election_term, "vote refused by {}", peer);
                    }
                    Err(e) => {
                        counter!(RAFT_RPC_FAILURES_TOTAL, "rpc" => "request_vote", "kind" => e.kind())
                            .increment(1);
                        debug!(term = election_term, "vote request failed: {}", e);
                    }
                }
            }
        }
    }

    pending.abort_all();
}
