//! Raft consensus node: leader election and command admission.
//!
//! A node is a single event-loop task that owns the [`ConsensusState`] and
//! is its only writer. Everything else talks to it by message:
//!
//! - inbound RPCs and client commands arrive on a bounded queue, each with a
//!   oneshot reply channel;
//! - the running [`Election`] and heartbeat tasks report back on an
//!   unbounded queue;
//! - the election timer and heartbeat ticker are polled in the same
//!   `select!`.
//!
//! Readers get [`NodeStatus`] snapshots through a `watch` channel that the
//! loop republishes after every event.
//!
//! Commands the leader admits are handed to one appender task over a FIFO
//! queue, so the log stores them in admission order without the loop ever
//! waiting on a write.

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::election::{Election, ElectionEvent};
use super::log::{LogPosition, ReplicatedLog};
use super::rpc::{
    CommandRequest, CommandResponse, EntryRequest, EntryResponse, Role, VoteRequest, VoteResponse,
};
use super::state::{ConsensusState, NodeStatus};
use super::transport::Transport;
use crate::errors::RaftError;
use crate::metrics::{
    RAFT_COMMANDS_TOTAL, RAFT_ELECTIONS_TOTAL, RAFT_LEADER_PROMOTIONS_TOTAL, RAFT_ROLE,
    RAFT_RPC_FAILURES_TOTAL, RAFT_TERM, RAFT_VOTES_GRANTED_TOTAL,
};

/// Capacity of the inbound request queue.
const REQUEST_QUEUE_DEPTH: usize = 256;

/// Identity, peers and timing of a node.
#[derive(Debug, Clone)]
pub struct NodeSettings {
    /// This node's identity; also the address peers reach it on.
    pub id: String,
    /// Addresses of the other cluster members.
    pub peers: Vec<String>,
    /// Base time without hearing from a leader before campaigning.
    pub election_timeout: Duration,
    /// Upper bound of the random delay added to each election timeout.
    pub election_jitter: Duration,
    /// Interval between leader heartbeats.
    pub heartbeat_interval: Duration,
    /// Deadline for a single RequestVote RPC.
    pub vote_timeout: Duration,
    /// Deadline for a single AppendEntries RPC.
    pub append_timeout: Duration,
}

impl NodeSettings {
    /// Settings with the default timings.
    pub fn new(id: impl Into<String>, peers: Vec<String>) -> Self {
        Self {
            id: id.into(),
            peers,
            election_timeout: Duration::from_millis(500),
            election_jitter: Duration::from_millis(250),
            heartbeat_interval: Duration::from_millis(100),
            vote_timeout: Duration::from_millis(100),
            append_timeout: Duration::from_millis(500),
        }
    }
}

enum Request {
    Vote {
        request: VoteRequest,
        reply: oneshot::Sender<VoteResponse>,
    },
    Append {
        request: EntryRequest,
        reply: oneshot::Sender<EntryResponse>,
    },
    Command {
        request: CommandRequest,
        reply: oneshot::Sender<CommandResponse>,
    },
}

/// A command admitted by the leader in `term`, waiting to be stored.
struct Admitted {
    term: u64,
    request: CommandRequest,
    reply: oneshot::Sender<CommandResponse>,
}

/// Cloneable handle to a running node.
#[derive(Clone)]
pub struct RaftNode {
    id: Arc<str>,
    peers: Arc<[String]>,
    requests: mpsc::Sender<Request>,
    status: watch::Receiver<NodeStatus>,
    log: Arc<dyn ReplicatedLog>,
    shutdown: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl RaftNode {
    /// Spawn the node's event loop as a follower at term zero.
    pub fn start(
        settings: NodeSettings,
        transport: Arc<dyn Transport>,
        log: Arc<dyn ReplicatedLog>,
    ) -> Self {
        let id: Arc<str> = Arc::from(settings.id.as_str());
        let peers: Arc<[String]> = settings.peers.clone().into();
        let state = ConsensusState::new(settings.id.clone(), peers.len());
        let (status_tx, status_rx) = watch::channel(state.status());
        let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        let (feedback_tx, feedback_rx) = mpsc::unbounded_channel();
        let (append_tx, append_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let appender = tokio::spawn(store_admitted(
            settings.id.clone(),
            log.clone(),
            status_rx.clone(),
            append_rx,
        ));

        info!(
            "[{}] starting node with {} peer(s), quorum {}",
            settings.id,
            peers.len(),
            state.quorum()
        );

        let event_loop = EventLoop {
            election_deadline: Instant::now(),
            id: settings.id.clone(),
            peers: peers.clone(),
            settings,
            state,
            election: None,
            transport,
            log: log.clone(),
            requests: request_rx,
            feedback_tx,
            feedback_rx,
            appends: append_tx,
            appender,
            status: status_tx,
            shutdown: shutdown.clone(),
        };
        let task = tokio::spawn(event_loop.run());

        Self {
            id,
            peers,
            requests: request_tx,
            status: status_rx,
            log,
            shutdown,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peers(&self) -> &[String] {
        &self.peers
    }

    pub fn log(&self) -> &Arc<dyn ReplicatedLog> {
        &self.log
    }

    /// Latest published snapshot of the node's state.
    pub fn status(&self) -> NodeStatus {
        self.status.borrow().clone()
    }

    /// Receiver that is notified every time the snapshot changes.
    pub fn subscribe(&self) -> watch::Receiver<NodeStatus> {
        self.status.clone()
    }

    /// Evaluate an inbound RequestVote.
    pub async fn handle_request_vote(
        &self,
        request: VoteRequest,
    ) -> Result<VoteResponse, RaftError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Request::Vote { request, reply }).await?;
        rx.await.map_err(|_| RaftError::NodeStopped)
    }

    /// Evaluate an inbound AppendEntries.
    pub async fn handle_append_entries(
        &self,
        request: EntryRequest,
    ) -> Result<EntryResponse, RaftError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Request::Append { request, reply }).await?;
        rx.await.map_err(|_| RaftError::NodeStopped)
    }

    /// Submit a client command and wait for its single terminal answer.
    ///
    /// Only the leader admits commands; everyone else rejects immediately,
    /// naming the leader it knows of.
    pub async fn handle_command(&self, request: CommandRequest) -> CommandResponse {
        let (reply, rx) = oneshot::channel();
        if self.submit(Request::Command { request, reply }).await.is_err() {
            return CommandResponse::rejected("node is shutting down", None);
        }
        rx.await.unwrap_or_else(|_| {
            CommandResponse::rejected("command was dropped before completion", None)
        })
    }

    /// Stop the event loop and wait for it to exit. Idempotent.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("[{}] event loop ended abnormally: {}", self.id, e);
            }
        }
    }

    async fn submit(&self, request: Request) -> Result<(), RaftError> {
        self.requests
            .send(request)
            .await
            .map_err(|_| RaftError::NodeStopped)
    }
}

/// The single writer of a node's consensus state.
struct EventLoop {
    id: String,
    settings: NodeSettings,
    peers: Arc<[String]>,
    state: ConsensusState,
    election: Option<Election>,
    election_deadline: Instant,
    transport: Arc<dyn Transport>,
    log: Arc<dyn ReplicatedLog>,
    requests: mpsc::Receiver<Request>,
    feedback_tx: mpsc::UnboundedSender<ElectionEvent>,
    feedback_rx: mpsc::UnboundedReceiver<ElectionEvent>,
    appends: mpsc::UnboundedSender<Admitted>,
    appender: JoinHandle<()>,
    status: watch::Sender<NodeStatus>,
    shutdown: CancellationToken,
}

impl EventLoop {
    async fn run(mut self) {
        self.reset_election_timer();
        let election_timer = tokio::time::sleep_until(self.election_deadline);
        tokio::pin!(election_timer);

        let mut heartbeat = tokio::time::interval(self.settings.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.publish();
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(event) = self.feedback_rx.recv() => self.on_feedback(event).await,
                request = self.requests.recv() => match request {
                    Some(request) => self.on_request(request).await,
                    None => break,
                },
                _ = &mut election_timer => self.on_election_timeout().await,
                _ = heartbeat.tick() => self.on_heartbeat_tick(),
            }

            if election_timer.deadline() != self.election_deadline {
                election_timer.as_mut().reset(self.election_deadline);
            }
            self.publish();
        }

        self.end_election().await;
        // Closing the queue lets the appender finish what was admitted.
        drop(self.appends);
        if let Err(e) = self.appender.await {
            warn!("[{}] command appender ended abnormally: {}", self.id, e);
        }
        info!("[{}] exiting event loop at term {}", self.id, self.state.term());
    }

    // -- Event handlers -------------------------------------------------------

    async fn on_feedback(&mut self, event: ElectionEvent) {
        match event {
            ElectionEvent::VoteGranted { term } => {
                if self.state.record_vote(term) {
                    self.win_election(term).await;
                }
            }
            ElectionEvent::TermDiscovered(term) => {
                self.discover_term(term).await;
            }
        }
    }

    async fn on_request(&mut self, request: Request) {
        match request {
            Request::Vote { request, reply } => {
                let response = self.evaluate_vote(request).await;
                let _ = reply.send(response);
            }
            Request::Append { request, reply } => {
                let response = self.accept_entries(request).await;
                let _ = reply.send(response);
            }
            Request::Command { request, reply } => self.admit_command(request, reply),
        }
    }

    async fn on_election_timeout(&mut self) {
        self.reset_election_timer();
        if self.state.role() == Role::Leader {
            return;
        }
        if let Some(election) = self.election.take() {
            info!(
                "[{}] election for term {} timed out unresolved",
                self.id,
                election.term()
            );
            election.cancel().await;
        }
        self.run_for_leader().await;
    }

    fn on_heartbeat_tick(&self) {
        if self.state.role() == Role::Leader {
            self.broadcast_heartbeat();
        }
    }

    // -- Elections ------------------------------------------------------------

    async fn run_for_leader(&mut self) {
        let term = self.state.become_candidate();
        counter!(RAFT_ELECTIONS_TOTAL).increment(1);
        info!("[{}] running for leader in term {}", self.id, term);

        if self.state.has_quorum() {
            self.win_election(term).await;
            return;
        }

        let LogPosition { term: last_term, index: last_index } = self.log.last_position();
        let request = VoteRequest {
            term,
            candidate_id: self.id.clone(),
            last_log_index: last_index,
            last_log_term: last_term,
        };
        self.election = Some(Election::start(
            request,
            self.peers.clone(),
            self.transport.clone(),
            self.settings.vote_timeout,
            self.feedback_tx.clone(),
        ));
    }

    async fn win_election(&mut self, term: u64) {
        self.end_election().await;
        if !self.state.promote_to_leader(term) {
            debug!("[{}] ignoring stale win for term {}", self.id, term);
            return;
        }
        counter!(RAFT_LEADER_PROMOTIONS_TOTAL).increment(1);
        info!("[{}] elected leader for term {}", self.id, term);
        self.broadcast_heartbeat();
    }

    /// Cancel the running campaign, if any, and wait for it to drain.
    async fn end_election(&mut self) {
        if let Some(election) = self.election.take() {
            election.cancel().await;
        }
    }

    /// Adopt `term` if it is newer than ours. Returns whether it was.
    async fn discover_term(&mut self, term: u64) -> bool {
        if term <= self.state.term() {
            return false;
        }
        self.end_election().await;
        let previous = self.state.role();
        self.state.set_term(term);
        info!(
            "[{}] discovered term {}, {} -> follower",
            self.id, term, previous
        );
        true
    }

    // -- RPC evaluation -------------------------------------------------------

    async fn evaluate_vote(&mut self, request: VoteRequest) -> VoteResponse {
        if request.term < self.state.term() {
            debug!(
                "[{}] rejecting vote for {}: stale term {} < {}",
                self.id,
                request.candidate_id,
                request.term,
                self.state.term()
            );
            return self.vote(false);
        }
        self.discover_term(request.term).await;

        let ours = self.log.last_position();
        let theirs = LogPosition {
            term: request.last_log_term,
            index: request.last_log_index,
        };
        if !theirs.is_at_least(&ours) {
            debug!(
                "[{}] rejecting vote for {}: log {:?} is behind ours {:?}",
                self.id, request.candidate_id, theirs, ours
            );
            return self.vote(false);
        }

        if !self.state.grant_vote(&request.candidate_id) {
            debug!(
                "[{}] rejecting vote for {}: already voted for {:?} in term {}",
                self.id,
                request.candidate_id,
                self.state.voted_for(),
                self.state.term()
            );
            return self.vote(false);
        }

        counter!(RAFT_VOTES_GRANTED_TOTAL).increment(1);
        info!(
            "[{}] voted for {} in term {}",
            self.id,
            request.candidate_id,
            self.state.term()
        );
        self.reset_election_timer();
        self.vote(true)
    }

    async fn accept_entries(&mut self, request: EntryRequest) -> EntryResponse {
        if request.term < self.state.term() {
            debug!(
                "[{}] rejecting append from {}: stale term {} < {}",
                self.id,
                request.leader_id,
                request.term,
                self.state.term()
            );
            return self.entries_ack(false);
        }
        self.discover_term(request.term).await;

        if self.state.role() == Role::Leader {
            warn!(
                "[{}] {} claims leadership of term {} which this node holds",
                self.id, request.leader_id, request.term
            );
            return self.entries_ack(false);
        }

        self.end_election().await;
        if self.state.leader() != Some(request.leader_id.as_str()) {
            info!(
                "[{}] following {} in term {}",
                self.id, request.leader_id, request.term
            );
        }
        self.state.step_down(&request.leader_id);
        self.reset_election_timer();
        self.entries_ack(true)
    }

    fn admit_command(&self, request: CommandRequest, reply: oneshot::Sender<CommandResponse>) {
        if self.state.role() != Role::Leader {
            counter!(RAFT_COMMANDS_TOTAL, "outcome" => "not_leader").increment(1);
            debug!(
                "[{}] rejecting command {}: not the leader",
                self.id, request.id
            );
            let leader = self.state.leader().map(str::to_string);
            let _ = reply.send(CommandResponse::rejected("not the leader", leader));
            return;
        }

        let admitted = Admitted {
            term: self.state.term(),
            request,
            reply,
        };
        if let Err(mpsc::error::SendError(admitted)) = self.appends.send(admitted) {
            counter!(RAFT_COMMANDS_TOTAL, "outcome" => "failed").increment(1);
            let _ = admitted
                .reply
                .send(CommandResponse::rejected("node is shutting down", None));
        }
    }

    // -- Heartbeats -----------------------------------------------------------

    /// Send one heartbeat to every peer without waiting for the answers.
    fn broadcast_heartbeat(&self) {
        let term = self.state.term();
        for peer in self.peers.iter().cloned() {
            let transport = self.transport.clone();
            let feedback = self.feedback_tx.clone();
            let timeout = self.settings.append_timeout;
            let request = EntryRequest {
                term,
                leader_id: self.id.clone(),
            };
            tokio::spawn(async move {
                match transport.append_entries(&peer, request, timeout).await {
                    Ok(response) if response.term > term => {
                        let _ = feedback.send(ElectionEvent::TermDiscovered(response.term));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        counter!(RAFT_RPC_FAILURES_TOTAL, "rpc" => "append_entries", "kind" => e.kind())
                            .increment(1);
                        debug!("heartbeat failed: {}", e);
                    }
                }
            });
        }
    }

    // -- Helpers --------------------------------------------------------------

    fn vote(&self, granted: bool) -> VoteResponse {
        VoteResponse {
            term: self.state.term(),
            vote_granted: granted,
        }
    }

    fn entries_ack(&self, success: bool) -> EntryResponse {
        EntryResponse {
            term: self.state.term(),
            success,
        }
    }

    fn reset_election_timer(&mut self) {
        let jitter_ms = self.settings.election_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        self.election_deadline = Instant::now() + self.settings.election_timeout + jitter;
    }

    fn publish(&self) {
        let next = self.state.status();
        gauge!(RAFT_TERM).set(next.term as f64);
        gauge!(RAFT_ROLE).set(next.role.code());
        self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

/// Store admitted commands one at a time, in the order they were admitted.
///
/// A command whose term has passed, or whose node is no longer leader, is
/// refused instead of stored.
async fn store_admitted(
    id: String,
    log: Arc<dyn ReplicatedLog>,
    status: watch::Receiver<NodeStatus>,
    mut admitted: mpsc::UnboundedReceiver<Admitted>,
) {
    while let Some(Admitted {
        term,
        request,
        reply,
    }) = admitted.recv().await
    {
        let (current_term, leading, leader) = {
            let current = status.borrow();
            (
                current.term,
                current.role == Role::Leader,
                current.leader.clone(),
            )
        };

        let response = if current_term != term || !leading {
            counter!(RAFT_COMMANDS_TOTAL, "outcome" => "leadership_lost").increment(1);
            debug!(
                "[{}] dropping command {} admitted in term {}: now term {}",
                id, request.id, term, current_term
            );
            CommandResponse::rejected("leadership lost before the command was stored", leader)
        } else {
            match log.append(term, request.name, request.body).await {
                Ok(index) => {
                    counter!(RAFT_COMMANDS_TOTAL, "outcome" => "admitted").increment(1);
                    debug!("[{}] command {} stored at index {}", id, request.id, index);
                    CommandResponse::admitted(index)
                }
                Err(e) => {
                    counter!(RAFT_COMMANDS_TOTAL, "outcome" => "failed").increment(1);
                    warn!("[{}] command {} failed: {}", id, request.id, e);
                    CommandResponse::rejected(format!("log append failed: {e}"), None)
                }
            }
        };
        let _ = reply.send(response);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::log::MemoryLog;
    use crate::cluster::transport::LocalTransport;

    const WITHIN: Duration = Duration::from_secs(10);

    fn fast(id: &str, peers: &[&str]) -> NodeSettings {
        NodeSettings {
            id: id.to_string(),
            peers: peers.iter().map(|p| p.to_string()).collect(),
            election_timeout: Duration::from_millis(150),
            election_jitter: Duration::from_millis(150),
            heartbeat_interval: Duration::from_millis(30),
            vote_timeout: Duration::from_millis(50),
            append_timeout: Duration::from_millis(50),
        }
    }

    /// Settings for a node that never times out on its own.
    fn patient(id: &str, peers: &[&str]) -> NodeSettings {
        NodeSettings {
            election_timeout: Duration::from_secs(3600),
            election_jitter: Duration::ZERO,
            ..fast(id, peers)
        }
    }

    fn start(settings: NodeSettings, transport: &Arc<LocalTransport>) -> RaftNode {
        let node = RaftNode::start(settings, transport.clone(), Arc::new(MemoryLog::new()));
        transport.register(node.clone());
        node
    }

    fn cluster(settings: Vec<NodeSettings>) -> (Arc<LocalTransport>, Vec<RaftNode>) {
        let transport = Arc::new(LocalTransport::new());
        let nodes = settings
            .into_iter()
            .map(|s| start(s, &transport))
            .collect();
        (transport, nodes)
    }

    async fn wait_for(node: &RaftNode, pred: impl Fn(&NodeStatus) -> bool) -> NodeStatus {
        let mut rx = node.subscribe();
        tokio::time::timeout(WITHIN, async {
            loop {
                {
                    let status = rx.borrow_and_update();
                    if pred(&status) {
                        return status.clone();
                    }
                }
                rx.changed().await.expect("node stopped");
            }
        })
        .await
        .expect("condition not reached in time")
    }

    /// Wait until every node names the same leader in the same term.
    async fn settle(nodes: &[RaftNode]) -> Vec<NodeStatus> {
        tokio::time::timeout(WITHIN, async {
            loop {
                let statuses: Vec<_> = nodes.iter().map(|n| n.status()).collect();
                let first = &statuses[0];
                if first.leader.is_some()
                    && statuses
                        .iter()
                        .all(|s| s.leader == first.leader && s.term == first.term)
                {
                    return statuses;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("cluster never settled")
    }

    fn vote_request(term: u64, candidate: &str) -> VoteRequest {
        VoteRequest {
            term,
            candidate_id: candidate.to_string(),
            last_log_index: 0,
            last_log_term: 0,
        }
    }

    fn heartbeat(term: u64, leader: &str) -> EntryRequest {
        EntryRequest {
            term,
            leader_id: leader.to_string(),
        }
    }

    fn command(body: &str) -> CommandRequest {
        CommandRequest {
            id: 1,
            name: "set".to_string(),
            body: body.to_string(),
        }
    }

    #[tokio::test]
    async fn test_single_node_elects_itself() {
        let (_transport, nodes) = cluster(vec![fast("solo", &[])]);
        let status = wait_for(&nodes[0], |s| s.role == Role::Leader).await;
        assert_eq!(status.term, 1);
        assert_eq!(status.voted_for.as_deref(), Some("solo"));
        assert_eq!(status.leader.as_deref(), Some("solo"));
        nodes[0].shutdown().await;
    }

    #[tokio::test]
    async fn test_three_nodes_first_to_time_out_wins() {
        let (_transport, nodes) = cluster(vec![
            fast("a", &["b", "c"]),
            patient("b", &["a", "c"]),
            patient("c", &["a", "b"]),
        ]);

        let a = wait_for(&nodes[0], |s| s.role == Role::Leader).await;
        assert_eq!(a.term, 1);

        for follower in &nodes[1..] {
            let status = wait_for(follower, |s| s.leader.as_deref() == Some("a")).await;
            assert_eq!(status.term, 1);
            assert_eq!(status.role, Role::Follower);
            assert_eq!(status.voted_for.as_deref(), Some("a"));
        }
        for node in &nodes {
            node.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_cluster_agrees_on_one_leader() {
        let (_transport, nodes) = cluster(vec![
            fast("a", &["b", "c"]),
            fast("b", &["a", "c"]),
            fast("c", &["a", "b"]),
        ]);

        let settled = settle(&nodes).await;

        let leaders: Vec<_> = settled.iter().filter(|s| s.role == Role::Leader).collect();
        assert_eq!(leaders.len(), 1, "{settled:?}");
        assert_eq!(Some(&leaders[0].id), settled[0].leader.as_ref());
        for node in &nodes {
            node.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_leader_holds_term_while_heartbeating() {
        let (_transport, nodes) = cluster(vec![
            fast("a", &["b", "c"]),
            fast("b", &["a", "c"]),
            fast("c", &["a", "b"]),
        ]);
        let before = settle(&nodes).await;

        // Several full election timeouts.
        tokio::time::sleep(Duration::from_millis(1000)).await;

        let after: Vec<_> = nodes.iter().map(|n| n.status()).collect();
        for (b, a) in before.iter().zip(&after) {
            assert_eq!((b.term, b.role, &b.leader), (a.term, a.role, &a.leader));
        }
        for node in &nodes {
            node.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_granting_a_vote_pushes_back_the_election() {
        let settings = NodeSettings {
            election_timeout: Duration::from_millis(400),
            election_jitter: Duration::ZERO,
            ..fast("a", &["b", "c"])
        };
        let (_transport, nodes) = cluster(vec![settings]);
        let node = &nodes[0];

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(node.handle_request_vote(vote_request(1, "b")).await.unwrap().vote_granted);

        // Past the first deadline, inside the re-armed one.
        tokio::time::sleep(Duration::from_millis(250)).await;
        let status = node.status();
        assert_eq!(status.term, 1);
        assert_eq!(status.role, Role::Follower);

        // Nobody leads term 1, so a campaigns eventually.
        let status = wait_for(node, |s| s.term > 1).await;
        assert_eq!(status.voted_for.as_deref(), Some("a"));
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_refused_vote_does_not_push_back_the_election() {
        let transport = Arc::new(LocalTransport::new());
        let log = Arc::new(MemoryLog::new());
        log.append(2, "set".into(), "a".into()).await.unwrap();
        let settings = NodeSettings {
            election_timeout: Duration::from_millis(400),
            election_jitter: Duration::ZERO,
            ..fast("a", &["b", "c"])
        };
        let node = RaftNode::start(settings, transport, log);

        // A newer term from a candidate whose log is behind.
        tokio::time::sleep(Duration::from_millis(250)).await;
        let refused = node.handle_request_vote(vote_request(1, "b")).await.unwrap();
        assert!(!refused.vote_granted);
        assert_eq!(refused.term, 1);

        // The first deadline still holds.
        tokio::time::sleep(Duration::from_millis(250)).await;
        let status = node.status();
        assert!(status.term >= 2, "{status:?}");
        assert_eq!(status.role, Role::Candidate);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_campaign_without_quorum_keeps_advancing_term() {
        let (transport, nodes) = cluster(vec![
            fast("a", &["b", "c"]),
            patient("b", &["a", "c"]),
            patient("c", &["a", "b"]),
        ]);
        transport.isolate("a");

        let mut last_term = 0;
        for _ in 0..3 {
            let status = wait_for(&nodes[0], |s| s.term > last_term).await;
            assert_ne!(status.role, Role::Leader);
            last_term = status.term;
        }
        assert!(last_term >= 3);

        transport.heal("a");
        let status = wait_for(&nodes[0], |s| s.role == Role::Leader).await;
        assert!(status.term > last_term);
        for node in &nodes {
            node.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_split_vote_retries_in_higher_term() {
        let (transport, nodes) = cluster(vec![fast("a", &["b"]), fast("b", &["a"])]);
        transport.isolate("a");
        transport.isolate("b");

        // Both campaign alone, each holding its own vote.
        let a = wait_for(&nodes[0], |s| s.role == Role::Candidate).await;
        let b = wait_for(&nodes[1], |s| s.role == Role::Candidate).await;
        let term = nodes[0].status().term;
        let refused = nodes[0]
            .handle_request_vote(vote_request(term, "b"))
            .await
            .unwrap();
        assert!(!refused.vote_granted);

        transport.heal("a");
        transport.heal("b");
        let settled = wait_for(&nodes[0], |s| s.leader.is_some()).await;
        assert!(settled.term > a.term.max(b.term));
        for node in &nodes {
            node.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_one_vote_per_term() {
        let (_transport, nodes) = cluster(vec![patient("a", &["b", "c"])]);
        let node = &nodes[0];

        assert!(node.handle_request_vote(vote_request(1, "b")).await.unwrap().vote_granted);
        // Repeating the same request is harmless; a rival is refused.
        assert!(node.handle_request_vote(vote_request(1, "b")).await.unwrap().vote_granted);
        assert!(!node.handle_request_vote(vote_request(1, "c")).await.unwrap().vote_granted);
        assert_eq!(node.status().voted_for.as_deref(), Some("b"));

        // A new term frees the vote.
        let next = node.handle_request_vote(vote_request(2, "c")).await.unwrap();
        assert!(next.vote_granted);
        assert_eq!(next.term, 2);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_stale_vote_request_is_rejected_without_mutation() {
        let (_transport, nodes) = cluster(vec![patient("a", &["b", "c"])]);
        let node = &nodes[0];
        assert!(node.handle_append_entries(heartbeat(5, "b")).await.unwrap().success);
        let before = node.status();

        let response = node.handle_request_vote(vote_request(0, "c")).await.unwrap();
        assert_eq!(
            response,
            VoteResponse {
                term: 5,
                vote_granted: false
            }
        );
        assert_eq!(node.status(), before);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_higher_term_vote_request_steps_leader_down() {
        let (_transport, nodes) = cluster(vec![fast("solo", &[])]);
        let node = &nodes[0];
        wait_for(node, |s| s.role == Role::Leader).await;

        let response = node.handle_request_vote(vote_request(10, "x")).await.unwrap();
        assert!(response.vote_granted);
        assert_eq!(response.term, 10);

        let status = node.status();
        assert_eq!(status.term, 10);
        assert_eq!(status.voted_for.as_deref(), Some("x"));
        assert_ne!(status.role, Role::Leader);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_vote_refused_to_candidate_with_stale_log() {
        let transport = Arc::new(LocalTransport::new());
        let log = Arc::new(MemoryLog::new());
        log.append(2, "set".into(), "a".into()).await.unwrap();
        log.append(2, "set".into(), "b".into()).await.unwrap();
        let node = RaftNode::start(patient("a", &["b", "c"]), transport, log);

        let mut request = vote_request(3, "b");
        request.last_log_term = 1;
        request.last_log_index = 9;
        let response = node.handle_request_vote(request).await.unwrap();
        assert!(!response.vote_granted);
        // The newer term is still adopted.
        assert_eq!(response.term, 3);
        assert!(node.status().voted_for.is_none());

        let mut request = vote_request(3, "c");
        request.last_log_term = 2;
        request.last_log_index = 2;
        assert!(node.handle_request_vote(request).await.unwrap().vote_granted);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_append_entries_sets_leader_and_rejects_stale() {
        let (_transport, nodes) = cluster(vec![patient("a", &["b", "c"])]);
        let node = &nodes[0];

        let ok = node.handle_append_entries(heartbeat(2, "b")).await.unwrap();
        assert_eq!(ok, EntryResponse { term: 2, success: true });
        let status = node.status();
        assert_eq!(status.leader.as_deref(), Some("b"));
        assert_eq!(status.role, Role::Follower);

        let stale = node.handle_append_entries(heartbeat(1, "c")).await.unwrap();
        assert_eq!(stale, EntryResponse { term: 2, success: false });
        assert_eq!(node.status().leader.as_deref(), Some("b"));
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_candidate_steps_down_on_same_term_heartbeat() {
        let (transport, nodes) = cluster(vec![fast("a", &["b", "c"])]);
        transport.isolate("a");
        let node = &nodes[0];
        let candidate = wait_for(node, |s| s.role == Role::Candidate).await;

        let ack = node
            .handle_append_entries(heartbeat(candidate.term, "b"))
            .await
            .unwrap();
        assert!(ack.success);
        let status = node.status();
        assert_eq!(status.role, Role::Follower);
        assert_eq!(status.term, candidate.term);
        assert_eq!(status.leader.as_deref(), Some("b"));
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_old_leader_steps_down_after_partition_heals() {
        let (transport, nodes) = cluster(vec![
            fast("a", &["b", "c"]),
            patient("b", &["a", "c"]),
            patient("c", &["a", "b"]),
        ]);
        let first = wait_for(&nodes[0], |s| s.role == Role::Leader).await;

        // Cut the leader off and let b take over in a later term.
        transport.isolate("a");
        let request = VoteRequest {
            term: first.term + 1,
            candidate_id: "b".to_string(),
            last_log_index: 0,
            last_log_term: 0,
        };
        assert!(nodes[2].handle_request_vote(request).await.unwrap().vote_granted);
        assert!(nodes[2]
            .handle_append_entries(heartbeat(first.term + 1, "b"))
            .await
            .unwrap()
            .success);
        assert_eq!(nodes[0].status().role, Role::Leader);

        // c answers a's next heartbeat with the newer term.
        transport.heal("a");
        let status = wait_for(&nodes[0], |s| s.role != Role::Leader).await;
        assert!(status.term > first.term);
        for node in &nodes {
            node.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_command_rejected_on_follower() {
        let (_transport, nodes) = cluster(vec![patient("a", &["b", "c"])]);
        let node = &nodes[0];
        node.handle_append_entries(heartbeat(1, "b")).await.unwrap();

        let response = node.handle_command(command("x")).await;
        assert!(!response.success);
        assert_eq!(response.leader.as_deref(), Some("b"));
        assert!(node.log().entries().is_empty());
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_command_admitted_on_leader() {
        let (_transport, nodes) = cluster(vec![fast("solo", &[])]);
        let node = &nodes[0];
        wait_for(node, |s| s.role == Role::Leader).await;

        let first = node.handle_command(command("x")).await;
        let second = node.handle_command(command("y")).await;
        assert!(first.success);
        assert_eq!(first.index, Some(1));
        assert_eq!(second.index, Some(2));

        let entries = node.log().entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].body, "x");
        assert_eq!(entries[0].term, 1);
        node.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_log_keeps_admission_order() {
        let (_transport, nodes) = cluster(vec![fast("solo", &[])]);
        let node = &nodes[0];
        wait_for(node, |s| s.role == Role::Leader).await;

        let count = 2000;
        let mut answers = Vec::with_capacity(count);
        for i in 0..count {
            let (reply, answer) = oneshot::channel();
            let request = command(&i.to_string());
            node.submit(Request::Command { request, reply }).await.unwrap();
            answers.push(answer);
        }
        for (i, answer) in answers.into_iter().enumerate() {
            let response = answer.await.unwrap();
            assert!(response.success, "{response:?}");
            assert_eq!(response.index, Some(i as u64 + 1));
        }

        let bodies: Vec<String> = node.log().entries().into_iter().map(|e| e.body).collect();
        let expected: Vec<String> = (0..count).map(|i| i.to_string()).collect();
        assert_eq!(bodies, expected);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_command_from_past_term_is_not_stored() {
        let log: Arc<dyn ReplicatedLog> = Arc::new(MemoryLog::new());
        let mut state = ConsensusState::new("a", 2);
        state.set_term(2);
        state.step_down("b");
        let (_status_tx, status_rx) = watch::channel(state.status());
        let (admit_tx, admit_rx) = mpsc::unbounded_channel();
        let appender = tokio::spawn(store_admitted("a".into(), log.clone(), status_rx, admit_rx));

        let (reply, answer) = oneshot::channel();
        let admitted = Admitted {
            term: 1,
            request: command("x"),
            reply,
        };
        assert!(admit_tx.send(admitted).is_ok());
        drop(admit_tx);

        let response = answer.await.unwrap();
        assert!(!response.success);
        assert_eq!(response.leader.as_deref(), Some("b"));
        appender.await.unwrap();
        assert!(log.entries().is_empty());
    }

    #[tokio::test]
    async fn test_requests_fail_after_stop() {
        let (_transport, nodes) = cluster(vec![patient("a", &["b"])]);
        let node = &nodes[0];
        node.shutdown().await;
        node.shutdown().await;

        assert!(matches!(
            node.handle_request_vote(vote_request(1, "b")).await,
            Err(RaftError::NodeStopped)
        ));
        let response = node.handle_command(command("x")).await;
        assert!(!response.success);
    }

    #[tokio::test]
    async fn test_term_never_decreases() {
        let (_transport, nodes) = cluster(vec![
            fast("a", &["b", "c"]),
            fast("b", &["a", "c"]),
            fast("c", &["a", "b"]),
        ]);
        let mut watchers: Vec<_> = nodes.iter().map(|n| n.subscribe()).collect();
        let mut last = vec![0u64; nodes.len()];

        let deadline = Instant::now() + Duration::from_millis(1500);
        while Instant::now() < deadline {
            for (i, rx) in watchers.iter_mut().enumerate() {
                let term = rx.borrow_and_update().term;
                assert!(term >= last[i], "term went from {} to {}", last[i], term);
                last[i] = term;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(last.iter().all(|t| *t >= 1));
        for node in &nodes {
            node.shutdown().await;
        }
    }
}
