//! Outbound RPC transport.
//!
//! The node reaches its peers only through the [`Transport`] trait. The
//! trait uses manually desugared async methods (pinned boxed futures) so it
//! can be held as `Arc<dyn Transport>` and shared by every fan-out task.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::RwLock;
use std::time::Duration;

use tracing::debug;

use super::raft::RaftNode;
use super::rpc::{EntryRequest, EntryResponse, VoteRequest, VoteResponse};
use crate::errors::TransportError;

/// Result of one outbound RPC.
pub type RpcFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Async peer-to-peer RPC contract.
pub trait Transport: Send + Sync + 'static {
    /// Ask `peer` for its vote, giving up after `timeout`.
    fn request_vote(
        &self,
        peer: &str,
        request: VoteRequest,
        timeout: Duration,
    ) -> RpcFuture<'_, VoteResponse>;

    /// Deliver an AppendEntries (heartbeat) to `peer`, giving up after `timeout`.
    fn append_entries(
        &self,
        peer: &str,
        request: EntryRequest,
        timeout: Duration,
    ) -> RpcFuture<'_, EntryResponse>;
}

// -- HTTP ---------------------------------------------------------------------

/// JSON-over-HTTP transport.
///
/// Peers are addressed as `host:port`; RPCs are `POST`ed to
/// `http://{peer}/request_vote` and `http://{peer}/append_entries`.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(200))
            .build()?;
        Ok(Self { client })
    }

    async fn post<Req, Resp>(
        &self,
        peer: &str,
        path: &str,
        request: &Req,
        timeout: Duration,
    ) -> Result<Resp, TransportError>
    where
        Req: serde::Serialize + std::fmt::Debug,
        Resp: serde::de::DeserializeOwned,
    {
        let endpoint = format!("http://{peer}{path}");
        debug!("POST {} {:?}", endpoint, request);

        let response = self
            .client
            .post(&endpoint)
            .timeout(timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(peer, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                peer: peer.to_string(),
                status: status.as_u16(),
            });
        }

        response
            .json::<Resp>()
            .await
            .map_err(|e| TransportError::from_reqwest(peer, e))
    }
}

impl Transport for HttpTransport {
    fn request_vote(
        &self,
        peer: &str,
        request: VoteRequest,
        timeout: Duration,
    ) -> RpcFuture<'_, VoteResponse> {
        let peer = peer.to_string();
        Box::pin(async move { self.post(&peer, "/request_vote", &request, timeout).await })
    }

    fn append_entries(
        &self,
        peer: &str,
        request: EntryRequest,
        timeout: Duration,
    ) -> RpcFuture<'_, EntryResponse> {
        let peer = peer.to_string();
        Box::pin(async move { self.post(&peer, "/append_entries", &request, timeout).await })
    }
}

// -- In-process ---------------------------------------------------------------

/// Transport that calls other [`RaftNode`]s living in the same process.
///
/// Used to run whole clusters inside one runtime. Links can be cut with
/// [`LocalTransport::isolate`] to simulate partitions.
#[derive(Default)]
pub struct LocalTransport {
    nodes: RwLock<HashMap<String, RaftNode>>,
    isolated: RwLock<HashSet<String>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `node` reachable under its id.
    pub fn register(&self, node: RaftNode) {
        let mut nodes = self.nodes.write().expect("rwlock poisoned");
        nodes.insert(node.id().to_string(), node);
    }

    /// Drop every message to or from `id` until [`LocalTransport::heal`].
    pub fn isolate(&self, id: &str) {
        let mut isolated = self.isolated.write().expect("rwlock poisoned");
        isolated.insert(id.to_string());
    }

    pub fn heal(&self, id: &str) {
        let mut isolated = self.isolated.write().expect("rwlock poisoned");
        isolated.remove(id);
    }

    fn route(&self, from: &str, peer: &str) -> Result<RaftNode, TransportError> {
        let unreachable = || TransportError::Unreachable {
            peer: peer.to_string(),
        };
        {
            let isolated = self.isolated.read().expect("rwlock poisoned");
            if isolated.contains(from) || isolated.contains(peer) {
                return Err(unreachable());
            }
        }
        let nodes = self.nodes.read().expect("rwlock poisoned");
        nodes.get(peer).cloned().ok_or_else(unreachable)
    }
}

impl Transport for LocalTransport {
    fn request_vote(
        &self,
        peer: &str,
        request: VoteRequest,
        timeout: Duration,
    ) -> RpcFuture<'_, VoteResponse> {
        let peer = peer.to_string();
        Box::pin(async move {
            let node = self.route(&request.candidate_id, &peer)?;
            match tokio::time::timeout(timeout, node.handle_request_vote(request)).await {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(_)) => Err(TransportError::Unreachable { peer }),
                Err(_) => Err(TransportError::Timeout { peer }),
            }
        })
    }

    fn append_entries(
        &self,
        peer: &str,
        request: EntryRequest,
        timeout: Duration,
    ) -> RpcFuture<'_, EntryResponse> {
        let peer = peer.to_string();
        Box::pin(async move {
            let node = self.route(&request.leader_id, &peer)?;
            match tokio::time::timeout(timeout, node.handle_append_entries(request)).await {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(_)) => Err(TransportError::Unreachable { peer }),
                Err(_) => Err(TransportError::Timeout { peer }),
            }
        })
    }
}
