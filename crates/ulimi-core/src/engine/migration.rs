//! Disaggregated prefill/decode migration plumbing.
//!
//! A decode engine receives a [`MigrationRequest`] attached to an incoming
//! message, pairs the remote prefill blocks with freshly allocated local
//! blocks into a [`MigrationExecutionBatch`] for the executor, and signals
//! the remote engine over a side channel once the KV transfer lands. The
//! transport itself (RDMA / NVLink / TCP) lives behind
//! [`MigrationSideChannel`] and the executor.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::engine::types::{BlockId, EngineId, SessionId, TokenId, TransportProtocol};
use crate::error::{Error, Result};

/// Migration order attached to an AddMessage on a decode engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationRequest {
    pub protocol: TransportProtocol,
    pub remote_engine_id: EngineId,
    pub remote_session_id: SessionId,
    /// Last token sampled by the prefill engine, bootstraps the decode stream.
    pub remote_token_id: TokenId,
    pub remote_block_ids: Vec<BlockId>,
    /// Length-zero prefill: skip the transfer, still emit the bootstrap token.
    pub is_dummy_prefill: bool,
}

/// Block-pair transfer batch handed to the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationExecutionBatch {
    pub protocol: TransportProtocol,
    /// Per remote engine: `(remote_block, local_block)` pairs.
    pub requests: Vec<(EngineId, Vec<(BlockId, BlockId)>)>,
}

/// Handshake request from a decode engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationInitRequest {
    pub local_engine_id: EngineId,
    pub local_session_id: SessionId,
    pub protocol: TransportProtocol,
    pub remote_endpoint_hints: Vec<String>,
}

/// Endpoint descriptors returned from `p2p_initialize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationHandshake {
    pub engine_id: EngineId,
    pub protocol: TransportProtocol,
    pub endpoints: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConnectionRequest {
    pub remote_engine_id: EngineId,
    pub protocol: TransportProtocol,
    pub endpoints: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationDropRequest {
    pub remote_engine_id: EngineId,
}

/// Release notice sent to the prefill engine after a migration lands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseNotice {
    pub remote_engine_id: EngineId,
    pub remote_session_id: SessionId,
}

/// Side channel used to tell a remote engine its blocks may be released.
#[async_trait]
pub trait MigrationSideChannel: Send + Sync {
    async fn send_release(&self, notice: ReleaseNotice) -> anyhow::Result<()>;
}

/// In-process side channel for tests and single-host deployments.
pub struct InProcessSideChannel {
    tx: mpsc::UnboundedSender<ReleaseNotice>,
}

impl InProcessSideChannel {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ReleaseNotice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl MigrationSideChannel for InProcessSideChannel {
    async fn send_release(&self, notice: ReleaseNotice) -> anyhow::Result<()> {
        self.tx.send(notice).map_err(|_| anyhow::anyhow!("release receiver dropped"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Initialized,
    Connected,
}

/// Tracks P2P links to remote engines and forwards release notices.
pub struct EngineConnection {
    engine_id: EngineId,
    channel: Box<dyn MigrationSideChannel>,
    links: Mutex<HashMap<EngineId, LinkState>>,
}

impl EngineConnection {
    pub fn new(engine_id: EngineId, channel: Box<dyn MigrationSideChannel>) -> Self {
        Self { engine_id, channel, links: Mutex::new(HashMap::new()) }
    }

    /// Record a requested link and answer with this engine's endpoints.
    pub fn p2p_initialize(&self, init_request: MigrationInitRequest) -> Result<MigrationHandshake> {
        debug!(
            remote_engine_id = init_request.local_engine_id,
            protocol = ?init_request.protocol,
            "p2p initialize"
        );
        self.links
            .lock()
            .expect("link table poisoned")
            .insert(init_request.local_engine_id, LinkState::Initialized);
        Ok(MigrationHandshake {
            engine_id: self.engine_id,
            protocol: init_request.protocol,
            endpoints: init_request.remote_endpoint_hints,
        })
    }

    /// Complete transport plumbing for an initialized link.
    pub fn p2p_connect(&self, conn_request: MigrationConnectionRequest) -> Result<()> {
        let mut links = self.links.lock().expect("link table poisoned");
        match links.get_mut(&conn_request.remote_engine_id) {
            Some(state) => {
                *state = LinkState::Connected;
                info!(remote_engine_id = conn_request.remote_engine_id, "p2p connected");
                Ok(())
            }
            None => Err(Error::MigrationTransport(anyhow::anyhow!(
                "connect before initialize for engine {}",
                conn_request.remote_engine_id
            ))),
        }
    }

    pub fn p2p_drop_connect(&self, drop_request: MigrationDropRequest) -> Result<()> {
        self.links.lock().expect("link table poisoned").remove(&drop_request.remote_engine_id);
        info!(remote_engine_id = drop_request.remote_engine_id, "p2p dropped");
        Ok(())
    }

    /// Tell the remote prefill engine its blocks for a session may go.
    pub async fn notify_migration_done(
        &self,
        remote_engine_id: EngineId,
        remote_session_id: SessionId,
    ) -> Result<()> {
        self.channel
            .send_release(ReleaseNotice { remote_engine_id, remote_session_id })
            .await
            .map_err(Error::MigrationTransport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_requires_initialize() {
        let (channel, _rx) = InProcessSideChannel::new();
        let conn = EngineConnection::new(1, Box::new(channel));

        let request = MigrationConnectionRequest {
            remote_engine_id: 2,
            protocol: TransportProtocol::Tcp,
            endpoints: vec![],
        };
        assert!(conn.p2p_connect(request.clone()).is_err());

        conn.p2p_initialize(MigrationInitRequest {
            local_engine_id: 2,
            local_session_id: 9,
            protocol: TransportProtocol::Tcp,
            remote_endpoint_hints: vec!["tcp://prefill:4400".into()],
        })
        .unwrap();
        assert!(conn.p2p_connect(request).is_ok());
    }

    #[tokio::test]
    async fn test_release_notice_round_trip() {
        let (channel, mut rx) = InProcessSideChannel::new();
        let conn = EngineConnection::new(1, Box::new(channel));

        conn.notify_migration_done(2, 42).await.unwrap();
        let notice = rx.recv().await.unwrap();
        assert_eq!(notice, ReleaseNotice { remote_engine_id: 2, remote_session_id: 42 });
    }
}
