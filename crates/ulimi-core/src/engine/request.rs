//! Typed control-plane mailbox and response handles.
//!
//! External submitters clone a [`RequestSender`] and enqueue typed messages;
//! the engine's preprocess activity drains the mailbox in submission order.
//! Every message carries a [`ResponseSender`] through which the engine posts
//! either a single control response or a `Success* Finish` generation stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::Stream;
use tracing::debug;

use crate::engine::metrics::MetricsInfo;
use crate::engine::migration::MigrationRequest;
use crate::engine::sequence::{InputEmbedding, MultiModalInput, SamplingParam};
use crate::engine::types::{BlockId, SessionId, TokenId};
use crate::error::{Error, Result};

/// Control-plane response codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseKind {
    Success,
    Finish,
    SessionRepeat,
    SessionNotExist,
    InputLengthError,
    InternalEngineError,
    Cancel,
}

impl ResponseKind {
    /// Code reported to the caller for a recoverable per-request error.
    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::EmptyInput | Error::InputTooLong { .. } => ResponseKind::InputLengthError,
            Error::SessionRepeat(_) => ResponseKind::SessionRepeat,
            Error::SessionNotExist(_) => ResponseKind::SessionNotExist,
            _ => ResponseKind::InternalEngineError,
        }
    }
}

/// Payload attached to generation responses.
#[derive(Debug, Clone, Default)]
pub struct ResponseData {
    pub token_ids: Vec<TokenId>,
    pub logits: Option<Vec<f32>>,
    pub cache_block_ids: Option<Vec<BlockId>>,
    pub metrics_info: Option<MetricsInfo>,
}

/// One message on a response stream.
#[derive(Debug, Clone)]
pub struct EngineResponse {
    pub kind: ResponseKind,
    pub data: Option<ResponseData>,
}

impl EngineResponse {
    /// Everything except `Success` terminates the stream.
    pub fn is_terminal(&self) -> bool {
        self.kind != ResponseKind::Success
    }
}

/// Engine-side handle used to post responses for one request.
///
/// Posts after a terminal response are dropped, so a late `Success` from an
/// in-flight step can never trail a `Finish`.
#[derive(Debug, Clone)]
pub struct ResponseSender {
    tx: mpsc::UnboundedSender<EngineResponse>,
    finished: Arc<AtomicBool>,
}

impl ResponseSender {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<EngineResponse>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, finished: Arc::new(AtomicBool::new(false)) }, rx)
    }

    pub fn send(&self, kind: ResponseKind, data: Option<ResponseData>) {
        if self.finished.load(Ordering::Relaxed) {
            return;
        }
        let response = EngineResponse { kind, data };
        if response.is_terminal() {
            self.finished.store(true, Ordering::Relaxed);
        }
        // receiver gone means the client went away, nothing to do
        let _ = self.tx.send(response);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Relaxed)
    }
}

/// Generation request payload.
#[derive(Debug, Default)]
pub struct AddMessageRequest {
    pub session_id: SessionId,
    pub token_ids: Vec<TokenId>,
    pub sampling_param: SamplingParam,
    pub adapter_name: Option<String>,
    pub input_multimodals: Vec<MultiModalInput>,
    pub input_embeddings: Vec<InputEmbedding>,
    pub migration_request: Option<MigrationRequest>,
    /// Echo cache block ids on responses.
    pub with_cache: bool,
    /// Keep KV blocks at end-of-stream for a remote decode engine.
    pub preserve_cache: bool,
}

/// Typed mailbox message.
#[derive(Debug)]
pub enum EngineRequest {
    AddSession { session_id: SessionId, resp: ResponseSender },
    StopSession { session_id: SessionId, resp: ResponseSender },
    EndSession { session_id: SessionId, force: bool, resp: ResponseSender },
    AddMessage { request: AddMessageRequest, resp: ResponseSender },
}

const MAILBOX_CAPACITY: usize = 1024;
const DRAIN_LIMIT: usize = 256;

/// Consumer half of the mailbox, owned by the preprocess activity.
pub struct RequestManager {
    rx: mpsc::Receiver<EngineRequest>,
}

impl RequestManager {
    pub fn new() -> (RequestSender, RequestManager) {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        (RequestSender { tx }, RequestManager { rx })
    }

    /// Await at least one message, then drain whatever else is queued.
    /// Returns an empty batch once every sender is gone.
    pub async fn step(&mut self) -> Vec<EngineRequest> {
        let mut batch = Vec::new();
        let received = self.rx.recv_many(&mut batch, DRAIN_LIMIT).await;
        if received > 0 {
            debug!(num_requests = received, "drained request mailbox");
        }
        batch
    }
}

/// Cheap-clone producer half of the mailbox.
#[derive(Clone)]
pub struct RequestSender {
    tx: mpsc::Sender<EngineRequest>,
}

impl RequestSender {
    async fn send(&self, request: EngineRequest) -> Result<()> {
        self.tx.send(request).await.map_err(|_| Error::EngineStopped)
    }

    async fn send_control(
        &self,
        build: impl FnOnce(ResponseSender) -> EngineRequest,
    ) -> Result<ResponseKind> {
        let (resp, mut rx) = ResponseSender::channel();
        self.send(build(resp)).await?;
        match rx.recv().await {
            Some(response) => Ok(response.kind),
            None => Err(Error::EngineStopped),
        }
    }

    /// Create a session; `SessionRepeat` if it already exists.
    pub async fn add_session(&self, session_id: SessionId) -> Result<ResponseKind> {
        self.send_control(|resp| EngineRequest::AddSession { session_id, resp }).await
    }

    /// Stop generation in a session, keeping its cache.
    pub async fn stop_session(&self, session_id: SessionId) -> Result<ResponseKind> {
        self.send_control(|resp| EngineRequest::StopSession { session_id, resp }).await
    }

    /// Destroy a session and release its blocks.
    pub async fn end_session(&self, session_id: SessionId) -> Result<ResponseKind> {
        self.send_control(|resp| EngineRequest::EndSession { session_id, force: false, resp })
            .await
    }

    /// Forced end used by the migration release path: frees blocks even for
    /// a sequence parked in the preserve-cache state.
    pub async fn end_session_forced(&self, session_id: SessionId) -> Result<ResponseKind> {
        self.send_control(|resp| EngineRequest::EndSession { session_id, force: true, resp }).await
    }

    /// Submit a generation request; responses arrive as `Success* Finish`.
    pub async fn add_message(
        &self,
        request: AddMessageRequest,
    ) -> Result<UnboundedReceiverStream<EngineResponse>> {
        let (resp, rx) = ResponseSender::channel();
        self.send(EngineRequest::AddMessage { request, resp }).await?;
        Ok(UnboundedReceiverStream::new(rx))
    }

    /// Convenience stream that closes right after the terminal response.
    pub async fn generate(
        &self,
        request: AddMessageRequest,
    ) -> Result<impl Stream<Item = EngineResponse>> {
        let (resp, mut rx) = ResponseSender::channel();
        self.send(EngineRequest::AddMessage { request, resp }).await?;
        Ok(async_stream::stream! {
            while let Some(response) = rx.recv().await {
                let terminal = response.is_terminal();
                yield response;
                if terminal {
                    break;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_mapping() {
        assert_eq!(ResponseKind::from_error(&Error::EmptyInput), ResponseKind::InputLengthError);
        assert_eq!(
            ResponseKind::from_error(&Error::InputTooLong { got: 9, max: 4 }),
            ResponseKind::InputLengthError
        );
        assert_eq!(ResponseKind::from_error(&Error::SessionRepeat(1)), ResponseKind::SessionRepeat);
        assert_eq!(
            ResponseKind::from_error(&Error::SessionNotExist(1)),
            ResponseKind::SessionNotExist
        );
        assert_eq!(
            ResponseKind::from_error(&Error::Executor("device lost".into())),
            ResponseKind::InternalEngineError
        );
    }

    #[test]
    fn test_no_success_after_finish() {
        let (sender, mut rx) = ResponseSender::channel();
        sender.send(ResponseKind::Success, None);
        sender.send(ResponseKind::Finish, None);
        sender.send(ResponseKind::Success, None);

        assert_eq!(rx.try_recv().unwrap().kind, ResponseKind::Success);
        assert_eq!(rx.try_recv().unwrap().kind, ResponseKind::Finish);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_mailbox_preserves_order() {
        let (sender, mut manager) = RequestManager::new();
        let (resp, _rx) = ResponseSender::channel();
        for session_id in 0..3 {
            sender
                .send(EngineRequest::AddSession { session_id, resp: resp.clone() })
                .await
                .unwrap();
        }
        let batch = manager.step().await;
        let ids: Vec<_> = batch
            .iter()
            .map(|r| match r {
                EngineRequest::AddSession { session_id, .. } => *session_id,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_step_returns_empty_when_closed() {
        let (sender, mut manager) = RequestManager::new();
        drop(sender);
        assert!(manager.step().await.is_empty());
    }
}
