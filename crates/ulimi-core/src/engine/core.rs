//! The engine loop: four cooperating activities under one supervisor.
//!
//! - **preprocess** drains the request mailbox and advances session state,
//!   gated on the forward event so control changes never race a pipeline
//! - **main** assembles and submits forward inputs, then consumes one
//!   iteration's output per step, prefetching the next batch before the
//!   current pipeline drains
//! - **response** delivers [`InferOutput`]s to their originators
//! - **migration** (non-hybrid roles) services migration-waiting sequences
//!
//! When any activity fails or the engine is closed, the supervisor cancels
//! the siblings, drains pending responses and tears down the executor.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::{CacheConfig, EngineConfig, SchedulerConfig};
use crate::engine::adapter::AdapterManager;
use crate::engine::events::{CounterEvent, Event, RunableEvent};
use crate::engine::executor::{Executor, ForwardOutput};
use crate::engine::input_processor::InputProcessor;
use crate::engine::inputs::{InputsMaker, PreparedBatch};
use crate::engine::metrics::{EnginePhase, MetricsInfo};
use crate::engine::migration::{
    EngineConnection, InProcessSideChannel, MigrationConnectionRequest, MigrationDropRequest,
    MigrationExecutionBatch, MigrationHandshake, MigrationInitRequest, MigrationSideChannel,
    ReleaseNotice,
};
use crate::engine::request::{
    AddMessageRequest, EngineRequest, RequestManager, RequestSender, ResponseData, ResponseKind,
    ResponseSender,
};
use crate::engine::scheduler::Scheduler;
use crate::engine::sequence::{Sequence, SequenceArgs, SequenceStatus};
use crate::engine::types::{BlockId, EngineRole, SeqId, SessionId, TokenId};
use crate::error::{Error, Result};

const CACHE_FULL_BACKOFF: Duration = Duration::from_millis(100);
const MIGRATION_IDLE_BACKOFF: Duration = Duration::from_millis(500);

/// Output of one model iteration for one sequence.
#[derive(Debug, Clone)]
pub struct InferOutput {
    pub session_id: SessionId,
    pub resp: ResponseSender,
    /// Tokens sampled this step.
    pub token_ids: Vec<TokenId>,
    pub finish: bool,
    pub logits: Option<Vec<f32>>,
    pub cache_block_ids: Option<Vec<BlockId>>,
    pub metrics_info: MetricsInfo,
}

struct EngineState {
    scheduler: Scheduler,
    adapters: AdapterManager,
}

struct EngineCore {
    config: EngineConfig,
    state: Mutex<EngineState>,
    executor: Arc<dyn Executor>,
    input_processor: Option<Arc<dyn InputProcessor>>,
    conn: EngineConnection,
    forward_event: Arc<CounterEvent>,
    runable_event: RunableEvent,
    migration_event: Event,
    shutdown: Event,
    resp_tx: mpsc::UnboundedSender<Vec<InferOutput>>,
    max_session_len: usize,
}

/// Handle to a running engine.
///
/// Construction spawns the supervisor on the current Tokio runtime; requests
/// go through [`RequestSender`] clones obtained from [`Engine::handle`].
pub struct Engine {
    sender: RequestSender,
    core: Arc<EngineCore>,
    supervisor: tokio::task::JoinHandle<()>,
    release_rx: Option<mpsc::UnboundedReceiver<ReleaseNotice>>,
}

impl Engine {
    /// Start an engine with an in-process migration side channel. Release
    /// notices for remote prefill engines surface on
    /// [`Engine::take_release_notices`].
    pub fn new(executor: Arc<dyn Executor>, config: EngineConfig) -> Result<Self> {
        let (channel, release_rx) = InProcessSideChannel::new();
        let mut engine = Self::with_side_channel(executor, config, Box::new(channel))?;
        engine.release_rx = Some(release_rx);
        Ok(engine)
    }

    pub fn with_side_channel(
        executor: Arc<dyn Executor>,
        config: EngineConfig,
        channel: Box<dyn MigrationSideChannel>,
    ) -> Result<Self> {
        config.validate()?;
        executor.init()?;

        let scheduler_config = SchedulerConfig::from(&config);
        let cache_config = CacheConfig::from(&config);
        let max_session_len = scheduler_config.max_session_len;
        let scheduler = Scheduler::new(scheduler_config.clone(), cache_config.clone());
        let input_processor = executor.get_input_processor();

        let (sender, mailbox) = RequestManager::new();
        let (resp_tx, resp_rx) = mpsc::unbounded_channel();
        let adapters = AdapterManager::new(config.adapters.clone());

        let core = Arc::new(EngineCore {
            conn: EngineConnection::new(config.engine_id, channel),
            config,
            state: Mutex::new(EngineState { scheduler, adapters }),
            executor,
            input_processor,
            forward_event: Arc::new(CounterEvent::new()),
            runable_event: RunableEvent::new(),
            migration_event: Event::new(),
            shutdown: Event::new(),
            resp_tx,
            max_session_len,
        });
        core.forward_event.set();

        let inputs_maker =
            InputsMaker::new(scheduler_config, cache_config, core.config.dp);
        let supervisor =
            tokio::spawn(EngineCore::async_loop(core.clone(), mailbox, resp_rx, inputs_maker));
        Ok(Self { sender, core, supervisor, release_rx: None })
    }

    pub fn handle(&self) -> RequestSender {
        self.sender.clone()
    }

    /// Receiver for migration release notices (in-process channel only).
    pub fn take_release_notices(&mut self) -> Option<mpsc::UnboundedReceiver<ReleaseNotice>> {
        self.release_rx.take()
    }

    pub fn p2p_initialize(&self, request: MigrationInitRequest) -> Result<MigrationHandshake> {
        self.core.conn.p2p_initialize(request)
    }

    pub fn p2p_connect(&self, request: MigrationConnectionRequest) -> Result<()> {
        self.core.conn.p2p_connect(request)
    }

    pub fn p2p_drop_connect(&self, request: MigrationDropRequest) -> Result<()> {
        self.core.conn.p2p_drop_connect(request)
    }

    pub fn update_params(&self, request: serde_json::Value) -> Result<()> {
        self.core.executor.update_params(request)
    }

    /// Ask the supervisor to wind down; pending responses drain as `Finish`.
    pub fn close(&self) {
        self.core.shutdown.set();
    }

    /// Wait for the supervisor to finish tearing down.
    pub async fn join(self) {
        let _ = self.supervisor.await;
    }
}

impl EngineCore {
    async fn async_loop(
        core: Arc<EngineCore>,
        mailbox: RequestManager,
        resp_rx: mpsc::UnboundedReceiver<Vec<InferOutput>>,
        inputs_maker: InputsMaker,
    ) {
        core.executor.start(core.forward_event.clone());

        let mut tasks: JoinSet<Result<()>> = JoinSet::new();
        {
            let core = core.clone();
            tasks.spawn(async move { core.preprocess_loop(mailbox).await });
        }
        {
            let core = core.clone();
            tasks.spawn(async move { core.response_loop(resp_rx).await });
        }
        {
            let core = core.clone();
            tasks.spawn(async move { core.main_loop(inputs_maker).await });
        }
        if core.config.role != EngineRole::Hybrid {
            let core = core.clone();
            info!("starting migration loop");
            tasks.spawn(async move { core.migration_loop().await });
        }

        let first = tokio::select! {
            result = tasks.join_next() => result,
            _ = core.shutdown.wait() => None,
        };
        let failed = match first {
            Some(Ok(Ok(()))) => {
                debug!("engine activity finished, shutting down");
                false
            }
            Some(Ok(Err(err))) => {
                error!(error = %err, "engine activity failed");
                true
            }
            Some(Err(join_err)) => {
                error!(error = %join_err, "engine activity panicked");
                true
            }
            None => false,
        };

        tasks.abort_all();
        while tasks.join_next().await.is_some() {}

        let drain_kind =
            if failed { ResponseKind::InternalEngineError } else { ResponseKind::Finish };
        core.drain_responses(drain_kind).await;

        info!("cleanup executor");
        core.executor.stop();
        core.executor.release();
    }

    /// Terminal responses for every sequence still holding a live handle.
    async fn drain_responses(&self, kind: ResponseKind) {
        let state = self.state.lock().await;
        for seq in state.scheduler.sessions.iter_seqs() {
            if let Some(resp) = &seq.resp {
                resp.send(kind, None);
            }
        }
    }

    /// Park until no forward pipeline is mutating sequence state.
    async fn await_forward_event(&self) {
        let busy = self.state.lock().await.scheduler.has_unfinished();
        if busy {
            self.forward_event.wait().await;
        }
    }

    // ---- preprocess activity ----

    async fn preprocess_loop(self: Arc<Self>, mut mailbox: RequestManager) -> Result<()> {
        loop {
            let batch = mailbox.step().await;
            if batch.is_empty() {
                debug!("request mailbox closed");
                return Ok(());
            }
            self.await_forward_event().await;
            let mut state = self.state.lock().await;
            for request in batch {
                self.apply_request(&mut state, request);
            }
            self.runable_event.set(state.scheduler.has_unfinished());
        }
    }

    fn apply_request(&self, state: &mut EngineState, request: EngineRequest) {
        match request {
            EngineRequest::AddSession { session_id, resp } => {
                let kind = match state.scheduler.add_session(session_id) {
                    Ok(()) => ResponseKind::Success,
                    Err(err) => ResponseKind::from_error(&err),
                };
                resp.send(kind, None);
            }
            EngineRequest::StopSession { session_id, resp } => {
                match state.scheduler.stop_session(session_id) {
                    Ok(()) => {
                        Self::finish_session_resps(state, session_id);
                        resp.send(ResponseKind::Success, None);
                    }
                    Err(err) => resp.send(ResponseKind::from_error(&err), None),
                }
            }
            EngineRequest::EndSession { session_id, force, resp } => {
                Self::finish_session_resps(state, session_id);
                match state.scheduler.end_session(session_id, force) {
                    Ok(()) => resp.send(ResponseKind::Success, None),
                    Err(err) => resp.send(ResponseKind::from_error(&err), None),
                }
            }
            EngineRequest::AddMessage { request, resp } => {
                self.apply_add_message(state, request, resp);
            }
        }
    }

    /// Terminate the response stream of every sequence in a session.
    fn finish_session_resps(state: &EngineState, session_id: SessionId) {
        if let Some(session) = state.scheduler.sessions.get(session_id) {
            for seq in session.sequences.values() {
                if let Some(seq_resp) = &seq.resp {
                    seq_resp.send(ResponseKind::Finish, None);
                }
            }
        }
    }

    fn apply_add_message(
        &self,
        state: &mut EngineState,
        mut request: AddMessageRequest,
        resp: ResponseSender,
    ) {
        let session_id = request.session_id;
        if !state.scheduler.sessions.contains(session_id) {
            resp.send(ResponseKind::from_error(&Error::SessionNotExist(session_id)), None);
            return;
        }
        if request.token_ids.is_empty() && request.migration_request.is_none() {
            let err = Error::EmptyInput;
            warn!(session_id, error = %err, "rejecting message");
            resp.send(ResponseKind::from_error(&err), None);
            return;
        }

        // expand multimodal placeholders before any length accounting
        if !request.input_multimodals.is_empty() {
            match &self.input_processor {
                Some(processor) => {
                    let token_ids = std::mem::take(&mut request.token_ids);
                    let multimodals = std::mem::take(&mut request.input_multimodals);
                    match processor.preprocess_input(token_ids, multimodals) {
                        Ok(processed) => {
                            request.token_ids = processed.token_ids;
                            request.input_multimodals = processed.multimodals;
                            request.input_embeddings.extend(processed.input_embeddings);
                        }
                        Err(err) => {
                            warn!(session_id, error = %err, "input preprocessing failed");
                            resp.send(ResponseKind::InternalEngineError, None);
                            return;
                        }
                    }
                }
                None => {
                    warn!(session_id, "multimodal inputs are not supported, ignoring");
                    request.input_multimodals.clear();
                }
            }
        }

        let existing: usize = state
            .scheduler
            .sessions
            .get(session_id)
            .map(|s| s.sequences.values().map(|seq| seq.num_all_ids()).sum())
            .unwrap_or(0);
        if existing + request.token_ids.len() > self.max_session_len {
            let err = Error::InputTooLong {
                got: existing + request.token_ids.len(),
                max: self.max_session_len,
            };
            warn!(session_id, error = %err, "rejecting message");
            resp.send(ResponseKind::from_error(&err), None);
            return;
        }

        let migrating = request.migration_request.is_some();
        let has_sequence = state
            .scheduler
            .sessions
            .get(session_id)
            .map(|s| !s.sequences.is_empty())
            .unwrap_or(false);

        let seq_id = if !has_sequence {
            let args = SequenceArgs {
                token_ids: request.token_ids,
                sampling_param: request.sampling_param,
                adapter_name: request.adapter_name,
                multimodals: request.input_multimodals,
                input_embeddings: request.input_embeddings,
                return_logits: false,
                resp_cache: request.with_cache,
                preserve_cache: request.preserve_cache,
                migration_request: request.migration_request,
            };
            match state.scheduler.add_sequence(session_id, args) {
                Some(id) => id,
                None => {
                    resp.send(ResponseKind::from_error(&Error::SessionNotExist(session_id)), None);
                    return;
                }
            }
        } else {
            let session = state.scheduler.sessions.get(session_id).expect("checked");
            let seq_id = *session.sequences.keys().next().expect("non-empty");
            let seq = state.scheduler.sessions.get_seq_mut(seq_id).expect("indexed");
            seq.append_prompt(&request.token_ids, request.input_multimodals, request.input_embeddings);
            seq.sampling_param = request.sampling_param;
            state.scheduler.requeue_sequence(seq_id);
            seq_id
        };

        let seq = state.scheduler.sessions.get_seq_mut(seq_id).expect("just placed");
        seq.return_logits = seq.sampling_param.out_logits;
        self.clamp_max_new_tokens(seq);
        seq.resp = Some(resp);

        if migrating {
            self.migration_event.set();
        }
    }

    /// Truncate `max_new_tokens` so history plus generation fits the session
    /// cap.
    fn clamp_max_new_tokens(&self, seq: &mut Sequence) {
        let num_all = seq.num_all_ids();
        let max_new = seq.sampling_param.max_new_tokens;
        if max_new + num_all > self.max_session_len {
            let clamped = self.max_session_len.saturating_sub(num_all);
            warn!(
                session_id = seq.session_id,
                max_new_tokens = clamped,
                "num tokens larger than max session len, updating max_new_tokens"
            );
            seq.sampling_param.max_new_tokens = clamped;
        }
    }

    // ---- main activity ----

    async fn main_loop(self: Arc<Self>, mut inputs_maker: InputsMaker) -> Result<()> {
        let mut next_batch: Option<PreparedBatch> = None;
        loop {
            if next_batch.is_none() {
                self.runable_event.wait().await;
                self.state.lock().await.scheduler.collect_migration_done();
                next_batch = self.send_next_inputs(&mut inputs_maker).await?;
                if next_batch.is_none() {
                    let mut state = self.state.lock().await;
                    warn!(
                        free_gpu_blocks = state.scheduler.block_manager().num_free_gpu_blocks(),
                        total_gpu_blocks = state.scheduler.block_manager().num_gpu_blocks(),
                        "no runnable request, cache may be full"
                    );
                    // a saturated prefill engine reports busy instead of queueing
                    if self.config.role == EngineRole::Prefill && state.scheduler.has_waiting() {
                        for seq_id in state.scheduler.cancel_waiting() {
                            if let Some(seq) = state.scheduler.sessions.get_seq(seq_id) {
                                if let Some(resp) = &seq.resp {
                                    resp.send(ResponseKind::Cancel, None);
                                }
                            }
                        }
                    }
                    drop(state);
                    tokio::time::sleep(CACHE_FULL_BACKOFF).await;
                    continue;
                }
            }
            let batch = next_batch.take().expect("checked");
            self.state.lock().await.scheduler.lock_running(&batch.running);

            for idx in 0..batch.loop_count {
                // block preprocess from mutating sequences while outputs stream in
                if idx == batch.loop_count / 2 {
                    self.forward_event.clear();
                }
                // pipeline the next submission before the last output lands
                if idx == batch.loop_count - 1 {
                    self.state.lock().await.scheduler.collect_migration_done();
                    next_batch =
                        self.prefetch_next_inputs(&mut inputs_maker, batch.is_decoding).await?;
                }

                let output = self.executor.get_output_async().await?;
                if !output.is_empty() {
                    let outputs = {
                        let mut state = self.state.lock().await;
                        self.make_infer_outputs(&mut state, output, &batch.running)
                    };
                    let _ = self.resp_tx.send(outputs);
                }

                if idx == batch.loop_count - 1 {
                    self.forward_event.set();
                }
            }

            let mut state = self.state.lock().await;
            state.scheduler.unlock_running(&batch.running);
            self.runable_event.set(state.scheduler.has_unfinished());
        }
    }

    async fn send_next_inputs(
        &self,
        inputs_maker: &mut InputsMaker,
    ) -> Result<Option<PreparedBatch>> {
        let prepared = {
            let mut state = self.state.lock().await;
            let EngineState { scheduler, adapters } = &mut *state;
            let prefill = inputs_maker.do_prefill(scheduler);
            inputs_maker.make_forward_inputs(scheduler, adapters, prefill, false)
        };
        let Some((inputs, batch)) = prepared else {
            return Ok(None);
        };
        self.executor.forward_async(inputs).await?;
        Ok(Some(batch))
    }

    async fn prefetch_next_inputs(
        &self,
        inputs_maker: &mut InputsMaker,
        current_is_decoding: bool,
    ) -> Result<Option<PreparedBatch>> {
        let prepared = {
            let mut state = self.state.lock().await;
            let EngineState { scheduler, adapters } = &mut *state;
            if !inputs_maker.should_prefetch(scheduler, current_is_decoding) {
                return Ok(None);
            }
            debug!("prefetching next forward inputs");
            let prefill = inputs_maker.do_prefill(scheduler);
            inputs_maker.make_forward_inputs(scheduler, adapters, prefill, true)
        };
        let Some((inputs, batch)) = prepared else {
            return Ok(None);
        };
        self.executor.forward_async(inputs).await?;
        Ok(Some(batch))
    }

    /// Fold one iteration's executor output back into the locked batch:
    /// append tokens, run stop checks, and build the per-sequence outputs.
    fn make_infer_outputs(
        &self,
        state: &mut EngineState,
        output: ForwardOutput,
        running: &[SeqId],
    ) -> Vec<InferOutput> {
        let stats = state.scheduler.make_stats();
        let mut outputs = Vec::new();
        for (idx, &seq_id) in running.iter().enumerate() {
            let Some(seq) = state.scheduler.sessions.get_seq_mut(seq_id) else {
                continue;
            };
            if seq.status != SequenceStatus::Locked {
                continue;
            }
            let Some(&token) = output.next_token_ids.get(idx) else {
                continue;
            };
            // at the cap already (e.g. right after a migration bootstrap):
            // stop without accepting another token
            if seq.num_appendable() == 0 {
                seq.status = if seq.preserve_cache {
                    SequenceStatus::ToBeMigrated
                } else {
                    SequenceStatus::Stopped
                };
                seq.record_event(EnginePhase::Finished);
                if let Some(resp) = seq.resp.clone() {
                    let session_id = seq.session_id;
                    let events = seq.events.clone();
                    outputs.push(InferOutput {
                        session_id,
                        resp,
                        token_ids: Vec::new(),
                        finish: true,
                        logits: None,
                        cache_block_ids: None,
                        metrics_info: MetricsInfo {
                            new_token_timestamp: output.new_token_timestamp,
                            events,
                            stats,
                        },
                    });
                }
                continue;
            }
            let meta = output.model_metas.as_ref().and_then(|m| m.get(idx).cloned()).flatten();
            seq.update_token_ids(&[token], meta);
            seq.num_new_tokens += 1;

            let param = &seq.sampling_param;
            let stop_token_hit = !param.ignore_eos
                && param.stop_token_ids.contains(&token)
                && seq.num_new_tokens >= param.min_new_tokens;
            let cap_hit = seq.num_new_tokens >= param.max_new_tokens;
            let executor_stop = output.stopped.get(idx).copied().unwrap_or(false);
            let finish = executor_stop || stop_token_hit || cap_hit;
            if finish {
                seq.status = if seq.preserve_cache {
                    SequenceStatus::ToBeMigrated
                } else {
                    SequenceStatus::Stopped
                };
                seq.record_event(EnginePhase::Finished);
            }

            let Some(resp) = seq.resp.clone() else {
                continue;
            };
            let session_id = seq.session_id;
            let resp_cache = seq.resp_cache;
            let return_logits = seq.return_logits;
            let events = seq.events.clone();

            let cache_block_ids = resp_cache.then(|| {
                state
                    .scheduler
                    .block_manager()
                    .get_block_table(seq_id)
                    .map_or(Vec::new(), |t| t.to_vec())
            });
            let logits = if return_logits {
                output.logits.as_ref().and_then(|rows| rows.get(idx).cloned())
            } else {
                None
            };
            outputs.push(InferOutput {
                session_id,
                resp,
                token_ids: vec![token],
                finish,
                logits,
                cache_block_ids,
                metrics_info: MetricsInfo {
                    new_token_timestamp: output.new_token_timestamp,
                    events,
                    stats,
                },
            });
        }
        outputs
    }

    // ---- response activity ----

    async fn response_loop(
        self: Arc<Self>,
        mut resp_rx: mpsc::UnboundedReceiver<Vec<InferOutput>>,
    ) -> Result<()> {
        loop {
            let Some(mut outputs) = resp_rx.recv().await else {
                return Ok(());
            };
            while let Ok(more) = resp_rx.try_recv() {
                outputs.extend(more);
            }
            // never re-enter the scheduler from the response path mid-pipeline
            self.await_forward_event().await;
            debug!(num_outputs = outputs.len(), "sending responses");
            for output in outputs {
                let finish = output.finish;
                if !output.token_ids.is_empty() {
                    output.resp.send(
                        ResponseKind::Success,
                        Some(ResponseData {
                            token_ids: output.token_ids,
                            logits: output.logits,
                            cache_block_ids: output.cache_block_ids,
                            metrics_info: Some(output.metrics_info),
                        }),
                    );
                }
                if finish {
                    output.resp.send(ResponseKind::Finish, None);
                }
            }
        }
    }

    // ---- migration activity ----

    async fn migration_loop(self: Arc<Self>) -> Result<()> {
        loop {
            let (scheduled, has_waiting) = {
                let mut state = self.state.lock().await;
                let scheduled = state.scheduler.schedule_migration();
                let has_waiting = state.scheduler.has_migration_waiting();
                (scheduled, has_waiting)
            };
            if scheduled.is_empty() {
                if has_waiting {
                    // local blocks exhausted, let decode make progress
                    tokio::time::sleep(MIGRATION_IDLE_BACKOFF).await;
                } else {
                    self.migration_event.wait().await;
                }
                continue;
            }
            self.migration_event.clear();

            let mut migrated = Vec::new();
            for seq_id in scheduled {
                if self.migrate_one(seq_id).await? {
                    migrated.push(seq_id);
                }
            }
            if migrated.is_empty() {
                continue;
            }

            let outputs = {
                let mut state = self.state.lock().await;
                state.scheduler.lock_running_migration(&migrated);
                let outputs = self.make_migration_outputs(&mut state, &migrated);
                state.scheduler.unlock_running_migration(&migrated);
                outputs
            };
            let _ = self.resp_tx.send(outputs);
            self.runable_event.set(true);
        }
    }

    /// Transfer one sequence's KV from its remote prefill engine.
    /// Per-sequence failures resolve locally; executor faults propagate.
    async fn migrate_one(&self, seq_id: SeqId) -> Result<bool> {
        let (request, local_blocks, session_id, resp) = {
            let state = self.state.lock().await;
            let Some(seq) = state.scheduler.sessions.get_seq(seq_id) else {
                return Ok(false);
            };
            let Some(request) = seq.migration_request.clone() else {
                return Ok(false);
            };
            let local_blocks = state
                .scheduler
                .block_manager()
                .get_block_table(seq_id)
                .map_or(Vec::new(), |t| t.to_vec());
            (request, local_blocks, seq.session_id, seq.resp.clone())
        };

        if request.is_dummy_prefill {
            return Ok(true);
        }

        if request.remote_block_ids.len() != local_blocks.len() {
            let err = Error::MigrationBlockMismatch {
                remote: request.remote_block_ids.len(),
                local: local_blocks.len(),
            };
            error!(session_id, error = %err, "dropping sequence");
            if let Some(resp) = resp {
                resp.send(ResponseKind::Finish, Some(ResponseData::default()));
            }
            self.state.lock().await.scheduler.fail_migration(seq_id);
            return Ok(false);
        }

        let batch = MigrationExecutionBatch {
            protocol: request.protocol,
            requests: vec![(
                request.remote_engine_id,
                request.remote_block_ids.iter().copied().zip(local_blocks).collect(),
            )],
        };
        info!(session_id, "migrating session begin");
        self.executor.migrate(batch).await?;
        info!(session_id, "migrating session done");

        if let Err(err) = self
            .conn
            .notify_migration_done(request.remote_engine_id, request.remote_session_id)
            .await
        {
            error!(session_id, error = %err, "migration side channel failed");
            if let Some(resp) = resp {
                resp.send(ResponseKind::InternalEngineError, None);
            }
            self.state.lock().await.scheduler.fail_migration(seq_id);
            return Ok(false);
        }
        Ok(true)
    }

    /// Bootstrap outputs carrying each remote's last sampled token.
    fn make_migration_outputs(
        &self,
        state: &mut EngineState,
        migrated: &[SeqId],
    ) -> Vec<InferOutput> {
        let stats = state.scheduler.make_stats();
        let timestamp = crate::engine::metrics::unix_timestamp();
        let mut outputs = Vec::new();
        for &seq_id in migrated {
            let Some(seq) = state.scheduler.sessions.get_seq_mut(seq_id) else {
                continue;
            };
            let Some(request) = seq.migration_request.clone() else {
                continue;
            };
            let token = request.remote_token_id;
            self.update_running_migration(seq, token, false);
            let Some(resp) = seq.resp.clone() else {
                continue;
            };
            outputs.push(InferOutput {
                session_id: seq.session_id,
                resp,
                token_ids: vec![token],
                finish: false,
                logits: None,
                cache_block_ids: None,
                metrics_info: MetricsInfo {
                    new_token_timestamp: timestamp,
                    events: seq.events.clone(),
                    stats,
                },
            });
        }
        outputs
    }

    /// Fold a token into a migration-locked sequence. On stop the upstream
    /// behaviour overwrites the just-written token with the empty sentinel;
    /// `deliver_final_migration_token` flips delivery on instead.
    fn update_running_migration(&self, seq: &mut Sequence, token: TokenId, stop: bool) {
        if seq.status != SequenceStatus::MigrationLocked {
            return;
        }
        seq.update_token_ids(&[token], None);
        seq.num_new_tokens += 1;
        if stop {
            if !self.config.deliver_final_migration_token {
                seq.update_token_ids(&[], None);
            }
            seq.status = SequenceStatus::Stopped;
        }
    }
}
