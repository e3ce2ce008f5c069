//! Sequences, sessions and the session table.
//!
//! A [`Sequence`] is the unit the scheduler manipulates: the append-only
//! token history, its sampling parameters, status and response handle. A
//! [`Session`] owns its sequences; the [`SessionTable`] owns sessions and
//! the sequence-id index so the scheduler can hold bare ids with no
//! back-pointers.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::metrics::{EngineEvent, EnginePhase};
use crate::engine::migration::MigrationRequest;
use crate::engine::request::ResponseSender;
use crate::engine::types::{ModelMeta, SeqId, SessionId, TokenId};

/// Structured-output constraint for guided decoding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ResponseFormat {
    Regex(String),
    JsonSchema(serde_json::Value),
    Grammar(String),
}

/// Per-request sampling parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingParam {
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// 0 disables top-k filtering.
    #[serde(default)]
    pub top_k: u32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_repetition_penalty")]
    pub repetition_penalty: f32,
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,
    #[serde(default)]
    pub min_new_tokens: usize,
    #[serde(default)]
    pub stop_token_ids: Vec<TokenId>,
    #[serde(default)]
    pub ignore_eos: bool,
    #[serde(default)]
    pub response_format: Option<ResponseFormat>,
    /// Names of executor-side logits processors to apply.
    #[serde(default)]
    pub logits_processors: Vec<String>,
    /// Echo raw logits back on the response stream.
    #[serde(default)]
    pub out_logits: bool,
}

impl Default for SamplingParam {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_k: 0,
            top_p: default_top_p(),
            repetition_penalty: default_repetition_penalty(),
            max_new_tokens: default_max_new_tokens(),
            min_new_tokens: 0,
            stop_token_ids: Vec::new(),
            ignore_eos: false,
            response_format: None,
            logits_processors: Vec::new(),
            out_logits: false,
        }
    }
}

fn default_temperature() -> f32 {
    1.0
}

fn default_top_p() -> f32 {
    1.0
}

fn default_repetition_penalty() -> f32 {
    1.0
}

fn default_max_new_tokens() -> usize {
    512
}

/// Embedding attachment replacing a token range `[start, end)`.
#[derive(Debug, Clone)]
pub struct InputEmbedding {
    pub start: usize,
    pub end: usize,
    pub embedding: Vec<f32>,
}

/// Opaque multimodal attachment for a token range `[start, end)`.
#[derive(Debug, Clone)]
pub struct MultiModalInput {
    pub modal_type: String,
    pub start: usize,
    pub end: usize,
    pub data: serde_json::Value,
}

/// Lifecycle state of a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequenceStatus {
    Waiting,
    Running,
    Locked,
    WaitingMigration,
    MigrationLocked,
    ToBeMigrated,
    Stopped,
}

/// An active generation job.
#[derive(Debug)]
pub struct Sequence {
    pub seq_id: SeqId,
    pub session_id: SessionId,
    all_ids: Vec<TokenId>,
    num_history_ids: usize,
    pub num_new_tokens: usize,
    pub sampling_param: SamplingParam,
    pub adapter_name: Option<String>,
    pub multimodals: Vec<MultiModalInput>,
    pub input_embeddings: Vec<InputEmbedding>,
    pub status: SequenceStatus,
    pub resp: Option<ResponseSender>,
    pub return_logits: bool,
    /// Echo cache block ids on responses.
    pub resp_cache: bool,
    /// Keep blocks at end-of-stream until a remote decode engine claims them.
    pub preserve_cache: bool,
    pub migration_request: Option<MigrationRequest>,
    pub model_meta: Option<ModelMeta>,
    pub events: Vec<EngineEvent>,
}

impl Sequence {
    pub fn num_all_ids(&self) -> usize {
        self.all_ids.len()
    }

    pub fn all_ids(&self) -> &[TokenId] {
        &self.all_ids
    }

    /// Tokens not yet consumed by a forward pass.
    pub fn token_ids(&self) -> &[TokenId] {
        &self.all_ids[self.num_history_ids..]
    }

    pub fn history_len(&self) -> usize {
        self.num_history_ids
    }

    /// Append freshly sampled tokens. Everything previously pending becomes
    /// history: its KV is materialised by the forward that produced `new_ids`.
    pub fn update_token_ids(&mut self, new_ids: &[TokenId], model_meta: Option<ModelMeta>) {
        self.num_history_ids = self.all_ids.len();
        self.all_ids.extend_from_slice(new_ids);
        if model_meta.is_some() {
            self.model_meta = model_meta;
        }
    }

    /// Append a follow-up user turn without touching the history boundary,
    /// so the next prefill only consumes the new suffix.
    pub fn append_prompt(
        &mut self,
        ids: &[TokenId],
        multimodals: Vec<MultiModalInput>,
        embeddings: Vec<InputEmbedding>,
    ) {
        self.all_ids.extend_from_slice(ids);
        self.multimodals.extend(multimodals);
        self.input_embeddings.extend(embeddings);
    }

    pub fn record_event(&mut self, phase: EnginePhase) {
        self.events.push(EngineEvent::now(phase));
    }

    /// Forget that any KV was materialised; the next prefill recomputes the
    /// whole token history. Used when a sequence is preempted without a host
    /// pool to swap into.
    pub fn reset_history(&mut self) {
        self.num_history_ids = 0;
    }

    /// Tokens still allowed before the `max_new_tokens` cap.
    pub fn num_appendable(&self) -> usize {
        self.sampling_param.max_new_tokens.saturating_sub(self.num_new_tokens)
    }
}

/// A conversational context owning one or more sequences.
#[derive(Debug, Default)]
pub struct Session {
    pub session_id: SessionId,
    pub sequences: HashMap<SeqId, Sequence>,
}

/// Arguments for creating a sequence inside a session.
#[derive(Debug, Default)]
pub struct SequenceArgs {
    pub token_ids: Vec<TokenId>,
    pub sampling_param: SamplingParam,
    pub adapter_name: Option<String>,
    pub multimodals: Vec<MultiModalInput>,
    pub input_embeddings: Vec<InputEmbedding>,
    pub return_logits: bool,
    pub resp_cache: bool,
    pub preserve_cache: bool,
    pub migration_request: Option<MigrationRequest>,
}

/// Maps session id -> session and sequence id -> owning session.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: HashMap<SessionId, Session>,
    seq_owner: HashMap<SeqId, SessionId>,
    next_seq_id: SeqId,
}

impl SessionTable {
    pub fn contains(&self, session_id: SessionId) -> bool {
        self.sessions.contains_key(&session_id)
    }

    pub fn add_session(&mut self, session_id: SessionId) -> bool {
        if self.sessions.contains_key(&session_id) {
            return false;
        }
        debug!(session_id, "adding session");
        self.sessions.insert(session_id, Session { session_id, ..Default::default() });
        true
    }

    pub fn get(&self, session_id: SessionId) -> Option<&Session> {
        self.sessions.get(&session_id)
    }

    pub fn get_mut(&mut self, session_id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&session_id)
    }

    /// Create a sequence in an existing session and index it.
    pub fn add_sequence(&mut self, session_id: SessionId, args: SequenceArgs) -> Option<SeqId> {
        if !self.sessions.contains_key(&session_id) {
            return None;
        }
        let seq_id = self.next_seq_id;
        self.next_seq_id += 1;
        let seq = Sequence {
            seq_id,
            session_id,
            all_ids: args.token_ids,
            num_history_ids: 0,
            num_new_tokens: 0,
            sampling_param: args.sampling_param,
            adapter_name: args.adapter_name,
            multimodals: args.multimodals,
            input_embeddings: args.input_embeddings,
            status: SequenceStatus::Waiting,
            resp: None,
            return_logits: args.return_logits,
            resp_cache: args.resp_cache,
            preserve_cache: args.preserve_cache,
            migration_request: args.migration_request,
            model_meta: None,
            events: Vec::new(),
        };
        let session = self.sessions.get_mut(&session_id).expect("session exists");
        session.sequences.insert(seq_id, seq);
        self.seq_owner.insert(seq_id, session_id);
        Some(seq_id)
    }

    pub fn get_seq(&self, seq_id: SeqId) -> Option<&Sequence> {
        let session_id = self.seq_owner.get(&seq_id)?;
        self.sessions.get(session_id)?.sequences.get(&seq_id)
    }

    pub fn get_seq_mut(&mut self, seq_id: SeqId) -> Option<&mut Sequence> {
        let session_id = self.seq_owner.get(&seq_id)?;
        self.sessions.get_mut(session_id)?.sequences.get_mut(&seq_id)
    }

    /// Remove a session, returning the ids of the sequences it owned so the
    /// caller can release their blocks.
    pub fn remove_session(&mut self, session_id: SessionId) -> Vec<SeqId> {
        let Some(session) = self.sessions.remove(&session_id) else {
            return Vec::new();
        };
        let seq_ids: Vec<SeqId> = session.sequences.keys().copied().collect();
        for seq_id in &seq_ids {
            self.seq_owner.remove(seq_id);
        }
        debug!(session_id, num_seqs = seq_ids.len(), "removed session");
        seq_ids
    }

    pub fn iter_seqs(&self) -> impl Iterator<Item = &Sequence> {
        self.sessions.values().flat_map(|s| s.sequences.values())
    }
}
