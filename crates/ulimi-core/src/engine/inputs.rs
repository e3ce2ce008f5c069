//! Per-step forward input assembly.
//!
//! [`InputsMaker`] drives the scheduler, then gathers the selected batch into
//! one [`ForwardInputs`] bundle: concatenated tokens, padded block offsets,
//! batched sampling state and the swap maps the executor applies alongside
//! the forward. It also owns the prefill/decode interleaving decision.

use tracing::debug;

use crate::config::{CacheConfig, SchedulerConfig};
use crate::engine::adapter::AdapterManager;
use crate::engine::block_manager::SwapMap;
use crate::engine::sampling::SamplingInputs;
use crate::engine::scheduler::Scheduler;
use crate::engine::sequence::{InputEmbedding, MultiModalInput, Sequence};
use crate::engine::types::{BlockId, EngineRole, ModelMeta, SeqId, TokenId, BLOCK_PAD};

/// Embedding indexing for multimodal sequences, translated into the batch.
#[derive(Debug, Clone, Default)]
pub struct VisionInputs {
    pub history_lengths: Vec<usize>,
    /// Per-sequence embedding attachments.
    pub input_embeddings: Vec<Vec<InputEmbedding>>,
    /// Global `[start, end)` token positions per attachment.
    pub input_embedding_ranges: Vec<Vec<(usize, usize)>>,
    /// batch x max_q_len mask; true means "substitute the supplied embedding".
    pub input_embedding_indexing: Vec<Vec<bool>>,
    pub input_multimodals: Vec<Vec<MultiModalInput>>,
}

/// Everything the executor needs for one submission.
#[derive(Debug, Clone, Default)]
pub struct ForwardInputs {
    /// Tokens of every sequence in the batch, concatenated.
    pub input_ids: Vec<TokenId>,
    /// Per-sequence token count: prompt length in prefill, 1 in decode.
    pub seq_length: Vec<usize>,
    pub history_lengths: Vec<usize>,
    /// batch x max_blocks physical block ids, right-padded with [`BLOCK_PAD`].
    pub block_offsets: Vec<Vec<BlockId>>,
    pub is_decoding: bool,
    pub swap_in_map: SwapMap,
    pub swap_out_map: SwapMap,
    pub sampling_inputs: SamplingInputs,
    /// Full history per sequence; only gathered when the sampler needs it.
    pub all_ids: Option<Vec<Vec<TokenId>>>,
    /// Generated suffix per sequence, for guided decoding only.
    pub guided_input_ids: Option<Vec<Vec<TokenId>>>,
    /// Tokens each sequence may still append before its cap.
    pub num_appendable_ids: Vec<i64>,
    /// Positive while stop tokens are still suppressed per sequence.
    pub num_ignore_eos: Vec<i64>,
    pub return_logits: bool,
    /// Total input exceeds the prefill chunking threshold.
    pub sync_long_context: bool,
    /// Executor-side autoregressive iterations for this submission.
    pub loop_count: usize,
    pub local_adapter_ids: Option<Vec<u32>>,
    pub vision_inputs: Option<VisionInputs>,
    pub model_metas: Vec<Option<ModelMeta>>,
    pub is_dummy: bool,
}

/// Scheduling metadata the engine loop keeps for a submitted batch.
#[derive(Debug, Clone)]
pub struct PreparedBatch {
    pub running: Vec<SeqId>,
    pub loop_count: usize,
    pub is_decoding: bool,
}

/// Assembles forward inputs and decides when prefill interrupts decode.
pub struct InputsMaker {
    scheduler_config: SchedulerConfig,
    cache_config: CacheConfig,
    dp: usize,
    next_is_prefill: bool,
}

impl InputsMaker {
    pub fn new(scheduler_config: SchedulerConfig, cache_config: CacheConfig, dp: usize) -> Self {
        Self { scheduler_config, cache_config, dp, next_is_prefill: true }
    }

    /// Interleaving decision: prefill when enough waiters piled up or the
    /// running pool is too thin to keep the device busy.
    pub fn do_prefill(&self, scheduler: &Scheduler) -> bool {
        if self.dp > 1 {
            return self.do_prefill_dp(scheduler);
        }
        let role = self.cache_config.role;
        if !scheduler.has_waiting() {
            return false;
        }
        let permitted_waiting = if role == EngineRole::Prefill { 1 } else { 4 };
        if scheduler.num_waiting() >= permitted_waiting {
            return true;
        }
        scheduler.num_running() * 2 < self.scheduler_config.max_batches
    }

    /// Data-parallel variant: a pure prefill rank runs prefill whenever
    /// waiters exist; a decode rank only while nothing is running.
    fn do_prefill_dp(&self, scheduler: &Scheduler) -> bool {
        if self.cache_config.role == EngineRole::Prefill {
            return true;
        }
        if self.next_is_prefill {
            scheduler.has_waiting()
        } else {
            !scheduler.has_running()
        }
    }

    /// Whether pipelining the next batch is worth it mid-pipeline.
    pub fn should_prefetch(&self, scheduler: &Scheduler, current_is_decoding: bool) -> bool {
        if self.do_prefill(scheduler) {
            return true;
        }
        let threshold =
            if current_is_decoding { self.scheduler_config.max_batches / 4 } else { 0 };
        scheduler.num_running() > threshold
    }

    /// Run the scheduler and assemble the next submission.
    ///
    /// `enable_empty` suppresses the decode fallback used on the normal path
    /// when a prefill schedule comes back empty.
    pub fn make_forward_inputs(
        &mut self,
        scheduler: &mut Scheduler,
        adapters: &AdapterManager,
        prefill: bool,
        enable_empty: bool,
    ) -> Option<(ForwardInputs, PreparedBatch)> {
        let prefill_interval = self.scheduler_config.prefill_interval;
        let mut prefill = prefill;
        let mut output = scheduler.schedule(prefill, prefill_interval);

        if enable_empty && output.running.is_empty() {
            return None;
        }
        // schedule decoding if no valid prefill reqs
        if prefill
            && output.running.is_empty()
            && self.cache_config.role != EngineRole::Prefill
        {
            prefill = false;
            output = scheduler.schedule(false, prefill_interval);
        }
        if output.running.is_empty() {
            return None;
        }

        let loop_count = if prefill { 1 } else { prefill_interval };
        let running = output.running.clone();
        let seqs: Vec<&Sequence> =
            running.iter().map(|&id| scheduler.sessions.get_seq(id).expect("scheduled")).collect();

        let mut inputs = self.gather(&seqs, &scheduler.get_block_tables(&running), !prefill);
        inputs.swap_in_map = output.swap_in_map;
        inputs.swap_out_map = output.swap_out_map;
        inputs.loop_count = loop_count;
        if adapters.num_adapters() > 1 {
            let names: Vec<Option<&str>> = seqs.iter().map(|s| s.adapter_name.as_deref()).collect();
            inputs.local_adapter_ids = Some(adapters.get_adapter_ids(&names));
        }

        self.next_is_prefill = !inputs.is_decoding;
        debug!(
            batch = running.len(),
            is_decoding = inputs.is_decoding,
            loop_count,
            "assembled forward inputs"
        );
        Some((inputs, PreparedBatch { running, loop_count, is_decoding: !prefill }))
    }

    fn gather(
        &self,
        seqs: &[&Sequence],
        block_tables: &[Vec<BlockId>],
        is_decoding: bool,
    ) -> ForwardInputs {
        let mut input_ids = Vec::new();
        let mut seq_length = Vec::with_capacity(seqs.len());
        for seq in seqs {
            let tokens = seq.token_ids();
            input_ids.extend_from_slice(tokens);
            seq_length.push(if is_decoding { 1 } else { tokens.len() });
        }
        let history_lengths: Vec<usize> = seqs.iter().map(|s| s.history_len()).collect();

        let max_blocks = block_tables.iter().map(|t| t.len()).max().unwrap_or(0);
        let block_offsets: Vec<Vec<BlockId>> = block_tables
            .iter()
            .map(|table| {
                let mut row = table.clone();
                row.resize(max_blocks, BLOCK_PAD);
                row
            })
            .collect();

        let sampling_inputs = SamplingInputs::from_sequences(seqs);
        let all_ids = sampling_inputs
            .needs_all_ids()
            .then(|| seqs.iter().map(|s| s.all_ids().to_vec()).collect());
        let guided_input_ids = sampling_inputs.needs_guided_input_ids().then(|| {
            seqs.iter()
                .map(|s| {
                    let ids = s.all_ids();
                    ids[ids.len() - s.num_new_tokens..].to_vec()
                })
                .collect()
        });

        let num_appendable_ids = seqs
            .iter()
            .map(|s| s.sampling_param.max_new_tokens as i64 - s.num_new_tokens as i64)
            .collect();
        let num_ignore_eos = seqs
            .iter()
            .map(|s| s.sampling_param.min_new_tokens as i64 - s.num_new_tokens as i64)
            .collect();

        let max_q_len = seq_length.iter().copied().max().unwrap_or(0);
        let vision_inputs = self.gather_vision(seqs, &history_lengths, &seq_length, max_q_len);

        ForwardInputs {
            sync_long_context: input_ids.len() > self.cache_config.max_prefill_token_num,
            return_logits: seqs.iter().any(|s| s.return_logits),
            model_metas: seqs.iter().map(|s| s.model_meta.clone()).collect(),
            input_ids,
            seq_length,
            history_lengths,
            block_offsets,
            is_decoding,
            sampling_inputs,
            all_ids,
            guided_input_ids,
            num_appendable_ids,
            num_ignore_eos,
            vision_inputs,
            ..Default::default()
        }
    }

    fn gather_vision(
        &self,
        seqs: &[&Sequence],
        history_lengths: &[usize],
        seq_length: &[usize],
        max_q_len: usize,
    ) -> Option<VisionInputs> {
        let has_embedding = seqs.iter().any(|s| !s.input_embeddings.is_empty());
        let has_multimodal = seqs.iter().any(|s| !s.multimodals.is_empty());
        if !has_embedding && !has_multimodal {
            return None;
        }

        let mut indexing = vec![vec![false; max_q_len]; seqs.len()];
        for (row, seq) in seqs.iter().enumerate() {
            let history = history_lengths[row];
            let q_len = seq_length[row];
            for emb in &seq.input_embeddings {
                // translate global positions into the current batch window
                let start = emb.start.max(history) - history;
                let end = emb.end.min(history + q_len).saturating_sub(history);
                for slot in indexing[row].iter_mut().take(end).skip(start) {
                    *slot = true;
                }
            }
        }

        Some(VisionInputs {
            history_lengths: history_lengths.to_vec(),
            input_embeddings: seqs.iter().map(|s| s.input_embeddings.clone()).collect(),
            input_embedding_ranges: seqs
                .iter()
                .map(|s| s.input_embeddings.iter().map(|e| (e.start, e.end)).collect())
                .collect(),
            input_embedding_indexing: indexing,
            input_multimodals: seqs.iter().map(|s| s.multimodals.clone()).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::sequence::{SamplingParam, SequenceArgs};

    fn setup(engine: &EngineConfig) -> (Scheduler, InputsMaker, AdapterManager) {
        let scheduler = Scheduler::new(SchedulerConfig::from(engine), CacheConfig::from(engine));
        let maker =
            InputsMaker::new(SchedulerConfig::from(engine), CacheConfig::from(engine), engine.dp);
        (scheduler, maker, AdapterManager::default())
    }

    fn config() -> EngineConfig {
        EngineConfig {
            num_gpu_blocks: 32,
            block_size: 4,
            max_batches: 8,
            prefill_interval: 16,
            ..Default::default()
        }
    }

    #[test]
    fn test_prefill_inputs_shape() {
        let engine = config();
        let (mut scheduler, mut maker, adapters) = setup(&engine);
        scheduler.add_session(1).unwrap();
        scheduler
            .add_sequence(1, SequenceArgs { token_ids: vec![1, 2, 3, 4, 5], ..Default::default() })
            .unwrap();
        scheduler.add_session(2).unwrap();
        scheduler
            .add_sequence(2, SequenceArgs { token_ids: vec![7, 8], ..Default::default() })
            .unwrap();

        let (inputs, batch) =
            maker.make_forward_inputs(&mut scheduler, &adapters, true, false).unwrap();
        assert!(!inputs.is_decoding);
        assert_eq!(batch.loop_count, 1);
        assert_eq!(inputs.input_ids, vec![1, 2, 3, 4, 5, 7, 8]);
        assert_eq!(inputs.seq_length, vec![5, 2]);
        assert_eq!(inputs.history_lengths, vec![0, 0]);
        // rows padded to the widest table: 2 blocks vs 1
        assert_eq!(inputs.block_offsets[0].len(), inputs.block_offsets[1].len());
        assert_eq!(*inputs.block_offsets[1].last().unwrap(), BLOCK_PAD);
        // every referenced block is a live device block
        for &id in inputs.block_offsets.iter().flatten().filter(|&&id| id != BLOCK_PAD) {
            assert!(scheduler.block_manager().block(id).ref_count >= 1);
        }
        assert!(inputs.all_ids.is_none());
        assert!(inputs.local_adapter_ids.is_none());
    }

    #[test]
    fn test_decode_inputs_after_prefill() {
        let engine = config();
        let (mut scheduler, mut maker, adapters) = setup(&engine);
        scheduler.add_session(1).unwrap();
        let seq_id = scheduler
            .add_sequence(1, SequenceArgs { token_ids: vec![1, 2, 3], ..Default::default() })
            .unwrap();
        let (_, batch) = maker.make_forward_inputs(&mut scheduler, &adapters, true, false).unwrap();
        scheduler.lock_running(&batch.running);
        let seq = scheduler.sessions.get_seq_mut(seq_id).unwrap();
        seq.update_token_ids(&[9], None);
        seq.num_new_tokens = 1;
        scheduler.unlock_running(&batch.running);

        let (inputs, batch) =
            maker.make_forward_inputs(&mut scheduler, &adapters, false, false).unwrap();
        assert!(inputs.is_decoding);
        assert_eq!(batch.loop_count, 16);
        assert_eq!(inputs.input_ids, vec![9]);
        assert_eq!(inputs.seq_length, vec![1]);
        assert_eq!(inputs.history_lengths, vec![3]);
        assert_eq!(inputs.num_appendable_ids, vec![511]);
    }

    #[test]
    fn test_prefill_falls_back_to_decode() {
        let engine = config();
        let (mut scheduler, mut maker, adapters) = setup(&engine);
        scheduler.add_session(1).unwrap();
        scheduler
            .add_sequence(1, SequenceArgs { token_ids: vec![1, 2], ..Default::default() })
            .unwrap();
        // admit, then ask for prefill again with nothing waiting
        maker.make_forward_inputs(&mut scheduler, &adapters, true, false).unwrap();
        let (inputs, _) =
            maker.make_forward_inputs(&mut scheduler, &adapters, true, false).unwrap();
        assert!(inputs.is_decoding);
    }

    #[test]
    fn test_all_ids_gathered_under_penalty() {
        let engine = config();
        let (mut scheduler, mut maker, adapters) = setup(&engine);
        scheduler.add_session(1).unwrap();
        scheduler
            .add_sequence(
                1,
                SequenceArgs {
                    token_ids: vec![1, 2, 3],
                    sampling_param: SamplingParam {
                        repetition_penalty: 1.3,
                        ..Default::default()
                    },
                    ..Default::default()
                },
            )
            .unwrap();
        let (inputs, _) =
            maker.make_forward_inputs(&mut scheduler, &adapters, true, false).unwrap();
        assert_eq!(inputs.all_ids, Some(vec![vec![1, 2, 3]]));
    }

    #[test]
    fn test_local_adapter_ids_attached() {
        let engine =
            EngineConfig { adapters: vec!["fr".into(), "de".into()], ..config() };
        let (mut scheduler, mut maker, _) = setup(&engine);
        let adapters = AdapterManager::new(engine.adapters.clone());
        scheduler.add_session(1).unwrap();
        scheduler
            .add_sequence(
                1,
                SequenceArgs {
                    token_ids: vec![1, 2],
                    adapter_name: Some("de".into()),
                    ..Default::default()
                },
            )
            .unwrap();

        let (inputs, _) =
            maker.make_forward_inputs(&mut scheduler, &adapters, true, false).unwrap();
        let ids = inputs.local_adapter_ids.unwrap();
        assert_eq!(ids, vec![adapters.get_adapter_id(Some("de"))]);
        // base model keeps id 0, registered adapters resolve above it
        assert_ne!(ids[0], 0);
    }

    #[test]
    fn test_do_prefill_policy() {
        let engine = EngineConfig { max_batches: 4, ..config() };
        let (mut scheduler, maker, _) = setup(&engine);
        assert!(!maker.do_prefill(&scheduler));

        scheduler.add_session(1).unwrap();
        scheduler
            .add_sequence(1, SequenceArgs { token_ids: vec![1], ..Default::default() })
            .unwrap();
        // one waiter, nothing running: pool too thin, prefill
        assert!(maker.do_prefill(&scheduler));
    }

    #[test]
    fn test_vision_indexing_translated() {
        let engine = config();
        let (mut scheduler, mut maker, adapters) = setup(&engine);
        scheduler.add_session(1).unwrap();
        scheduler
            .add_sequence(
                1,
                SequenceArgs {
                    token_ids: vec![1, 2, 3, 4],
                    input_embeddings: vec![InputEmbedding {
                        start: 1,
                        end: 3,
                        embedding: vec![0.0; 8],
                    }],
                    ..Default::default()
                },
            )
            .unwrap();
        let (inputs, _) =
            maker.make_forward_inputs(&mut scheduler, &adapters, true, false).unwrap();
        let vision = inputs.vision_inputs.unwrap();
        assert_eq!(vision.input_embedding_ranges, vec![vec![(1, 3)]]);
        assert_eq!(vision.input_embedding_indexing, vec![vec![false, true, true, false]]);
    }
}
