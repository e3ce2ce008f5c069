//! Batched sampling descriptor assembled once per step.
//!
//! Per-sequence sampling parameters are gathered into column vectors the
//! executor's sampler consumes directly. Columns that are uniformly at their
//! sentinel default collapse to `None` so the executor can skip the work.

use serde::{Deserialize, Serialize};

use crate::engine::sequence::{ResponseFormat, Sequence};
use crate::engine::types::TokenId;

/// Batched sampling parameters for one forward step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SamplingInputs {
    /// 1.0 = neutral.
    pub temperature: Vec<f32>,
    /// 0 = disabled.
    pub top_k: Vec<u32>,
    pub top_p: Vec<f32>,
    /// `None` when every sequence uses penalty 1.0.
    pub repetition_penalty: Option<Vec<f32>>,
    pub stop_token_ids: Vec<Vec<TokenId>>,
    pub ignore_eos: Vec<bool>,
    /// `None` when no sequence requests structured output.
    pub response_formats: Option<Vec<Option<ResponseFormat>>>,
    pub logits_processors: Vec<Vec<String>>,
}

impl SamplingInputs {
    pub fn from_sequences(seqs: &[&Sequence]) -> Self {
        let temperature = seqs.iter().map(|s| s.sampling_param.temperature).collect();
        let top_k = seqs.iter().map(|s| s.sampling_param.top_k).collect();
        let top_p = seqs.iter().map(|s| s.sampling_param.top_p).collect();

        let penalties: Vec<f32> =
            seqs.iter().map(|s| s.sampling_param.repetition_penalty).collect();
        let repetition_penalty =
            if penalties.iter().any(|&p| p != 1.0) { Some(penalties) } else { None };

        let formats: Vec<Option<ResponseFormat>> =
            seqs.iter().map(|s| s.sampling_param.response_format.clone()).collect();
        let response_formats = if formats.iter().any(|f| f.is_some()) { Some(formats) } else { None };

        Self {
            temperature,
            top_k,
            top_p,
            repetition_penalty,
            stop_token_ids: seqs.iter().map(|s| s.sampling_param.stop_token_ids.clone()).collect(),
            ignore_eos: seqs.iter().map(|s| s.sampling_param.ignore_eos).collect(),
            response_formats,
            logits_processors: seqs
                .iter()
                .map(|s| s.sampling_param.logits_processors.clone())
                .collect(),
        }
    }

    pub fn has_logits_processors(&self) -> bool {
        self.logits_processors.iter().any(|p| !p.is_empty())
    }

    /// Whether the expensive full-history gather is required this step.
    pub fn needs_all_ids(&self) -> bool {
        self.repetition_penalty.is_some() || self.has_logits_processors()
    }

    pub fn needs_guided_input_ids(&self) -> bool {
        self.response_formats.is_some()
    }
}
