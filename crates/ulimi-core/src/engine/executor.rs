//! Contract presented by the model executor.
//!
//! The executor owns device memory, streams and all tensor math; the core
//! only submits [`ForwardInputs`](crate::engine::inputs::ForwardInputs) and
//! consumes batched outputs through an asynchronous queue interface.

use std::sync::Arc;

use async_trait::async_trait;

use crate::engine::events::CounterEvent;
use crate::engine::input_processor::InputProcessor;
use crate::engine::inputs::ForwardInputs;
use crate::engine::migration::MigrationExecutionBatch;
use crate::engine::types::{ModelMeta, TokenId};
use crate::error::Result;

/// One iteration's worth of executor output.
#[derive(Debug, Clone, Default)]
pub struct ForwardOutput {
    /// One sampled token per batch row.
    pub next_token_ids: Vec<TokenId>,
    /// Raw logits per batch row, present only when requested.
    pub logits: Option<Vec<Vec<f32>>>,
    /// Sampler-side stop decision per batch row.
    pub stopped: Vec<bool>,
    /// Opaque continuation state per batch row.
    pub model_metas: Option<Vec<Option<ModelMeta>>>,
    /// Seconds since the Unix epoch at sampling time.
    pub new_token_timestamp: f64,
}

impl ForwardOutput {
    pub fn is_empty(&self) -> bool {
        self.next_token_ids.is_empty()
    }
}

/// Asynchronous executor interface consumed by the engine loop.
///
/// `forward_async` is fire-and-forget submission; `get_output_async` yields
/// one iteration's results. Any error returned here is fatal: the supervisor
/// cancels all activities and tears the engine down.
#[async_trait]
pub trait Executor: Send + Sync {
    fn init(&self) -> Result<()>;

    /// Hand the executor the forward gate it may use to pace submissions.
    fn start(&self, forward_gate: Arc<CounterEvent>);

    fn stop(&self);

    /// Release device memory and close side channels.
    fn release(&self);

    async fn forward_async(&self, inputs: ForwardInputs) -> Result<()>;

    async fn get_output_async(&self) -> Result<ForwardOutput>;

    /// Move KV blocks from remote engines into local blocks, pair-wise.
    async fn migrate(&self, batch: MigrationExecutionBatch) -> Result<()>;

    fn get_input_processor(&self) -> Option<Arc<dyn InputProcessor>> {
        None
    }

    /// Live parameter update passthrough.
    fn update_params(&self, _request: serde_json::Value) -> Result<()> {
        Ok(())
    }
}
