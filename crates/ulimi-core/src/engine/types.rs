//! Shared identifier and enum types for the engine core.

use serde::{Deserialize, Serialize};

/// Identifier of a conversational session.
pub type SessionId = u64;

/// Identifier of a sequence (the unit of scheduling).
pub type SeqId = u64;

/// Physical KV block index.
///
/// Device blocks occupy `[0, num_gpu_blocks)`, host blocks
/// `[num_gpu_blocks, num_gpu_blocks + num_cpu_blocks)`.
pub type BlockId = u32;

/// Token id as produced by the tokenizer / sampled by the executor.
pub type TokenId = u32;

/// Identifier of a remote engine instance in disaggregated serving.
pub type EngineId = u64;

/// Sentinel used to right-pad ragged block-offset rows.
pub const BLOCK_PAD: BlockId = BlockId::MAX;

/// Opaque executor-supplied continuation state carried per sequence.
pub type ModelMeta = serde_json::Value;

/// Role of this engine instance in the deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EngineRole {
    /// Prefill and decode on the same instance.
    #[default]
    Hybrid,
    /// Prefill-only instance; finished sequences keep their cache for
    /// migration to a decode instance.
    Prefill,
    /// Decode-only instance; sequences arrive via KV migration.
    Decode,
}

/// Transport used to move KV blocks between engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MigrationBackend {
    #[default]
    DlSlime,
    Mooncake,
    Nixl,
}

/// Wire protocol negotiated for a P2P migration link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TransportProtocol {
    #[default]
    Rdma,
    Nvlink,
    Tcp,
}
