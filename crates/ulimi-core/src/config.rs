//! Configuration types for the ulimi engine core.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::engine::types::{EngineRole, MigrationBackend};
use crate::error::{Error, Result};

/// Main engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Identity of this engine instance in a disaggregated deployment
    #[serde(default)]
    pub engine_id: u64,

    /// Hard cap on simultaneously scheduled sequences
    #[serde(default = "default_max_batches")]
    pub max_batches: usize,

    /// Inclusive cap on history + generated tokens per session.
    /// `None` derives the cap from the device pool size.
    #[serde(default)]
    pub max_session_len: Option<usize>,

    /// Decode iterations between scheduler interventions
    #[serde(default = "default_prefill_interval")]
    pub prefill_interval: usize,

    /// Tokens per KV block
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    /// Device block pool size
    #[serde(default = "default_num_gpu_blocks")]
    pub num_gpu_blocks: usize,

    /// Host block pool size
    #[serde(default = "default_num_cpu_blocks")]
    pub num_cpu_blocks: usize,

    /// Fraction of free memory reserved for KV cache
    #[serde(default = "default_cache_max_entry_count")]
    pub cache_max_entry_count: f64,

    /// Token count above which prefill is chunked by the executor
    #[serde(default = "default_max_prefill_token_num")]
    pub max_prefill_token_num: usize,

    /// Reuse KV blocks between sequences sharing a prompt prefix
    #[serde(default)]
    pub enable_prefix_caching: bool,

    /// KV quantisation policy: 0 (none), 4 or 8 bits
    #[serde(default)]
    pub quant_policy: u8,

    /// Role of this instance in the deployment
    #[serde(default)]
    pub role: EngineRole,

    /// Transport for disaggregated KV migration
    #[serde(default)]
    pub migration_backend: MigrationBackend,

    /// Data parallel width
    #[serde(default = "default_parallel")]
    pub dp: usize,

    /// Tensor parallel width
    #[serde(default = "default_parallel")]
    pub tp: usize,

    /// Expert parallel width
    #[serde(default = "default_parallel")]
    pub ep: usize,

    /// Registered LoRA adapter names; sequences select one via
    /// `adapter_name` and batches carry the resolved dense ids
    #[serde(default)]
    pub adapters: Vec<String>,

    /// Deliver the final sampled token of a migration bootstrap step instead
    /// of suppressing it. The upstream behaviour suppresses the token; this
    /// flag flips delivery on.
    #[serde(default)]
    pub deliver_final_migration_token: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine_id: 0,
            max_batches: default_max_batches(),
            max_session_len: None,
            prefill_interval: default_prefill_interval(),
            block_size: default_block_size(),
            num_gpu_blocks: default_num_gpu_blocks(),
            num_cpu_blocks: default_num_cpu_blocks(),
            cache_max_entry_count: default_cache_max_entry_count(),
            max_prefill_token_num: default_max_prefill_token_num(),
            enable_prefix_caching: false,
            quant_policy: 0,
            role: EngineRole::Hybrid,
            migration_backend: MigrationBackend::DlSlime,
            dp: 1,
            tp: 1,
            ep: 1,
            adapters: Vec::new(),
            deliver_final_migration_token: false,
        }
    }
}

fn default_max_batches() -> usize {
    128
}

fn default_prefill_interval() -> usize {
    16
}

fn default_block_size() -> usize {
    64
}

fn default_num_gpu_blocks() -> usize {
    1024
}

fn default_num_cpu_blocks() -> usize {
    256
}

fn default_cache_max_entry_count() -> f64 {
    0.8
}

fn default_max_prefill_token_num() -> usize {
    4096
}

fn default_parallel() -> usize {
    1
}

impl EngineConfig {
    /// Load a configuration from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_batches == 0 {
            return Err(Error::Config("max_batches must be positive".into()));
        }
        if self.block_size == 0 {
            return Err(Error::Config("block_size must be positive".into()));
        }
        if self.num_gpu_blocks == 0 {
            return Err(Error::Config("num_gpu_blocks must be positive".into()));
        }
        if self.prefill_interval == 0 {
            return Err(Error::Config("prefill_interval must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.cache_max_entry_count) || self.cache_max_entry_count == 0.0 {
            return Err(Error::Config("cache_max_entry_count must be in (0, 1]".into()));
        }
        if !matches!(self.quant_policy, 0 | 4 | 8) {
            return Err(Error::Config(format!("unsupported quant_policy {}", self.quant_policy)));
        }
        if self.dp == 0 || self.tp == 0 || self.ep == 0 {
            return Err(Error::Config("parallel widths must be positive".into()));
        }
        Ok(())
    }

    /// Effective session length cap: the configured value clamped to what the
    /// device pool can hold, minus one block of slack for the running tail.
    pub fn effective_max_session_len(&self) -> usize {
        let pool_tokens = self.num_gpu_blocks * self.block_size;
        let cap = match self.max_session_len {
            Some(len) => len.min(pool_tokens),
            None => pool_tokens,
        };
        cap.saturating_sub(self.block_size)
    }
}

/// Scheduler-facing view of the engine configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_batches: usize,
    pub max_session_len: usize,
    pub prefill_interval: usize,
}

impl From<&EngineConfig> for SchedulerConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_batches: config.max_batches,
            max_session_len: config.effective_max_session_len(),
            prefill_interval: config.prefill_interval,
        }
    }
}

/// Cache-facing view of the engine configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub block_size: usize,
    pub num_gpu_blocks: usize,
    pub num_cpu_blocks: usize,
    pub cache_max_entry_count: f64,
    pub max_prefill_token_num: usize,
    pub enable_prefix_caching: bool,
    pub quant_policy: u8,
    pub role: EngineRole,
    pub migration_backend: MigrationBackend,
}

impl From<&EngineConfig> for CacheConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            block_size: config.block_size,
            num_gpu_blocks: config.num_gpu_blocks,
            num_cpu_blocks: config.num_cpu_blocks,
            cache_max_entry_count: config.cache_max_entry_count,
            max_prefill_token_num: config.max_prefill_token_num,
            enable_prefix_caching: config.enable_prefix_caching,
            quant_policy: config.quant_policy,
            role: config.role,
            migration_backend: config.migration_backend,
        }
    }
}

impl CacheConfig {
    /// Number of blocks needed to back `num_tokens` tokens.
    pub fn blocks_for_tokens(&self, num_tokens: usize) -> usize {
        num_tokens.div_ceil(self.block_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_quant_policy() {
        let config = EngineConfig { quant_policy: 2, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_effective_max_session_len() {
        let config = EngineConfig {
            num_gpu_blocks: 8,
            block_size: 16,
            max_session_len: Some(1000),
            ..Default::default()
        };
        // pool holds 128 tokens, minus one block of slack
        assert_eq!(config.effective_max_session_len(), 112);

        let config = EngineConfig { max_session_len: Some(64), ..config };
        assert_eq!(config.effective_max_session_len(), 48);
    }

    #[test]
    fn test_from_toml() {
        let text = r#"
            max_batches = 4
            block_size = 16
            enable_prefix_caching = true
            role = "Decode"
        "#;
        let config: EngineConfig = toml::from_str(text).unwrap();
        assert_eq!(config.max_batches, 4);
        assert!(config.enable_prefix_caching);
        assert_eq!(config.role, crate::engine::types::EngineRole::Decode);
        assert_eq!(config.prefill_interval, 16);
    }
}
