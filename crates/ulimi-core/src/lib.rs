//! Ulimi Core - LLM Inference Engine Orchestration
//!
//! This crate provides the core of an LLM inference server: the request
//! scheduler and paged KV-cache orchestration loop driving a token-generation
//! executor.
//!
//! # Architecture
//!
//! The engine follows vLLM-style paged attention patterns with:
//! - Continuous batching with interleaved prefill/decode scheduling
//! - Paged KV-cache management with prefix reuse and host/device swap
//! - A pipelined asynchronous engine loop (preprocess, forward, response,
//!   migration activities under one supervisor)
//! - Disaggregated prefill/decode serving via block-level KV migration
//!
//! The numerical executor, tokenizer and any client wire protocol are
//! external collaborators behind the [`engine::Executor`] trait and the
//! request mailbox.
//!
//! # Example
//!
//! ```ignore
//! use ulimi_core::{Engine, EngineConfig, AddMessageRequest};
//!
//! let engine = Engine::new(executor, EngineConfig::default())?;
//! let handle = engine.handle();
//!
//! handle.add_session(1).await?;
//! let mut stream = handle.generate(AddMessageRequest {
//!     session_id: 1,
//!     token_ids: prompt,
//!     ..Default::default()
//! }).await?;
//! ```

pub mod config;
pub mod engine;
pub mod error;

pub use config::{CacheConfig, EngineConfig, SchedulerConfig};
pub use engine::{
    AddMessageRequest, BlockManager, Engine, EngineResponse, EngineRole, Executor, ForwardInputs,
    ForwardOutput, InferOutput, InputProcessor, MigrationRequest, RequestSender, ResponseKind,
    SamplingParam, Scheduler, SequenceStatus,
};
pub use error::{Error, OutOfCache, Result};
