//! Error types for the ulimi engine core.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Empty input is not allowed")]
    EmptyInput,

    #[error("Input length {got} exceeds max session len {max}")]
    InputTooLong { got: usize, max: usize },

    #[error("Session {0} already exists")]
    SessionRepeat(u64),

    #[error("Session {0} does not exist")]
    SessionNotExist(u64),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Executor error: {0}")]
    Executor(String),

    #[error("Migration block count mismatch: {remote} remote vs {local} local")]
    MigrationBlockMismatch { remote: usize, local: usize },

    #[error("Migration transport error: {0}")]
    MigrationTransport(#[from] anyhow::Error),

    #[error("Engine loop is not running")]
    EngineStopped,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Transient inability to allocate KV blocks.
///
/// Not an [`Error`]: cache exhaustion is backpressure, the sequence stays
/// waiting and the engine keeps serving. Only executor faults escalate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfCache {
    pub requested: usize,
    pub free: usize,
}

impl std::fmt::Display for OutOfCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "out of cache: requested {} blocks, {} free", self.requested, self.free)
    }
}
