//! Engine core: scheduling, paging and the orchestration loop.

pub mod adapter;
pub mod block_manager;
pub mod core;
pub mod events;
pub mod executor;
pub mod input_processor;
pub mod inputs;
pub mod metrics;
pub mod migration;
pub mod request;
pub mod sampling;
pub mod scheduler;
pub mod sequence;
pub mod types;

pub use adapter::AdapterManager;
pub use block_manager::{Block, BlockLocation, BlockManager, SwapMap};
pub use self::core::{Engine, InferOutput};
pub use events::{CounterEvent, Event, RunableEvent};
pub use executor::{Executor, ForwardOutput};
pub use input_processor::{InputProcessor, InputProcessorRegistry, ProcessedInput};
pub use inputs::{ForwardInputs, InputsMaker, PreparedBatch, VisionInputs};
pub use metrics::{EngineEvent, EnginePhase, MetricsInfo, SchedulerStats};
pub use migration::{
    EngineConnection, InProcessSideChannel, MigrationConnectionRequest, MigrationDropRequest,
    MigrationExecutionBatch, MigrationHandshake, MigrationInitRequest, MigrationRequest,
    MigrationSideChannel, ReleaseNotice,
};
pub use request::{
    AddMessageRequest, EngineRequest, EngineResponse, RequestManager, RequestSender, ResponseData,
    ResponseKind, ResponseSender,
};
pub use sampling::SamplingInputs;
pub use scheduler::{Scheduler, SchedulerOutput};
pub use sequence::{
    InputEmbedding, MultiModalInput, ResponseFormat, SamplingParam, Sequence, SequenceArgs,
    SequenceStatus, Session, SessionTable,
};
pub use types::{
    BlockId, EngineId, EngineRole, MigrationBackend, ModelMeta, SeqId, SessionId, TokenId,
    TransportProtocol, BLOCK_PAD,
};
