//! End-to-end engine scenarios against a scripted executor.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_stream::StreamExt;

use ulimi_core::engine::{
    CounterEvent, EngineResponse, Executor, ForwardInputs, ForwardOutput, MigrationExecutionBatch,
    MigrationRequest, ResponseKind, TokenId,
};
use ulimi_core::{AddMessageRequest, Engine, EngineConfig, EngineRole, Error, Result, SamplingParam};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn timestamp() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

enum Behavior {
    /// Emit `last input token + 1`, then keep incrementing per iteration.
    Increment,
    /// Pop tokens off a global script, one per iteration.
    Script(VecDeque<TokenId>),
}

struct Submission {
    last_tokens: Vec<TokenId>,
    iters_left: usize,
}

struct Inner {
    behavior: Behavior,
    pending: VecDeque<Submission>,
    migrations: Vec<MigrationExecutionBatch>,
}

/// Deterministic executor: queues submissions and produces one iteration's
/// output per `get_output_async`, exactly as the engine paces it.
struct ScriptedExecutor {
    inner: Mutex<Inner>,
    delay: Duration,
}

impl ScriptedExecutor {
    fn incrementing() -> Arc<Self> {
        Self::with_behavior(Behavior::Increment, Duration::from_millis(1))
    }

    fn scripted(tokens: &[TokenId]) -> Arc<Self> {
        Self::with_behavior(
            Behavior::Script(tokens.iter().copied().collect()),
            Duration::from_millis(1),
        )
    }

    fn with_behavior(behavior: Behavior, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner { behavior, pending: VecDeque::new(), migrations: Vec::new() }),
            delay,
        })
    }

    async fn migrations(&self) -> Vec<MigrationExecutionBatch> {
        self.inner.lock().await.migrations.clone()
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    fn init(&self) -> Result<()> {
        Ok(())
    }

    fn start(&self, _forward_gate: Arc<CounterEvent>) {}

    fn stop(&self) {}

    fn release(&self) {}

    async fn forward_async(&self, inputs: ForwardInputs) -> Result<()> {
        let mut last_tokens = Vec::new();
        let mut offset = 0;
        for &len in &inputs.seq_length {
            let row = &inputs.input_ids[offset..offset + len];
            last_tokens.push(row.last().copied().unwrap_or(0));
            offset += len;
        }
        let mut inner = self.inner.lock().await;
        inner.pending.push_back(Submission { last_tokens, iters_left: inputs.loop_count });
        Ok(())
    }

    async fn get_output_async(&self) -> Result<ForwardOutput> {
        tokio::time::sleep(self.delay).await;
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let Some(front) = inner.pending.front_mut() else {
            return Ok(ForwardOutput::default());
        };
        front.iters_left -= 1;
        let done = front.iters_left == 0;
        let batch_size = front.last_tokens.len();

        let mut next_token_ids = Vec::with_capacity(batch_size);
        match &mut inner.behavior {
            Behavior::Increment => {
                for last in front.last_tokens.iter_mut() {
                    *last += 1;
                    next_token_ids.push(*last);
                }
            }
            Behavior::Script(script) => {
                for _ in 0..batch_size {
                    match script.pop_front() {
                        Some(token) => next_token_ids.push(token),
                        None => {
                            next_token_ids.clear();
                            break;
                        }
                    }
                }
            }
        }
        if done {
            inner.pending.pop_front();
        }
        if next_token_ids.is_empty() {
            return Ok(ForwardOutput::default());
        }
        Ok(ForwardOutput {
            stopped: vec![false; next_token_ids.len()],
            new_token_timestamp: timestamp(),
            next_token_ids,
            ..Default::default()
        })
    }

    async fn migrate(&self, batch: MigrationExecutionBatch) -> Result<()> {
        self.inner.lock().await.migrations.push(batch);
        Ok(())
    }
}

fn small_config() -> EngineConfig {
    EngineConfig {
        num_gpu_blocks: 16,
        num_cpu_blocks: 4,
        block_size: 2,
        max_batches: 8,
        prefill_interval: 4,
        ..Default::default()
    }
}

async fn collect(
    stream: impl tokio_stream::Stream<Item = EngineResponse>,
) -> Vec<EngineResponse> {
    tokio::time::timeout(Duration::from_secs(30), stream.collect::<Vec<_>>())
        .await
        .expect("generation timed out")
}

fn token_batches(responses: &[EngineResponse]) -> Vec<Vec<TokenId>> {
    responses
        .iter()
        .filter(|r| r.kind == ResponseKind::Success)
        .map(|r| r.data.as_ref().map(|d| d.token_ids.clone()).unwrap_or_default())
        .collect()
}

fn assert_success_star_finish(responses: &[EngineResponse]) {
    assert!(!responses.is_empty());
    let (last, rest) = responses.split_last().unwrap();
    assert_eq!(last.kind, ResponseKind::Finish, "terminal response must be Finish");
    for r in rest {
        assert_eq!(r.kind, ResponseKind::Success);
    }
}

#[tokio::test]
async fn test_single_turn_chat() {
    init_tracing();
    let executor = ScriptedExecutor::scripted(&[5, 6, 7]);
    let engine = Engine::new(executor, small_config()).unwrap();
    let handle = engine.handle();

    assert_eq!(handle.add_session(1).await.unwrap(), ResponseKind::Success);
    let stream = handle
        .generate(AddMessageRequest {
            session_id: 1,
            token_ids: vec![1, 2, 3, 4],
            sampling_param: SamplingParam { max_new_tokens: 3, ..Default::default() },
            ..Default::default()
        })
        .await
        .unwrap();

    let responses = collect(stream).await;
    assert_success_star_finish(&responses);
    assert_eq!(token_batches(&responses), vec![vec![5], vec![6], vec![7]]);

    engine.close();
    engine.join().await;
}

#[tokio::test]
async fn test_prefix_cache_hit_reuses_first_block() {
    init_tracing();
    let executor = ScriptedExecutor::incrementing();
    let config = EngineConfig { enable_prefix_caching: true, ..small_config() };
    let engine = Engine::new(executor, config).unwrap();
    let handle = engine.handle();

    let first_block_of = |responses: &[EngineResponse]| -> u32 {
        responses
            .iter()
            .find_map(|r| r.data.as_ref().and_then(|d| d.cache_block_ids.as_ref()))
            .map(|table| table[0])
            .expect("with_cache response carries a block table")
    };

    handle.add_session(1).await.unwrap();
    let responses = collect(
        handle
            .generate(AddMessageRequest {
                session_id: 1,
                token_ids: vec![10, 11, 12, 13],
                sampling_param: SamplingParam { max_new_tokens: 1, ..Default::default() },
                with_cache: true,
                ..Default::default()
            })
            .await
            .unwrap(),
    )
    .await;
    assert_success_star_finish(&responses);
    let first = first_block_of(&responses);
    handle.end_session(1).await.unwrap();

    handle.add_session(2).await.unwrap();
    let responses = collect(
        handle
            .generate(AddMessageRequest {
                session_id: 2,
                token_ids: vec![10, 11, 99, 99],
                sampling_param: SamplingParam { max_new_tokens: 1, ..Default::default() },
                with_cache: true,
                ..Default::default()
            })
            .await
            .unwrap(),
    )
    .await;
    assert_success_star_finish(&responses);
    let table: Vec<u32> = responses
        .iter()
        .find_map(|r| r.data.as_ref().and_then(|d| d.cache_block_ids.clone()))
        .unwrap();
    // shared prefix block, freshly allocated divergent block
    assert_eq!(table[0], first);
    assert_ne!(table[1], first);

    engine.close();
    engine.join().await;
}

#[tokio::test]
async fn test_backpressure_five_requests_drain() {
    init_tracing();
    let executor = ScriptedExecutor::incrementing();
    let config = EngineConfig {
        num_gpu_blocks: 4,
        num_cpu_blocks: 0,
        block_size: 2,
        max_batches: 8,
        prefill_interval: 4,
        ..Default::default()
    };
    let engine = Engine::new(executor, config).unwrap();

    let mut tasks = Vec::new();
    for i in 0u64..5 {
        let handle = engine.handle();
        tasks.push(tokio::spawn(async move {
            handle.add_session(i).await.unwrap();
            let base = (i as u32 + 1) * 100;
            let responses = handle
                .generate(AddMessageRequest {
                    session_id: i,
                    token_ids: vec![base, base + 1, base + 2, base + 3],
                    sampling_param: SamplingParam { max_new_tokens: 2, ..Default::default() },
                    ..Default::default()
                })
                .await
                .unwrap()
                .collect::<Vec<_>>()
                .await;
            handle.end_session(i).await.unwrap();
            responses
        }));
    }
    let results = tokio::time::timeout(
        Duration::from_secs(30),
        futures::future::join_all(tasks),
    )
    .await
    .expect("requests did not drain");
    for result in results {
        let responses = result.unwrap();
        assert_success_star_finish(&responses);
        let tokens: usize = token_batches(&responses).iter().map(|b| b.len()).sum();
        assert_eq!(tokens, 2);
    }

    engine.close();
    engine.join().await;
}

#[tokio::test]
async fn test_stop_token_with_min_new_tokens() {
    init_tracing();
    let executor = ScriptedExecutor::scripted(&[42, 42, 99]);
    let engine = Engine::new(executor, small_config()).unwrap();
    let handle = engine.handle();

    handle.add_session(1).await.unwrap();
    let responses = collect(
        handle
            .generate(AddMessageRequest {
                session_id: 1,
                token_ids: vec![1, 2],
                sampling_param: SamplingParam {
                    stop_token_ids: vec![42],
                    min_new_tokens: 2,
                    max_new_tokens: 16,
                    ..Default::default()
                },
                ..Default::default()
            })
            .await
            .unwrap(),
    )
    .await;

    assert_success_star_finish(&responses);
    // first 42 below min_new_tokens does not stop; second does; 99 never surfaces
    assert_eq!(token_batches(&responses), vec![vec![42], vec![42]]);

    engine.close();
    engine.join().await;
}

#[tokio::test]
async fn test_disaggregated_migration() {
    init_tracing();
    let executor = ScriptedExecutor::incrementing();
    let config = EngineConfig { role: EngineRole::Decode, ..small_config() };
    let engine = Engine::new(executor.clone(), config).unwrap();
    let handle = engine.handle();

    handle.add_session(1).await.unwrap();
    let responses = collect(
        handle
            .generate(AddMessageRequest {
                session_id: 1,
                // 5 tokens over block_size 2 -> 3 local blocks
                token_ids: vec![1, 2, 3, 4, 5],
                sampling_param: SamplingParam { max_new_tokens: 2, ..Default::default() },
                migration_request: Some(MigrationRequest {
                    protocol: Default::default(),
                    remote_engine_id: 7,
                    remote_session_id: 99,
                    remote_token_id: 42,
                    remote_block_ids: vec![7, 8, 9],
                    is_dummy_prefill: false,
                }),
                ..Default::default()
            })
            .await
            .unwrap(),
    )
    .await;

    assert_success_star_finish(&responses);
    let batches = token_batches(&responses);
    // bootstrap response carries the remote's last token, then decode resumes
    assert_eq!(batches[0], vec![42]);
    assert_eq!(batches[1], vec![43]);

    let migrations = executor.migrations().await;
    assert_eq!(migrations.len(), 1);
    let (remote_engine, pairs) = &migrations[0].requests[0];
    assert_eq!(*remote_engine, 7);
    let remote: Vec<u32> = pairs.iter().map(|(r, _)| *r).collect();
    assert_eq!(remote, vec![7, 8, 9]);
    assert_eq!(pairs.len(), 3);

    engine.close();
    engine.join().await;
}

#[tokio::test]
async fn test_dummy_prefill_skips_transfer() {
    init_tracing();
    let executor = ScriptedExecutor::incrementing();
    let config = EngineConfig { role: EngineRole::Decode, ..small_config() };
    let engine = Engine::new(executor.clone(), config).unwrap();
    let handle = engine.handle();

    handle.add_session(1).await.unwrap();
    let responses = collect(
        handle
            .generate(AddMessageRequest {
                session_id: 1,
                token_ids: Vec::new(),
                sampling_param: SamplingParam { max_new_tokens: 1, ..Default::default() },
                migration_request: Some(MigrationRequest {
                    protocol: Default::default(),
                    remote_engine_id: 7,
                    remote_session_id: 99,
                    remote_token_id: 42,
                    remote_block_ids: Vec::new(),
                    is_dummy_prefill: true,
                }),
                ..Default::default()
            })
            .await
            .unwrap(),
    )
    .await;

    assert_success_star_finish(&responses);
    assert_eq!(token_batches(&responses)[0], vec![42]);
    assert!(executor.migrations().await.is_empty());

    engine.close();
    engine.join().await;
}

#[tokio::test]
async fn test_stop_session_mid_generation() {
    init_tracing();
    let executor =
        ScriptedExecutor::with_behavior(Behavior::Increment, Duration::from_millis(5));
    let engine = Engine::new(executor, small_config()).unwrap();
    let handle = engine.handle();

    handle.add_session(1).await.unwrap();
    let mut stream = Box::pin(
        handle
            .generate(AddMessageRequest {
                session_id: 1,
                token_ids: vec![1, 2],
                sampling_param: SamplingParam { max_new_tokens: 1000, ..Default::default() },
                ..Default::default()
            })
            .await
            .unwrap(),
    );

    // let a couple of tokens through, then cancel
    let mut responses = Vec::new();
    for _ in 0..2 {
        responses.push(
            tokio::time::timeout(Duration::from_secs(10), stream.next())
                .await
                .unwrap()
                .unwrap(),
        );
    }
    assert_eq!(handle.stop_session(1).await.unwrap(), ResponseKind::Success);

    while let Ok(Some(response)) =
        tokio::time::timeout(Duration::from_secs(10), stream.next()).await
    {
        responses.push(response);
    }
    assert_success_star_finish(&responses);
    // well under the configured cap: generation really was cut short
    assert!(token_batches(&responses).len() < 100);

    engine.close();
    engine.join().await;
}

#[tokio::test]
async fn test_multi_turn_session_appends() {
    init_tracing();
    let executor = ScriptedExecutor::incrementing();
    let engine = Engine::new(executor, small_config()).unwrap();
    let handle = engine.handle();

    handle.add_session(1).await.unwrap();
    let responses = collect(
        handle
            .generate(AddMessageRequest {
                session_id: 1,
                token_ids: vec![1, 2],
                sampling_param: SamplingParam { max_new_tokens: 2, ..Default::default() },
                ..Default::default()
            })
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(token_batches(&responses), vec![vec![3], vec![4]]);

    // second turn continues the same sequence
    let responses = collect(
        handle
            .generate(AddMessageRequest {
                session_id: 1,
                token_ids: vec![10],
                sampling_param: SamplingParam { max_new_tokens: 1, ..Default::default() },
                ..Default::default()
            })
            .await
            .unwrap(),
    )
    .await;
    assert_success_star_finish(&responses);
    assert_eq!(token_batches(&responses), vec![vec![11]]);

    engine.close();
    engine.join().await;
}

#[tokio::test]
async fn test_admission_errors() {
    init_tracing();
    let executor = ScriptedExecutor::incrementing();
    let config = EngineConfig { max_session_len: Some(8), ..small_config() };
    let engine = Engine::new(executor, config).unwrap();
    let handle = engine.handle();

    // unknown session
    let responses = collect(
        handle
            .generate(AddMessageRequest {
                session_id: 5,
                token_ids: vec![1],
                ..Default::default()
            })
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(responses[0].kind, ResponseKind::SessionNotExist);

    handle.add_session(1).await.unwrap();
    assert_eq!(handle.add_session(1).await.unwrap(), ResponseKind::SessionRepeat);

    // empty input
    let responses = collect(
        handle
            .generate(AddMessageRequest { session_id: 1, ..Default::default() })
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(responses[0].kind, ResponseKind::InputLengthError);

    // longer than the session cap
    let responses = collect(
        handle
            .generate(AddMessageRequest {
                session_id: 1,
                token_ids: vec![0; 64],
                ..Default::default()
            })
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(responses[0].kind, ResponseKind::InputLengthError);

    engine.close();
    engine.join().await;
}

#[tokio::test]
async fn test_prefill_role_reports_busy_and_preserves_cache() {
    init_tracing();
    let executor = ScriptedExecutor::incrementing();
    let config = EngineConfig {
        role: EngineRole::Prefill,
        num_gpu_blocks: 8,
        num_cpu_blocks: 0,
        block_size: 2,
        max_batches: 8,
        prefill_interval: 4,
        ..Default::default()
    };
    let engine = Engine::new(executor, config).unwrap();
    let handle = engine.handle();

    // 9 tokens -> 5 of the 8 device blocks, kept after finish for migration
    handle.add_session(1).await.unwrap();
    let responses = collect(
        handle
            .generate(AddMessageRequest {
                session_id: 1,
                token_ids: (1..=9).collect(),
                sampling_param: SamplingParam { max_new_tokens: 1, ..Default::default() },
                preserve_cache: true,
                with_cache: true,
                ..Default::default()
            })
            .await
            .unwrap(),
    )
    .await;
    assert_success_star_finish(&responses);

    // second request cannot be backed: the saturated prefill engine says busy
    handle.add_session(2).await.unwrap();
    let responses = collect(
        handle
            .generate(AddMessageRequest {
                session_id: 2,
                token_ids: (20..=28).collect(),
                sampling_param: SamplingParam { max_new_tokens: 1, ..Default::default() },
                ..Default::default()
            })
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(responses.last().unwrap().kind, ResponseKind::Cancel);

    // the remote decode engine claims the cache; a forced end releases it
    assert_eq!(handle.end_session_forced(1).await.unwrap(), ResponseKind::Success);
    handle.add_session(3).await.unwrap();
    let responses = collect(
        handle
            .generate(AddMessageRequest {
                session_id: 3,
                token_ids: (40..=48).collect(),
                sampling_param: SamplingParam { max_new_tokens: 1, ..Default::default() },
                ..Default::default()
            })
            .await
            .unwrap(),
    )
    .await;
    assert_success_star_finish(&responses);

    engine.close();
    engine.join().await;
}

struct FaultyExecutor;

#[async_trait]
impl Executor for FaultyExecutor {
    fn init(&self) -> Result<()> {
        Ok(())
    }
    fn start(&self, _forward_gate: Arc<CounterEvent>) {}
    fn stop(&self) {}
    fn release(&self) {}
    async fn forward_async(&self, _inputs: ForwardInputs) -> Result<()> {
        Ok(())
    }
    async fn get_output_async(&self) -> Result<ForwardOutput> {
        Err(Error::Executor("device lost".into()))
    }
    async fn migrate(&self, _batch: MigrationExecutionBatch) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_executor_fault_drains_with_engine_error() {
    init_tracing();
    let engine = Engine::new(Arc::new(FaultyExecutor), small_config()).unwrap();
    let handle = engine.handle();

    handle.add_session(1).await.unwrap();
    let responses = collect(
        handle
            .generate(AddMessageRequest {
                session_id: 1,
                token_ids: vec![1, 2, 3],
                ..Default::default()
            })
            .await
            .unwrap(),
    )
    .await;
    let last = responses.last().unwrap();
    assert_eq!(last.kind, ResponseKind::InternalEngineError);

    engine.join().await;
}
