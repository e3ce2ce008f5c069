//! Per-step sequence selection and lifecycle transitions.
//!
//! The scheduler owns the session table and the block manager. Each call to
//! [`Scheduler::schedule`] picks the batch for one forward: FIFO admission of
//! waiting sequences for prefill, or the running pool with block
//! preallocation for decode, evicting to host when the device pool runs dry.

use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::config::{CacheConfig, SchedulerConfig};
use crate::engine::block_manager::{BlockManager, SwapMap};
use crate::engine::metrics::{EnginePhase, SchedulerStats};
use crate::engine::sequence::{SequenceArgs, SequenceStatus, SessionTable};
use crate::engine::types::{BlockId, SeqId, SessionId};
use crate::error::{Error, Result};

/// Batch picked for one forward step.
#[derive(Debug, Default)]
pub struct SchedulerOutput {
    pub running: Vec<SeqId>,
    pub is_prefill: bool,
    pub swap_in_map: SwapMap,
    pub swap_out_map: SwapMap,
}

pub struct Scheduler {
    config: SchedulerConfig,
    pub sessions: SessionTable,
    block_manager: BlockManager,
    waiting: VecDeque<SeqId>,
    running: Vec<SeqId>,
    waiting_migration: VecDeque<SeqId>,
    migration_done: Vec<SeqId>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, cache_config: CacheConfig) -> Self {
        Self {
            config,
            sessions: SessionTable::default(),
            block_manager: BlockManager::new(cache_config),
            waiting: VecDeque::new(),
            running: Vec::new(),
            waiting_migration: VecDeque::new(),
            migration_done: Vec::new(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn block_manager(&self) -> &BlockManager {
        &self.block_manager
    }

    // ---- session control ----

    pub fn add_session(&mut self, session_id: SessionId) -> Result<()> {
        if !self.sessions.add_session(session_id) {
            return Err(Error::SessionRepeat(session_id));
        }
        Ok(())
    }

    /// Create a sequence and queue it for admission.
    pub fn add_sequence(&mut self, session_id: SessionId, args: SequenceArgs) -> Option<SeqId> {
        let migrating = args.migration_request.is_some();
        let seq_id = self.sessions.add_sequence(session_id, args)?;
        let seq = self.sessions.get_seq_mut(seq_id).expect("just added");
        seq.record_event(EnginePhase::Queued);
        if migrating {
            seq.status = SequenceStatus::WaitingMigration;
            self.waiting_migration.push_back(seq_id);
        } else {
            self.waiting.push_back(seq_id);
        }
        Some(seq_id)
    }

    /// Re-queue an existing sequence carrying a follow-up turn.
    pub fn requeue_sequence(&mut self, seq_id: SeqId) {
        if let Some(seq) = self.sessions.get_seq_mut(seq_id) {
            seq.status = SequenceStatus::Waiting;
            seq.num_new_tokens = 0;
            seq.record_event(EnginePhase::Queued);
            self.running.retain(|&id| id != seq_id);
            if !self.waiting.contains(&seq_id) {
                self.waiting.push_back(seq_id);
            }
        }
    }

    /// Stop generation for every sequence of a session, keeping the cache.
    /// A locked sequence finishes its in-flight step; unlock reaps it.
    pub fn stop_session(&mut self, session_id: SessionId) -> Result<()> {
        let Some(session) = self.sessions.get(session_id) else {
            return Err(Error::SessionNotExist(session_id));
        };
        let seq_ids: Vec<SeqId> = session.sequences.keys().copied().collect();
        for seq_id in seq_ids {
            let seq = self.sessions.get_seq_mut(seq_id).expect("indexed");
            let status = seq.status;
            seq.status = SequenceStatus::Stopped;
            match status {
                SequenceStatus::Waiting => self.waiting.retain(|&id| id != seq_id),
                SequenceStatus::Running => self.running.retain(|&id| id != seq_id),
                SequenceStatus::WaitingMigration => {
                    self.waiting_migration.retain(|&id| id != seq_id)
                }
                // locked sequences are reaped on unlock
                _ => {}
            }
        }
        Ok(())
    }

    /// Destroy a session and release its blocks. With `force == false` a
    /// preserve-cache sequence parks in `ToBeMigrated` instead and the
    /// session survives until the remote decode engine claims the blocks.
    pub fn end_session(&mut self, session_id: SessionId, force: bool) -> Result<()> {
        let Some(session) = self.sessions.get(session_id) else {
            return Err(Error::SessionNotExist(session_id));
        };
        if !force {
            let preserving: Vec<SeqId> = session
                .sequences
                .values()
                .filter(|s| s.preserve_cache && s.status != SequenceStatus::ToBeMigrated)
                .map(|s| s.seq_id)
                .collect();
            if !preserving.is_empty() {
                for seq_id in preserving {
                    self.detach_from_queues(seq_id);
                    if let Some(seq) = self.sessions.get_seq_mut(seq_id) {
                        seq.status = SequenceStatus::ToBeMigrated;
                    }
                }
                debug!(session_id, "end_session deferred, cache preserved for migration");
                return Ok(());
            }
        }
        let seq_ids = self.sessions.remove_session(session_id);
        for seq_id in seq_ids {
            self.detach_from_queues(seq_id);
            self.block_manager.free(seq_id);
        }
        Ok(())
    }

    fn detach_from_queues(&mut self, seq_id: SeqId) {
        self.waiting.retain(|&id| id != seq_id);
        self.running.retain(|&id| id != seq_id);
        self.waiting_migration.retain(|&id| id != seq_id);
        self.migration_done.retain(|&id| id != seq_id);
    }

    // ---- queue introspection ----

    pub fn has_waiting(&self) -> bool {
        !self.waiting.is_empty()
    }

    pub fn has_running(&self) -> bool {
        !self.running.is_empty()
    }

    pub fn has_migration_waiting(&self) -> bool {
        !self.waiting_migration.is_empty()
    }

    pub fn has_unfinished(&self) -> bool {
        self.has_waiting()
            || self.has_running()
            || self.has_migration_waiting()
            || !self.migration_done.is_empty()
    }

    pub fn num_waiting(&self) -> usize {
        self.waiting.len()
    }

    pub fn num_running(&self) -> usize {
        self.running.len()
    }

    // ---- step scheduling ----

    pub fn schedule(&mut self, is_prefill: bool, prealloc_size: usize) -> SchedulerOutput {
        if is_prefill {
            self.schedule_prefill()
        } else {
            self.schedule_decode(prealloc_size)
        }
    }

    fn schedule_prefill(&mut self) -> SchedulerOutput {
        let mut output = SchedulerOutput { is_prefill: true, ..Default::default() };
        let block_budget = self
            .block_manager
            .config()
            .max_prefill_token_num
            .div_ceil(self.block_manager.config().block_size);
        let mut used_blocks = 0usize;

        while let Some(&seq_id) = self.waiting.front() {
            // admitted sequences join `running` as they are accepted
            if self.running.len() >= self.config.max_batches {
                break;
            }
            let Some(seq) = self.sessions.get_seq(seq_id) else {
                self.waiting.pop_front();
                continue;
            };
            let required_total = self.block_manager.num_required_blocks(seq.num_all_ids());
            if used_blocks + required_total > block_budget && !output.running.is_empty() {
                break;
            }
            let prompt = seq.all_ids().to_vec();

            // swapped-out sequence: bring its blocks back first
            if self.block_manager.can_swap_in(seq_id) {
                let map = self.block_manager.swap_in(seq_id).expect("checked");
                output.swap_in_map.extend(map);
            }

            if self.block_manager.get_block_table(seq_id).map_or(true, |t| t.is_empty()) {
                self.block_manager.match_prefix(seq_id, &prompt);
            }
            let have = self.block_manager.get_block_table(seq_id).map_or(0, |t| t.len());
            let need = required_total.saturating_sub(have);

            if !self.block_manager.can_allocate(need) {
                // try to make room by evicting blocks of other waiters
                let map = self.evict_waiting(need, seq_id);
                output.swap_out_map.extend(map);
            }
            if self.block_manager.allocate(seq_id, need).is_err() {
                debug!(seq_id, need, "prefill admission blocked, cache exhausted");
                break;
            }

            self.waiting.pop_front();
            let seq = self.sessions.get_seq_mut(seq_id).expect("indexed");
            seq.status = SequenceStatus::Running;
            seq.record_event(EnginePhase::Scheduled);
            self.running.push(seq_id);
            output.running.push(seq_id);
            used_blocks += required_total;
        }
        output
    }

    fn schedule_decode(&mut self, prealloc_size: usize) -> SchedulerOutput {
        let mut output = SchedulerOutput::default();
        let candidates: Vec<SeqId> = self
            .running
            .iter()
            .copied()
            .filter(|&id| {
                self.sessions
                    .get_seq(id)
                    .is_some_and(|s| matches!(s.status, SequenceStatus::Running))
            })
            .take(self.config.max_batches)
            .collect();

        for seq_id in candidates {
            let Some(seq) = self.sessions.get_seq(seq_id) else {
                continue;
            };
            // an earlier candidate's eviction may have demoted this one
            if seq.status != SequenceStatus::Running {
                continue;
            }
            let num_all = seq.num_all_ids();
            let num_filled = seq.history_len();

            // reserve room for `prealloc_size` future tokens; settle for the
            // next token alone when the pool is tight
            if self.block_manager.append_slots(seq_id, num_filled, num_all + prealloc_size).is_ok()
            {
                output.running.push(seq_id);
                continue;
            }
            loop {
                match self.block_manager.append_slots(seq_id, num_filled, num_all + 1) {
                    Ok(()) => {
                        output.running.push(seq_id);
                        break;
                    }
                    Err(_) => {
                        let evicted = self.evict_lowest_priority(seq_id, &mut output.swap_out_map);
                        if !evicted {
                            // no victim left: drop this sequence back to waiting
                            warn!(seq_id, "decode reservation failed, demoting to waiting");
                            self.demote_to_waiting(seq_id);
                            break;
                        }
                    }
                }
            }
        }
        output
    }

    /// Swap out blocks of other waiting sequences until `need` device blocks
    /// are free. Least recently admitted waiters go first.
    fn evict_waiting(&mut self, need: usize, protect: SeqId) -> SwapMap {
        let mut map = SwapMap::new();
        let victims: Vec<SeqId> = self.waiting.iter().rev().copied().collect();
        for victim in victims {
            if self.block_manager.can_allocate(need) {
                break;
            }
            if victim == protect || !self.block_manager.can_swap_out(victim) {
                continue;
            }
            if let Ok(swapped) = self.block_manager.swap_out(victim) {
                map.extend(swapped);
            }
        }
        map
    }

    /// Evict the lowest-priority running sequence (latest admitted, FIFO
    /// tie-break): swap its blocks to host, or free them for recompute when
    /// no host capacity exists. Returns false when nothing was evictable.
    fn evict_lowest_priority(&mut self, protect: SeqId, swap_out_map: &mut SwapMap) -> bool {
        let victim = self.running.iter().rev().copied().find(|&id| {
            id != protect
                && self
                    .sessions
                    .get_seq(id)
                    .is_some_and(|s| s.status == SequenceStatus::Running)
        });
        let Some(victim) = victim else {
            return false;
        };
        if self.block_manager.can_swap_out(victim) {
            let map = self.block_manager.swap_out(victim).expect("checked");
            debug!(victim, "evicted running sequence to host");
            swap_out_map.extend(map);
        } else {
            debug!(victim, "no host capacity, freeing victim for recompute");
            self.block_manager.free(victim);
            if let Some(seq) = self.sessions.get_seq_mut(victim) {
                seq.reset_history();
            }
        }
        self.demote_to_waiting(victim);
        true
    }

    fn demote_to_waiting(&mut self, seq_id: SeqId) {
        self.running.retain(|&id| id != seq_id);
        if let Some(seq) = self.sessions.get_seq_mut(seq_id) {
            seq.status = SequenceStatus::Waiting;
        }
        // demoted sequences re-admit ahead of fresh arrivals
        self.waiting.push_front(seq_id);
    }

    // ---- forward locking ----

    pub fn lock_running(&mut self, seq_ids: &[SeqId]) {
        for &seq_id in seq_ids {
            if let Some(seq) = self.sessions.get_seq_mut(seq_id) {
                if seq.status == SequenceStatus::Running {
                    seq.status = SequenceStatus::Locked;
                }
            }
        }
    }

    /// Unlock a batch after its pipeline drains: live sequences return to the
    /// running pool, finished ones are reaped and full blocks become
    /// prefix-cache candidates.
    pub fn unlock_running(&mut self, seq_ids: &[SeqId]) {
        for &seq_id in seq_ids {
            let Some(seq) = self.sessions.get_seq_mut(seq_id) else {
                continue;
            };
            if seq.status == SequenceStatus::Locked {
                seq.status = SequenceStatus::Running;
            }
            let status = seq.status;
            let all_ids = seq.all_ids().to_vec();
            self.block_manager.cache_full_blocks(seq_id, &all_ids);
            if matches!(status, SequenceStatus::Stopped | SequenceStatus::ToBeMigrated) {
                self.running.retain(|&id| id != seq_id);
            }
        }
    }

    // ---- migration ----

    /// Allocate local blocks for migration-waiting sequences, FIFO. A
    /// sequence that cannot be backed stays queued.
    pub fn schedule_migration(&mut self) -> Vec<SeqId> {
        let mut scheduled = Vec::new();
        while let Some(&seq_id) = self.waiting_migration.front() {
            let Some(seq) = self.sessions.get_seq(seq_id) else {
                self.waiting_migration.pop_front();
                continue;
            };
            let need = self.block_manager.num_required_blocks(seq.num_all_ids().max(1));
            let have = self.block_manager.get_block_table(seq_id).map_or(0, |t| t.len());
            if self.block_manager.allocate(seq_id, need.saturating_sub(have)).is_err() {
                break;
            }
            self.waiting_migration.pop_front();
            scheduled.push(seq_id);
        }
        scheduled
    }

    pub fn lock_running_migration(&mut self, seq_ids: &[SeqId]) {
        for &seq_id in seq_ids {
            if let Some(seq) = self.sessions.get_seq_mut(seq_id) {
                seq.status = SequenceStatus::MigrationLocked;
                seq.record_event(EnginePhase::MigrationBegin);
            }
        }
    }

    /// Migrated sequences stage in `migration_done` until the main loop
    /// collects them into the running pool.
    pub fn unlock_running_migration(&mut self, seq_ids: &[SeqId]) {
        for &seq_id in seq_ids {
            if let Some(seq) = self.sessions.get_seq_mut(seq_id) {
                if seq.status == SequenceStatus::MigrationLocked {
                    seq.status = SequenceStatus::Running;
                    seq.record_event(EnginePhase::MigrationDone);
                    self.migration_done.push(seq_id);
                }
            }
        }
    }

    pub fn collect_migration_done(&mut self) {
        for seq_id in std::mem::take(&mut self.migration_done) {
            if !self.running.contains(&seq_id) {
                self.running.push(seq_id);
            }
        }
    }

    /// Drop every admission-blocked waiter, freeing whatever blocks it
    /// already pinned. Used by the prefill role to signal busy upstream.
    pub fn cancel_waiting(&mut self) -> Vec<SeqId> {
        let cancelled: Vec<SeqId> = self.waiting.drain(..).collect();
        for &seq_id in &cancelled {
            if let Some(seq) = self.sessions.get_seq_mut(seq_id) {
                seq.status = SequenceStatus::Stopped;
            }
            self.block_manager.free(seq_id);
        }
        cancelled
    }

    /// Fatal per-sequence migration failure: drop the sequence, free blocks.
    pub fn fail_migration(&mut self, seq_id: SeqId) {
        if let Some(seq) = self.sessions.get_seq_mut(seq_id) {
            seq.status = SequenceStatus::Stopped;
        }
        self.detach_from_queues(seq_id);
        self.block_manager.free(seq_id);
    }

    // ---- inputs & stats ----

    pub fn get_block_tables(&self, seq_ids: &[SeqId]) -> Vec<Vec<BlockId>> {
        seq_ids
            .iter()
            .map(|&id| self.block_manager.get_block_table(id).map_or(Vec::new(), |t| t.to_vec()))
            .collect()
    }

    pub fn make_stats(&self) -> SchedulerStats {
        let num_locked = self
            .running
            .iter()
            .filter(|&&id| {
                self.sessions.get_seq(id).is_some_and(|s| s.status == SequenceStatus::Locked)
            })
            .count();
        SchedulerStats {
            num_waiting: self.waiting.len(),
            num_running: self.running.len(),
            num_locked,
            free_gpu_blocks: self.block_manager.num_free_gpu_blocks(),
            total_gpu_blocks: self.block_manager.num_gpu_blocks(),
        }
    }
}
