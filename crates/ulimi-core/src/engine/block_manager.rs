//! Paged KV block manager.
//!
//! Owns the physical block pools and every mapping the scheduler needs:
//! - Device and host pools with LIFO free lists, so recently freed blocks are
//!   reused first and stay warm for prefix matches
//! - Per-sequence block tables (logical position -> physical block)
//! - Reference counts for blocks shared across sequences
//! - A global prefix table (chained xxh64 -> block) for prompt reuse
//! - Device <-> host swap maps consumed by the executor

use std::collections::HashMap;

use tracing::debug;
use xxhash_rust::xxh64::xxh64;

use crate::config::CacheConfig;
use crate::engine::types::{BlockId, SeqId, TokenId};
use crate::error::OutOfCache;

/// Residency of a physical block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockLocation {
    Device,
    Host,
    Free,
}

/// A physical KV slot of `block_size` tokens per layer.
#[derive(Debug, Clone)]
pub struct Block {
    pub id: BlockId,
    pub ref_count: usize,
    /// Chained prefix hash of the tokens this block holds, when cached.
    pub last_hash: Option<u64>,
    pub location: BlockLocation,
}

impl Block {
    fn new(id: BlockId) -> Self {
        Self { id, ref_count: 0, last_hash: None, location: BlockLocation::Free }
    }
}

/// Source -> destination block pairs for one swap direction.
pub type SwapMap = HashMap<BlockId, BlockId>;

struct PrefixEntry {
    block: BlockId,
    /// Tokens backing the hash, compared on hit before reuse.
    tokens: Vec<TokenId>,
}

/// Physical block pool, allocation, reference counting, prefix reuse and
/// host/device swap.
pub struct BlockManager {
    config: CacheConfig,
    blocks: Vec<Block>,
    /// LIFO free stacks.
    free_device: Vec<BlockId>,
    free_host: Vec<BlockId>,
    block_tables: HashMap<SeqId, Vec<BlockId>>,
    prefix_table: HashMap<u64, PrefixEntry>,
}

impl BlockManager {
    pub fn new(config: CacheConfig) -> Self {
        let num_total = config.num_gpu_blocks + config.num_cpu_blocks;
        let blocks: Vec<Block> = (0..num_total).map(|id| Block::new(id as BlockId)).collect();
        // LIFO: block 0 ends up on top of the device stack
        let free_device: Vec<BlockId> = (0..config.num_gpu_blocks).rev().map(|id| id as BlockId).collect();
        let free_host: Vec<BlockId> =
            (config.num_gpu_blocks..num_total).rev().map(|id| id as BlockId).collect();
        Self {
            config,
            blocks,
            free_device,
            free_host,
            block_tables: HashMap::new(),
            prefix_table: HashMap::new(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id as usize]
    }

    pub fn num_free_gpu_blocks(&self) -> usize {
        self.free_device.len()
    }

    pub fn num_free_cpu_blocks(&self) -> usize {
        self.free_host.len()
    }

    pub fn num_gpu_blocks(&self) -> usize {
        self.config.num_gpu_blocks
    }

    /// Blocks needed to back `num_tokens` tokens.
    pub fn num_required_blocks(&self, num_tokens: usize) -> usize {
        self.config.blocks_for_tokens(num_tokens)
    }

    pub fn can_allocate(&self, num_blocks: usize) -> bool {
        self.free_device.len() >= num_blocks
    }

    pub fn get_block_table(&self, seq_id: SeqId) -> Option<&[BlockId]> {
        self.block_tables.get(&seq_id).map(|v| v.as_slice())
    }

    /// Pop one device block, invalidating any stale prefix entry it carried.
    fn pop_device_block(&mut self) -> Option<BlockId> {
        let id = self.free_device.pop()?;
        let block = &mut self.blocks[id as usize];
        if let Some(hash) = block.last_hash.take() {
            if self.prefix_table.get(&hash).is_some_and(|e| e.block == id) {
                self.prefix_table.remove(&hash);
            }
        }
        block.ref_count = 1;
        block.location = BlockLocation::Device;
        Some(id)
    }

    /// Allocate `num_blocks` device blocks for a sequence.
    pub fn allocate(&mut self, seq_id: SeqId, num_blocks: usize) -> Result<(), OutOfCache> {
        if self.free_device.len() < num_blocks {
            return Err(OutOfCache { requested: num_blocks, free: self.free_device.len() });
        }
        let mut ids = Vec::with_capacity(num_blocks);
        for _ in 0..num_blocks {
            let id = self.pop_device_block().expect("free list length checked");
            ids.push(id);
        }
        self.block_tables.entry(seq_id).or_default().extend(&ids);
        debug!(seq_id, num_blocks, "allocated device blocks");
        Ok(())
    }

    /// Grow a sequence's table to back `total_tokens` tokens, where the
    /// sequence currently holds `num_filled_tokens`. Performs copy-on-write on
    /// a shared tail block before any new token is written into it.
    pub fn append_slots(
        &mut self,
        seq_id: SeqId,
        num_filled_tokens: usize,
        total_tokens: usize,
    ) -> Result<(), OutOfCache> {
        let block_size = self.config.block_size;
        let table_len = self.block_tables.get(&seq_id).map_or(0, |t| t.len());

        // writes land in the tail block when it still has room
        if table_len > 0 && num_filled_tokens < table_len * block_size && total_tokens > num_filled_tokens {
            let tail = self.block_tables[&seq_id][table_len - 1];
            if self.blocks[tail as usize].ref_count > 1 {
                let replacement = self.pop_device_block().ok_or(OutOfCache {
                    requested: 1,
                    free: 0,
                })?;
                self.blocks[tail as usize].ref_count -= 1;
                let table = self.block_tables.get_mut(&seq_id).expect("table exists");
                table[table_len - 1] = replacement;
                debug!(seq_id, old = tail, new = replacement, "copy-on-write on shared tail block");
            }
        }

        let needed = self.num_required_blocks(total_tokens);
        if needed > table_len {
            self.allocate(seq_id, needed - table_len)?;
        }
        Ok(())
    }

    /// Release a sequence's blocks. Cached prefix entries survive so the
    /// blocks can be resurrected from the free list on a later prefix hit.
    pub fn free(&mut self, seq_id: SeqId) {
        let Some(table) = self.block_tables.remove(&seq_id) else {
            return;
        };
        debug!(seq_id, num_blocks = table.len(), "freeing blocks");
        for &id in table.iter().rev() {
            let block = &mut self.blocks[id as usize];
            block.ref_count = block.ref_count.saturating_sub(1);
            if block.ref_count == 0 {
                match block.location {
                    BlockLocation::Device => {
                        block.location = BlockLocation::Free;
                        self.free_device.push(id);
                    }
                    BlockLocation::Host => {
                        block.location = BlockLocation::Free;
                        block.last_hash = None;
                        self.free_host.push(id);
                    }
                    BlockLocation::Free => {}
                }
            }
        }
    }

    /// Walk a prompt block-by-block against the prefix table. Every hit block
    /// is appended to the sequence's table with its ref-count bumped (or
    /// resurrected from the free list); the walk stops at the first miss.
    ///
    /// Returns the number of prefix tokens now backed by shared blocks.
    pub fn match_prefix(&mut self, seq_id: SeqId, tokens: &[TokenId]) -> usize {
        if !self.config.enable_prefix_caching {
            return 0;
        }
        if self.block_tables.get(&seq_id).is_some_and(|t| !t.is_empty()) {
            return 0;
        }
        let block_size = self.config.block_size;
        let mut matched = 0usize;
        let mut prev_hash = 0u64;
        for chunk in tokens.chunks_exact(block_size) {
            let hash = chunk_hash(prev_hash, chunk);
            let Some(entry) = self.prefix_table.get(&hash) else {
                break;
            };
            // second-level compare guards against hash collisions
            if entry.tokens != chunk {
                break;
            }
            let id = entry.block;
            let block = &mut self.blocks[id as usize];
            if block.last_hash != Some(hash) {
                break;
            }
            match block.location {
                BlockLocation::Device => {
                    block.ref_count += 1;
                }
                BlockLocation::Free => {
                    // resurrect a freed-but-unreclaimed cached block
                    let Some(pos) = self.free_device.iter().rposition(|&b| b == id) else {
                        break;
                    };
                    self.free_device.remove(pos);
                    let block = &mut self.blocks[id as usize];
                    block.ref_count = 1;
                    block.location = BlockLocation::Device;
                }
                BlockLocation::Host => break,
            }
            self.block_tables.entry(seq_id).or_default().push(id);
            matched += block_size;
            prev_hash = hash;
        }
        if matched > 0 {
            debug!(seq_id, matched, "prefix cache hit");
        }
        matched
    }

    /// Insert every full block of a sequence into the prefix table.
    /// Called after a step so freshly written blocks become reusable.
    pub fn cache_full_blocks(&mut self, seq_id: SeqId, tokens: &[TokenId]) {
        if !self.config.enable_prefix_caching {
            return;
        }
        let block_size = self.config.block_size;
        let Some(table) = self.block_tables.get(&seq_id) else {
            return;
        };
        let table = table.clone();
        let mut prev_hash = 0u64;
        for (idx, chunk) in tokens.chunks_exact(block_size).enumerate() {
            let Some(&id) = table.get(idx) else {
                break;
            };
            let hash = chunk_hash(prev_hash, chunk);
            let block = &mut self.blocks[id as usize];
            if block.last_hash != Some(hash) {
                block.last_hash = Some(hash);
                self.prefix_table
                    .entry(hash)
                    .or_insert_with(|| PrefixEntry { block: id, tokens: chunk.to_vec() });
            }
            prev_hash = hash;
        }
    }

    /// Whether a sequence's blocks may be copied out to host.
    pub fn can_swap_out(&self, seq_id: SeqId) -> bool {
        let Some(table) = self.block_tables.get(&seq_id) else {
            return false;
        };
        !table.is_empty()
            && table.iter().all(|&id| {
                let b = &self.blocks[id as usize];
                b.location == BlockLocation::Device && b.ref_count == 1
            })
            && self.free_host.len() >= table.len()
    }

    /// Copy a sequence's device blocks to host. Returns `{device -> host}`
    /// pairs for the executor to move data alongside the forward.
    pub fn swap_out(&mut self, seq_id: SeqId) -> Result<SwapMap, OutOfCache> {
        let table = self.block_tables.get(&seq_id).cloned().unwrap_or_default();
        if self.free_host.len() < table.len() {
            return Err(OutOfCache { requested: table.len(), free: self.free_host.len() });
        }
        let mut swap_map = SwapMap::new();
        let mut new_table = Vec::with_capacity(table.len());
        for &dev in &table {
            let host = self.free_host.pop().expect("length checked");
            {
                let block = &mut self.blocks[host as usize];
                block.ref_count = 1;
                block.location = BlockLocation::Host;
            }
            {
                let block = &mut self.blocks[dev as usize];
                block.ref_count = 0;
                block.location = BlockLocation::Free;
                if let Some(hash) = block.last_hash.take() {
                    if self.prefix_table.get(&hash).is_some_and(|e| e.block == dev) {
                        self.prefix_table.remove(&hash);
                    }
                }
            }
            self.free_device.push(dev);
            swap_map.insert(dev, host);
            new_table.push(host);
        }
        self.block_tables.insert(seq_id, new_table);
        debug!(seq_id, num_blocks = swap_map.len(), "swapped out");
        Ok(swap_map)
    }

    pub fn can_swap_in(&self, seq_id: SeqId) -> bool {
        let Some(table) = self.block_tables.get(&seq_id) else {
            return false;
        };
        !table.is_empty()
            && table.iter().all(|&id| self.blocks[id as usize].location == BlockLocation::Host)
            && self.free_device.len() >= table.len()
    }

    /// Copy a sequence's host blocks back to device. Returns `{host -> device}`.
    pub fn swap_in(&mut self, seq_id: SeqId) -> Result<SwapMap, OutOfCache> {
        let table = self.block_tables.get(&seq_id).cloned().unwrap_or_default();
        if self.free_device.len() < table.len() {
            return Err(OutOfCache { requested: table.len(), free: self.free_device.len() });
        }
        let mut swap_map = SwapMap::new();
        let mut new_table = Vec::with_capacity(table.len());
        for &host in &table {
            let dev = self.pop_device_block().expect("length checked");
            {
                let block = &mut self.blocks[host as usize];
                block.ref_count = 0;
                block.location = BlockLocation::Free;
                block.last_hash = None;
            }
            self.free_host.push(host);
            swap_map.insert(host, dev);
            new_table.push(dev);
        }
        self.block_tables.insert(seq_id, new_table);
        debug!(seq_id, num_blocks = swap_map.len(), "swapped in");
        Ok(swap_map)
    }

    /// Sum of ref counts over device blocks, for accounting checks.
    pub fn device_ref_count_sum(&self) -> usize {
        self.blocks[..self.config.num_gpu_blocks].iter().map(|b| b.ref_count).sum()
    }
}

/// Rolling prefix hash: `H(prev_hash, tokens)` over one full block.
fn chunk_hash(prev_hash: u64, chunk: &[TokenId]) -> u64 {
    let mut bytes = Vec::with_capacity(chunk.len() * 4);
    for token in chunk {
        bytes.extend_from_slice(&token.to_le_bytes());
    }
    xxh64(&bytes, prev_hash)
}
