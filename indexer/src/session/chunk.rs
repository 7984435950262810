//! Chunk tiling over a block range.
//!
//! A session's window is split into fixed-width half-open chunks
//! `[start, end)`. A block on a chunk seam belongs to the later chunk, so
//! every block in the window is owned by exactly one chunk.

use crate::metrics::span_len;
use crate::rpc::{LogRecord, ReceiptRecord, TxRecord};
use alloy_primitives::{Address, U256};
use serde::Serialize;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChunkStatus {
    Pending,
    Complete,
    Failed,
}

/// One half-open slice `[start_block, end_block)` of a session window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Chunk {
    pub index: usize,
    pub start_block: u64,
    /// Exclusive upper bound.
    pub end_block: u64,
}

impl Chunk {
    pub fn len(&self) -> u64 {
        span_len(self.start_block, self.end_block)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inclusive last block, for wire calls that take closed ranges.
    pub fn last_block(&self) -> u64 {
        self.end_block.saturating_sub(1)
    }

    pub fn contains(&self, block: u64) -> bool {
        block >= self.start_block && block < self.end_block
    }
}

/// Everything fetched for one chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkRecords {
    pub logs: Vec<LogRecord>,
    pub transactions: Vec<TxRecord>,
    pub receipts: Vec<ReceiptRecord>,
}

/// Distinct participants, blocks touched, and value moved in one chunk.
/// Merged into the session accumulator once the chunk validates.
#[derive(Debug, Clone, Default)]
pub struct ChunkDelta {
    pub accounts: HashSet<Address>,
    pub blocks: HashSet<u64>,
    pub value: U256,
}

impl ChunkDelta {
    pub fn from_records(records: &ChunkRecords) -> Self {
        let mut delta = Self::default();
        for log in &records.logs {
            delta.blocks.insert(log.block_number);
        }
        for tx in &records.transactions {
            delta.accounts.insert(tx.from);
            if let Some(to) = tx.to {
                delta.accounts.insert(to);
            }
            delta.value = delta.value.saturating_add(tx.value);
        }
        delta
    }
}

/// Per-chunk outcome counters, reported after each chunk completes.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkMetrics {
    pub index: usize,
    pub start_block: u64,
    pub end_block: u64,
    pub blocks: u64,
    pub log_count: usize,
    pub tx_count: usize,
    pub unique_accounts: usize,
    pub unique_blocks: usize,
    pub cumulative_value: U256,
    pub elapsed_ms: u64,
    pub blocks_per_sec: f64,
}

/// Tile `[start, end)` into `chunk_size`-wide chunks; the last chunk is
/// truncated to the window edge. An empty window yields no chunks.
pub fn partition_chunks(start: u64, end: u64, chunk_size: u64) -> Vec<Chunk> {
    if start >= end || chunk_size == 0 {
        return Vec::new();
    }
    let mut chunks = Vec::with_capacity(((end - start) / chunk_size + 1) as usize);
    let mut cursor = start;
    while cursor < end {
        let chunk_end = cursor.saturating_add(chunk_size).min(end);
        chunks.push(Chunk {
            index: chunks.len(),
            start_block: cursor,
            end_block: chunk_end,
        });
        cursor = chunk_end;
    }
    chunks
}
