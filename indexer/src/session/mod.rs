//! Indexing sessions: identity, lifecycle, and progress accounting.
//!
//! A session is one account indexing one contract on one chain. It carries
//! the tier-derived block window, the chunk plan tiled over it, and counters
//! that feed progress reporting and the final summary.

pub mod chunk;
pub mod registry;

pub use chunk::{partition_chunks, Chunk, ChunkDelta, ChunkMetrics, ChunkRecords, ChunkStatus};
pub use registry::{RegistryError, SessionHandle, SessionRegistry};

use crate::locate::DeploymentInfo;
use crate::metrics::{lag_to_head, rate_per_sec};
use crate::tier::RangeDecision;
use alloy_primitives::{Address, U256};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::time::Instant;

const UNSET: u64 = u64::MAX;

/// Identity of one indexing session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SessionKey {
    pub account: String,
    pub chain_id: u64,
    pub contract: Address,
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.account, self.chain_id, self.contract)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Locating,
    Indexing,
    Tailing,
    Complete,
    /// Chunk fetches kept failing after full failover and retries; the
    /// session can be rerun and will resume from the failed chunk.
    Stalled { reason: String },
    Failed { reason: String },
    Cancelled,
}

impl SessionStatus {
    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Complete
                | SessionStatus::Stalled { .. }
                | SessionStatus::Failed { .. }
                | SessionStatus::Cancelled
        )
    }
}

/// Monotonic progress counters, shared across the pipeline tasks.
#[derive(Debug)]
pub struct SessionMetrics {
    chunks_total: AtomicUsize,
    chunks_completed: AtomicUsize,
    blocks_indexed: AtomicU64,
    logs_fetched: AtomicU64,
    txs_fetched: AtomicU64,
    unique_blocks: AtomicU64,
    accounts: Mutex<HashSet<Address>>,
    value: Mutex<U256>,
    head_seen: AtomicU64,
    last_indexed: AtomicU64,
    started: Instant,
}

impl SessionMetrics {
    fn new(chunks_total: usize) -> Self {
        Self {
            chunks_total: AtomicUsize::new(chunks_total),
            chunks_completed: AtomicUsize::new(0),
            blocks_indexed: AtomicU64::new(0),
            logs_fetched: AtomicU64::new(0),
            txs_fetched: AtomicU64::new(0),
            unique_blocks: AtomicU64::new(0),
            accounts: Mutex::new(HashSet::new()),
            value: Mutex::new(U256::ZERO),
            head_seen: AtomicU64::new(UNSET),
            last_indexed: AtomicU64::new(UNSET),
            started: Instant::now(),
        }
    }

    /// Fold one validated chunk into the session accumulator. Chunk block
    /// ranges are disjoint, so per-chunk unique-block counts sum exactly;
    /// accounts repeat across chunks and are merged as a set.
    pub fn record_chunk(&self, metrics: &ChunkMetrics, delta: &ChunkDelta) {
        self.chunks_completed.fetch_add(1, Ordering::Relaxed);
        self.blocks_indexed.fetch_add(metrics.blocks, Ordering::Relaxed);
        self.logs_fetched
            .fetch_add(metrics.log_count as u64, Ordering::Relaxed);
        self.txs_fetched
            .fetch_add(metrics.tx_count as u64, Ordering::Relaxed);
        self.unique_blocks
            .fetch_add(delta.blocks.len() as u64, Ordering::Relaxed);
        self.accounts
            .lock()
            .expect("accounts lock poisoned")
            .extend(delta.accounts.iter().copied());
        {
            let mut value = self.value.lock().expect("value lock poisoned");
            *value = value.saturating_add(delta.value);
        }
        self.last_indexed
            .store(metrics.end_block.saturating_sub(1), Ordering::Relaxed);
    }

    /// Extend the plan, used when the tail appends catch-up chunks.
    pub fn add_planned_chunks(&self, count: usize) {
        self.chunks_total.fetch_add(count, Ordering::Relaxed);
    }

    pub fn observe_head(&self, head: u64) {
        self.head_seen.store(head, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let elapsed = self.started.elapsed();
        let blocks_indexed = self.blocks_indexed.load(Ordering::Relaxed);
        let head_seen = unset_to_none(self.head_seen.load(Ordering::Relaxed));
        let last_indexed = unset_to_none(self.last_indexed.load(Ordering::Relaxed));
        MetricsSnapshot {
            chunks_total: self.chunks_total.load(Ordering::Relaxed),
            chunks_completed: self.chunks_completed.load(Ordering::Relaxed),
            blocks_indexed,
            logs_fetched: self.logs_fetched.load(Ordering::Relaxed),
            txs_fetched: self.txs_fetched.load(Ordering::Relaxed),
            unique_blocks: self.unique_blocks.load(Ordering::Relaxed),
            unique_accounts: self.accounts.lock().expect("accounts lock poisoned").len(),
            cumulative_value: *self.value.lock().expect("value lock poisoned"),
            head_seen,
            last_indexed,
            lag_to_head: lag_to_head(head_seen, last_indexed),
            elapsed_ms: elapsed.as_millis() as u64,
            blocks_per_sec: rate_per_sec(blocks_indexed, elapsed),
        }
    }
}

fn unset_to_none(value: u64) -> Option<u64> {
    (value != UNSET).then_some(value)
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub chunks_total: usize,
    pub chunks_completed: usize,
    pub blocks_indexed: u64,
    pub logs_fetched: u64,
    pub txs_fetched: u64,
    pub unique_blocks: u64,
    pub unique_accounts: usize,
    pub cumulative_value: U256,
    pub head_seen: Option<u64>,
    pub last_indexed: Option<u64>,
    pub lag_to_head: Option<u64>,
    pub elapsed_ms: u64,
    pub blocks_per_sec: Option<f64>,
}

/// Runtime state of one session.
pub struct IndexingSession {
    pub key: SessionKey,
    pub decision: RangeDecision,
    pub deployment: DeploymentInfo,
    /// Immutable backfill plan over `[start_block, end_block]`.
    pub chunks: Vec<Chunk>,
    status: Mutex<SessionStatus>,
    tail_planned: bool,
    pub metrics: SessionMetrics,
}

impl IndexingSession {
    pub fn new(
        key: SessionKey,
        decision: RangeDecision,
        deployment: DeploymentInfo,
        chunk_size: u64,
    ) -> Self {
        // The decision's end block is inclusive; the tiling is half-open.
        let chunks = partition_chunks(
            decision.start_block,
            decision.end_block.saturating_add(1),
            chunk_size,
        );
        let metrics = SessionMetrics::new(chunks.len());
        Self {
            key,
            decision,
            deployment,
            chunks,
            status: Mutex::new(SessionStatus::Pending),
            tail_planned: false,
            metrics,
        }
    }

    /// Mark this session as continuing into tail sync after backfill, so the
    /// backfill leaves it open instead of completing it.
    pub fn with_tail(mut self) -> Self {
        self.tail_planned = true;
        self
    }

    pub fn tail_planned(&self) -> bool {
        self.tail_planned
    }

    pub fn status(&self) -> SessionStatus {
        self.status.lock().expect("status lock poisoned").clone()
    }

    /// Transition the lifecycle state. Terminal states win races: once the
    /// session is complete, failed, or cancelled it stays that way.
    pub fn set_status(&self, next: SessionStatus) {
        let mut status = self.status.lock().expect("status lock poisoned");
        if status.is_terminal() {
            return;
        }
        tracing::info!(session = %self.key, from = ?*status, to = ?next, "session transition");
        *status = next;
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.status(), SessionStatus::Cancelled)
    }
}
