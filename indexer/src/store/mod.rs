//! Session persistence: chunk plans, completion marks, and indexed records.
//!
//! The pipeline never tracks resume state in its own memory; it round-trips
//! through a `SessionStore` so an interrupted session can be reopened and
//! continue from the first pending chunk. The in-memory store is the only
//! backend today; the trait is the seam for a durable one.

use crate::rpc::{LogRecord, ReceiptRecord, TxRecord};
use crate::session::{Chunk, ChunkMetrics, ChunkRecords, ChunkStatus, SessionKey};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no stored session for {key}")]
    UnknownSession { key: SessionKey },
    #[error("chunk {index} out of bounds for session {key}")]
    UnknownChunk { key: SessionKey, index: usize },
}

/// Persisted state of one chunk.
#[derive(Debug, Clone, Serialize)]
pub struct StoredChunk {
    pub chunk: Chunk,
    pub status: ChunkStatus,
    pub metrics: Option<ChunkMetrics>,
}

/// Persisted state of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub key: SessionKey,
    pub chunks: Vec<StoredChunk>,
}

impl SessionRecord {
    /// Plan index of the first chunk that still needs work.
    pub fn first_pending(&self) -> Option<usize> {
        self.chunks
            .iter()
            .find(|stored| stored.status != ChunkStatus::Complete)
            .map(|stored| stored.chunk.index)
    }

    /// Plan index the next appended chunk should take. Survives compaction
    /// of evicted chunks; indices are never reused.
    pub fn next_index(&self) -> usize {
        self.chunks
            .last()
            .map(|stored| stored.chunk.index + 1)
            .unwrap_or(0)
    }

    pub fn completed(&self) -> usize {
        self.chunks
            .iter()
            .filter(|stored| stored.status == ChunkStatus::Complete)
            .count()
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Open a session under `key` with the given chunk plan. If a record
    /// already exists, completion marks are kept for plan entries whose
    /// bounds are unchanged, so a rerun resumes instead of starting over.
    async fn open_session(
        &self,
        key: &SessionKey,
        chunks: &[Chunk],
    ) -> Result<SessionRecord, StoreError>;

    async fn session(&self, key: &SessionKey) -> Result<Option<SessionRecord>, StoreError>;

    /// Mark a chunk complete and persist what it fetched.
    async fn record_chunk(
        &self,
        key: &SessionKey,
        index: usize,
        records: &ChunkRecords,
        metrics: &ChunkMetrics,
    ) -> Result<(), StoreError>;

    async fn mark_chunk_failed(&self, key: &SessionKey, index: usize) -> Result<(), StoreError>;

    /// Extend the plan with catch-up chunks appended by the tail.
    async fn append_chunks(&self, key: &SessionKey, chunks: &[Chunk]) -> Result<(), StoreError>;

    /// Drop records below `block` and compact completed chunk entries that
    /// fell wholly under it, used by the tail to keep a bounded tier's window
    /// sliding instead of growing. Returns how many records went.
    async fn evict_before(&self, key: &SessionKey, block: u64) -> Result<usize, StoreError>;

    async fn logs(&self, key: &SessionKey) -> Result<Vec<LogRecord>, StoreError>;

    async fn transactions(&self, key: &SessionKey) -> Result<Vec<TxRecord>, StoreError>;

    async fn receipts(&self, key: &SessionKey) -> Result<Vec<ReceiptRecord>, StoreError>;
}

#[derive(Debug, Default)]
struct SessionState {
    /// Keyed by plan index; eviction can compact the front without shifting
    /// the indices of the remaining chunks.
    chunks: BTreeMap<usize, StoredChunk>,
    logs: Vec<LogRecord>,
    transactions: Vec<TxRecord>,
    receipts: Vec<ReceiptRecord>,
}

impl SessionState {
    fn record(&self, key: &SessionKey) -> SessionRecord {
        SessionRecord {
            key: key.clone(),
            chunks: self.chunks.values().cloned().collect(),
        }
    }
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<SessionKey, SessionState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn open_session(
        &self,
        key: &SessionKey,
        chunks: &[Chunk],
    ) -> Result<SessionRecord, StoreError> {
        let mut sessions = self.sessions.lock().expect("store lock poisoned");
        let state = sessions.entry(key.clone()).or_default();

        let previous: HashMap<(u64, u64), StoredChunk> = std::mem::take(&mut state.chunks)
            .into_values()
            .map(|stored| ((stored.chunk.start_block, stored.chunk.end_block), stored))
            .collect();
        state.chunks = chunks
            .iter()
            .map(|chunk| {
                let stored = match previous.get(&(chunk.start_block, chunk.end_block)) {
                    Some(kept) => StoredChunk {
                        chunk: *chunk,
                        status: kept.status,
                        metrics: kept.metrics.clone(),
                    },
                    None => StoredChunk {
                        chunk: *chunk,
                        status: ChunkStatus::Pending,
                        metrics: None,
                    },
                };
                (chunk.index, stored)
            })
            .collect();
        Ok(state.record(key))
    }

    async fn session(&self, key: &SessionKey) -> Result<Option<SessionRecord>, StoreError> {
        let sessions = self.sessions.lock().expect("store lock poisoned");
        Ok(sessions.get(key).map(|state| state.record(key)))
    }

    async fn record_chunk(
        &self,
        key: &SessionKey,
        index: usize,
        records: &ChunkRecords,
        metrics: &ChunkMetrics,
    ) -> Result<(), StoreError> {
        let mut sessions = self.sessions.lock().expect("store lock poisoned");
        let state = sessions
            .get_mut(key)
            .ok_or_else(|| StoreError::UnknownSession { key: key.clone() })?;
        let stored = state
            .chunks
            .get_mut(&index)
            .ok_or_else(|| StoreError::UnknownChunk {
                key: key.clone(),
                index,
            })?;
        stored.status = ChunkStatus::Complete;
        stored.metrics = Some(metrics.clone());
        state.logs.extend(records.logs.iter().cloned());
        state.transactions.extend(records.transactions.iter().cloned());
        state.receipts.extend(records.receipts.iter().cloned());
        Ok(())
    }

    async fn mark_chunk_failed(&self, key: &SessionKey, index: usize) -> Result<(), StoreError> {
        let mut sessions = self.sessions.lock().expect("store lock poisoned");
        let state = sessions
            .get_mut(key)
            .ok_or_else(|| StoreError::UnknownSession { key: key.clone() })?;
        let stored = state
            .chunks
            .get_mut(&index)
            .ok_or_else(|| StoreError::UnknownChunk {
                key: key.clone(),
                index,
            })?;
        stored.status = ChunkStatus::Failed;
        Ok(())
    }

    async fn append_chunks(&self, key: &SessionKey, chunks: &[Chunk]) -> Result<(), StoreError> {
        let mut sessions = self.sessions.lock().expect("store lock poisoned");
        let state = sessions
            .get_mut(key)
            .ok_or_else(|| StoreError::UnknownSession { key: key.clone() })?;
        state.chunks.extend(chunks.iter().map(|chunk| {
            (
                chunk.index,
                StoredChunk {
                    chunk: *chunk,
                    status: ChunkStatus::Pending,
                    metrics: None,
                },
            )
        }));
        Ok(())
    }

    async fn evict_before(&self, key: &SessionKey, block: u64) -> Result<usize, StoreError> {
        let mut sessions = self.sessions.lock().expect("store lock poisoned");
        let state = sessions
            .get_mut(key)
            .ok_or_else(|| StoreError::UnknownSession { key: key.clone() })?;
        let before = state.logs.len() + state.transactions.len() + state.receipts.len();
        state.logs.retain(|log| log.block_number >= block);
        state
            .transactions
            .retain(|tx| tx.block_number >= block);
        state.receipts.retain(|receipt| receipt.block_number >= block);
        // Completed chunks that fell wholly under the threshold have nothing
        // left to resume; drop their plan entries so a long tail stays bounded.
        state.chunks.retain(|_, stored| {
            stored.status != ChunkStatus::Complete || stored.chunk.end_block > block
        });
        Ok(before - state.logs.len() - state.transactions.len() - state.receipts.len())
    }

    async fn logs(&self, key: &SessionKey) -> Result<Vec<LogRecord>, StoreError> {
        let sessions = self.sessions.lock().expect("store lock poisoned");
        let state = sessions
            .get(key)
            .ok_or_else(|| StoreError::UnknownSession { key: key.clone() })?;
        Ok(state.logs.clone())
    }

    async fn transactions(&self, key: &SessionKey) -> Result<Vec<TxRecord>, StoreError> {
        let sessions = self.sessions.lock().expect("store lock poisoned");
        let state = sessions
            .get(key)
            .ok_or_else(|| StoreError::UnknownSession { key: key.clone() })?;
        Ok(state.transactions.clone())
    }

    async fn receipts(&self, key: &SessionKey) -> Result<Vec<ReceiptRecord>, StoreError> {
        let sessions = self.sessions.lock().expect("store lock poisoned");
        let state = sessions
            .get(key)
            .ok_or_else(|| StoreError::UnknownSession { key: key.clone() })?;
        Ok(state.receipts.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::partition_chunks;
    use crate::test_utils::{test_address, test_chunk_metrics};

    fn key() -> SessionKey {
        SessionKey {
            account: "acct".to_string(),
            chain_id: 1,
            contract: test_address(0xaa),
        }
    }

    #[tokio::test]
    async fn reopening_keeps_completion_marks() {
        let store = MemoryStore::new();
        let key = key();
        let chunks = partition_chunks(0, 400_000, 200_000);

        let record = store.open_session(&key, &chunks).await.expect("opens");
        assert_eq!(record.first_pending(), Some(0));

        store
            .record_chunk(&key, 0, &ChunkRecords::default(), &test_chunk_metrics(&chunks[0]))
            .await
            .expect("records");

        let reopened = store.open_session(&key, &chunks).await.expect("reopens");
        assert_eq!(reopened.first_pending(), Some(1));
        assert_eq!(reopened.completed(), 1);
    }

    #[tokio::test]
    async fn changed_bounds_reset_a_chunk_to_pending() {
        let store = MemoryStore::new();
        let key = key();
        let chunks = partition_chunks(0, 400_000, 200_000);
        store.open_session(&key, &chunks).await.expect("opens");
        store
            .record_chunk(&key, 1, &ChunkRecords::default(), &test_chunk_metrics(&chunks[1]))
            .await
            .expect("records");

        // A new head moves the final chunk's end; its mark no longer applies.
        let narrower = partition_chunks(0, 350_000, 200_000);
        let reopened = store.open_session(&key, &narrower).await.expect("reopens");
        assert_eq!(reopened.chunks[1].status, ChunkStatus::Pending);
        assert_eq!(reopened.first_pending(), Some(0));
    }

    #[tokio::test]
    async fn appended_chunks_are_pending() {
        let store = MemoryStore::new();
        let key = key();
        let chunks = partition_chunks(0, 200_000, 200_000);
        let record = store.open_session(&key, &chunks).await.expect("opens");

        let mut extra = partition_chunks(200_000, 300_000, 200_000);
        for chunk in &mut extra {
            chunk.index += record.next_index();
        }
        store.append_chunks(&key, &extra).await.expect("appends");

        let record = store.session(&key).await.expect("ok").expect("present");
        assert_eq!(record.chunks.len(), 2);
        assert_eq!(record.chunks[1].chunk.index, 1);
        assert_eq!(record.first_pending(), Some(0));
    }

    #[tokio::test]
    async fn eviction_drops_records_below_the_threshold() {
        use alloy_primitives::U256;
        use crate::test_utils::test_hash;

        let store = MemoryStore::new();
        let key = key();
        let chunks = partition_chunks(0, 1_000, 1_000);
        store.open_session(&key, &chunks).await.expect("opens");

        let records = ChunkRecords {
            logs: vec![
                LogRecord {
                    address: test_address(0xaa),
                    block_number: 10,
                    tx_hash: test_hash(10),
                    topics: Vec::new(),
                },
                LogRecord {
                    address: test_address(0xaa),
                    block_number: 600,
                    tx_hash: test_hash(600),
                    topics: Vec::new(),
                },
            ],
            transactions: vec![TxRecord {
                hash: test_hash(10),
                block_number: 10,
                from: test_address(0x01),
                to: None,
                value: U256::ZERO,
            }],
            receipts: Vec::new(),
        };
        store
            .record_chunk(&key, 0, &records, &test_chunk_metrics(&chunks[0]))
            .await
            .expect("records");

        let evicted = store.evict_before(&key, 500).await.expect("evicts");
        assert_eq!(evicted, 2);
        let logs = store.logs(&key).await.expect("logs");
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].block_number, 600);
        assert!(store.transactions(&key).await.expect("txs").is_empty());
    }

    #[tokio::test]
    async fn eviction_compacts_finished_chunks() {
        let store = MemoryStore::new();
        let key = key();
        let chunks = partition_chunks(0, 3_000, 1_000);
        store.open_session(&key, &chunks).await.expect("opens");
        for chunk in &chunks {
            store
                .record_chunk(
                    &key,
                    chunk.index,
                    &ChunkRecords::default(),
                    &test_chunk_metrics(chunk),
                )
                .await
                .expect("records");
        }

        store.evict_before(&key, 2_000).await.expect("evicts");

        // Only the chunk still inside the window survives, keeping its index,
        // and appended chunks continue the numbering.
        let record = store.session(&key).await.expect("ok").expect("present");
        assert_eq!(record.chunks.len(), 1);
        assert_eq!(record.chunks[0].chunk.index, 2);
        assert_eq!(record.next_index(), 3);
        assert_eq!(record.first_pending(), None);
    }

    #[tokio::test]
    async fn unknown_session_is_an_error() {
        let store = MemoryStore::new();
        let err = store.logs(&key()).await.expect_err("nothing stored");
        assert!(matches!(err, StoreError::UnknownSession { .. }));
    }
}
