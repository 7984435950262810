//! The indexing pipeline: sequential chunk processing with validation,
//! persistence, and progress reporting.
//!
//! Chunks run strictly in plan order. Each one is fetched, boundary-checked
//! against its predecessor, persisted, and only then reported complete, so a
//! crash or cancellation can always resume from the store's first pending
//! chunk without re-processing finished work.

pub mod events;
pub mod tail;
pub mod validate;

pub use events::{BroadcastSink, NullSink, ProgressEvent, ProgressSink, ProgressStep};
pub use tail::{TailMonitor, TAIL_POLL_INTERVAL};
pub use validate::{BoundaryValidator, BoundaryViolation};

use crate::metrics::rate_per_sec;
use crate::provider::ProviderOrchestrator;
use crate::session::{
    Chunk, ChunkDelta, ChunkMetrics, ChunkRecords, IndexingSession, SessionHandle, SessionStatus,
};
use crate::store::SessionStore;
use crate::rpc::RetryPolicy;
use alloy_primitives::B256;
use eyre::{eyre, Result, WrapErr};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout, Instant};

#[derive(Debug, Clone)]
pub struct IndexerOptions {
    /// Chunk width in blocks; also used when tiling tail catch-up spans.
    pub chunk_size: u64,
    /// Fetch attempts per chunk before the session stalls. Each attempt
    /// already rides the transport's endpoint rotation and provider failover.
    pub chunk_retries: u32,
    /// Wall-clock budget for one chunk fetch attempt.
    pub chunk_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for IndexerOptions {
    fn default() -> Self {
        Self {
            chunk_size: crate::config::DEFAULT_CHUNK_SIZE,
            chunk_retries: 3,
            chunk_timeout: Duration::from_secs(600),
            retry: RetryPolicy::default(),
        }
    }
}

pub struct ChunkIndexer {
    orchestrator: Arc<ProviderOrchestrator>,
    store: Arc<dyn SessionStore>,
    sink: Arc<dyn ProgressSink>,
    options: IndexerOptions,
}

impl ChunkIndexer {
    pub fn new(
        orchestrator: Arc<ProviderOrchestrator>,
        store: Arc<dyn SessionStore>,
        sink: Arc<dyn ProgressSink>,
        options: IndexerOptions,
    ) -> Self {
        Self {
            orchestrator,
            store,
            sink,
            options,
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.options.chunk_size
    }

    pub(crate) fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub(crate) fn sink(&self) -> &Arc<dyn ProgressSink> {
        &self.sink
    }

    /// Current head of the session's chain.
    pub(crate) async fn head(&self, chain_id: u64) -> Result<u64> {
        let head = self
            .orchestrator
            .execute_with_failover(chain_id, |provider| async move {
                provider.transport.block_number().await
            })
            .await?;
        Ok(head)
    }

    /// Run the historical backfill for a session, resuming past completed
    /// chunks if the store already knows this session.
    pub async fn run_backfill(&self, handle: &SessionHandle) -> Result<()> {
        let session = handle.session.clone();
        session.set_status(SessionStatus::Indexing);

        let record = self
            .store
            .open_session(&session.key, &session.chunks)
            .await?;
        let resume_from = record.first_pending().unwrap_or(session.chunks.len());
        if resume_from > 0 {
            tracing::info!(
                session = %session.key,
                skipped = resume_from,
                "resuming backfill past completed chunks"
            );
        }
        let mut validator = self.seeded_validator(&session).await?;

        let cancel = handle.cancel_token();
        for chunk in session.chunks.iter().copied().skip(resume_from) {
            if *cancel.borrow() {
                session.set_status(SessionStatus::Cancelled);
                return Ok(());
            }
            self.process_chunk(handle, &mut validator, chunk).await?;
        }

        if let Err(violation) = validator.finish() {
            tracing::error!(
                session = %session.key,
                %violation,
                "backfill plan did not close the session window"
            );
            let reason = violation.to_string();
            session.set_status(SessionStatus::Failed { reason });
            return Err(eyre!(violation));
        }

        self.sink.emit(ProgressEvent {
            session: session.key.clone(),
            step: ProgressStep::BackfillFinished,
        });
        // A session only stays open past backfill when a tail is actually
        // going to run; a sync-entitled session without one still finishes.
        if !session.tail_planned() {
            session.set_status(SessionStatus::Complete);
        }
        Ok(())
    }

    /// Fetch, validate, persist, and report one chunk. Validation failures
    /// and fetch failures both mark the chunk failed and end the session.
    pub(crate) async fn process_chunk(
        &self,
        handle: &SessionHandle,
        validator: &mut BoundaryValidator,
        chunk: Chunk,
    ) -> Result<()> {
        let session = &handle.session;
        self.sink.emit(ProgressEvent {
            session: session.key.clone(),
            step: ProgressStep::ChunkStarted {
                index: chunk.index,
                start_block: chunk.start_block,
                end_block: chunk.end_block,
            },
        });

        let started = Instant::now();
        let mut fetched = None;
        let mut last_err = None;
        for attempt in 0..self.options.chunk_retries.max(1) {
            if attempt > 0 {
                sleep(self.options.retry.delay_for(attempt - 1)).await;
            }
            match timeout(self.options.chunk_timeout, self.fetch_chunk(session, chunk)).await {
                Ok(Ok(records)) => {
                    fetched = Some(records);
                    break;
                }
                Ok(Err(err)) => {
                    tracing::warn!(
                        session = %session.key,
                        chunk = chunk.index,
                        attempt,
                        error = %err,
                        "chunk fetch attempt failed"
                    );
                    last_err = Some(err);
                }
                Err(_) => {
                    tracing::warn!(
                        session = %session.key,
                        chunk = chunk.index,
                        attempt,
                        budget = ?self.options.chunk_timeout,
                        "chunk fetch attempt exceeded its time budget"
                    );
                    last_err = Some(eyre!(
                        "chunk {} exceeded its {:?} fetch budget",
                        chunk.index,
                        self.options.chunk_timeout
                    ));
                }
            }
        }
        let Some(records) = fetched else {
            let err = last_err.unwrap_or_else(|| eyre!("chunk {} fetch failed", chunk.index));
            let reason = format!("stalled: {err:#}");
            return self
                .fail_chunk(handle, chunk, reason.clone(), err, SessionStatus::Stalled { reason })
                .await;
        };
        if let Err(violation) = validator.validate(&chunk, &records) {
            tracing::error!(
                session = %session.key,
                chunk = chunk.index,
                %violation,
                "boundary validation failed; aborting session"
            );
            let reason = violation.to_string();
            return self
                .fail_chunk(
                    handle,
                    chunk,
                    reason.clone(),
                    eyre!(violation),
                    SessionStatus::Failed { reason },
                )
                .await;
        }

        let elapsed = started.elapsed();
        let delta = ChunkDelta::from_records(&records);
        let metrics = ChunkMetrics {
            index: chunk.index,
            start_block: chunk.start_block,
            end_block: chunk.end_block,
            blocks: chunk.len(),
            log_count: records.logs.len(),
            tx_count: records.transactions.len(),
            unique_accounts: delta.accounts.len(),
            unique_blocks: delta.blocks.len(),
            cumulative_value: delta.value,
            elapsed_ms: elapsed.as_millis() as u64,
            blocks_per_sec: rate_per_sec(chunk.len(), elapsed).unwrap_or(0.0),
        };
        self.store
            .record_chunk(&session.key, chunk.index, &records, &metrics)
            .await?;
        session.metrics.record_chunk(&metrics, &delta);
        tracing::info!(
            session = %session.key,
            chunk = chunk.index,
            start_block = chunk.start_block,
            end_block = chunk.end_block,
            logs = metrics.log_count,
            txs = metrics.tx_count,
            elapsed_ms = metrics.elapsed_ms,
            "chunk complete"
        );
        self.sink.emit(ProgressEvent {
            session: session.key.clone(),
            step: ProgressStep::ChunkCompleted { metrics },
        });
        Ok(())
    }

    async fn fail_chunk(
        &self,
        handle: &SessionHandle,
        chunk: Chunk,
        reason: String,
        err: eyre::Report,
        status: SessionStatus,
    ) -> Result<()> {
        let session = &handle.session;
        self.store
            .mark_chunk_failed(&session.key, chunk.index)
            .await?;
        self.sink.emit(ProgressEvent {
            session: session.key.clone(),
            step: ProgressStep::ChunkFailed {
                index: chunk.index,
                reason,
            },
        });
        session.set_status(status);
        Err(err)
    }

    /// A validator primed with the boundary state of the last chunk the
    /// store has marked complete, if any. Every stored transaction hash goes
    /// into the seed so the duplicate check spans the resume seam.
    pub(crate) async fn seeded_validator(
        &self,
        session: &IndexingSession,
    ) -> Result<BoundaryValidator> {
        let mut validator = BoundaryValidator::new(
            session.decision.start_block,
            session.decision.end_block.saturating_add(1),
        );
        let Some(record) = self.store.session(&session.key).await? else {
            return Ok(validator);
        };
        let last_complete = record
            .chunks
            .iter()
            .take_while(|stored| stored.status == crate::session::ChunkStatus::Complete)
            .last();
        if let Some(stored) = last_complete {
            let tx_hashes = self
                .store
                .transactions(&session.key)
                .await?
                .into_iter()
                .map(|tx| tx.hash)
                .collect();
            validator.seed(stored.chunk, tx_hashes);
        }
        Ok(validator)
    }

    async fn fetch_chunk(
        &self,
        session: &IndexingSession,
        chunk: Chunk,
    ) -> Result<ChunkRecords> {
        let chain_id = session.key.chain_id;
        let contract = session.key.contract;

        let logs = self
            .orchestrator
            .execute_with_failover(chain_id, move |provider| async move {
                provider
                    .transport
                    .get_logs(contract, chunk.start_block, chunk.last_block())
                    .await
            })
            .await
            .wrap_err_with(|| format!("log fetch for chunk {}", chunk.index))?;

        let mut seen = HashSet::new();
        let hashes: Vec<B256> = logs
            .iter()
            .map(|log| log.tx_hash)
            .filter(|hash| seen.insert(*hash))
            .collect();
        let batch = session.decision.tx_batch_size.max(1);
        let transactions = self.fetch_transactions(chain_id, &hashes, batch).await?;
        let receipts = self.fetch_receipts(chain_id, &hashes, batch).await?;

        Ok(ChunkRecords {
            logs,
            transactions,
            receipts,
        })
    }

    /// Transaction details in bounded-width batches. A hash the chain no
    /// longer knows is logged and skipped, never invented.
    async fn fetch_transactions(
        &self,
        chain_id: u64,
        hashes: &[B256],
        batch: usize,
    ) -> Result<Vec<crate::rpc::TxRecord>> {
        let mut out = Vec::with_capacity(hashes.len());
        for group in hashes.chunks(batch) {
            let mut set = JoinSet::new();
            for &hash in group {
                let orchestrator = self.orchestrator.clone();
                set.spawn(async move {
                    let fetched = orchestrator
                        .execute_with_failover(chain_id, move |provider| async move {
                            provider.transport.get_transaction(hash).await
                        })
                        .await?;
                    Ok::<_, eyre::Report>((hash, fetched))
                });
            }
            while let Some(joined) = set.join_next().await {
                let (hash, fetched) = joined.wrap_err("transaction fetch task panicked")??;
                match fetched {
                    Some(tx) => out.push(tx),
                    None => tracing::warn!(%hash, "transaction not found; skipping"),
                }
            }
        }
        out.sort_by_key(|tx| (tx.block_number, tx.hash));
        Ok(out)
    }

    async fn fetch_receipts(
        &self,
        chain_id: u64,
        hashes: &[B256],
        batch: usize,
    ) -> Result<Vec<crate::rpc::ReceiptRecord>> {
        let mut out = Vec::with_capacity(hashes.len());
        for group in hashes.chunks(batch) {
            let mut set = JoinSet::new();
            for &hash in group {
                let orchestrator = self.orchestrator.clone();
                set.spawn(async move {
                    let fetched = orchestrator
                        .execute_with_failover(chain_id, move |provider| async move {
                            provider.transport.get_receipt(hash).await
                        })
                        .await?;
                    Ok::<_, eyre::Report>((hash, fetched))
                });
            }
            while let Some(joined) = set.join_next().await {
                let (hash, fetched) = joined.wrap_err("receipt fetch task panicked")??;
                match fetched {
                    Some(receipt) => out.push(receipt),
                    None => tracing::warn!(%hash, "receipt not found; skipping"),
                }
            }
        }
        out.sort_by_key(|receipt| (receipt.block_number, receipt.tx_hash));
        Ok(out)
    }
}
