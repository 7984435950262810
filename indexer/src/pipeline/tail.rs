//! Continuous tail sync after backfill.
//!
//! Polls the chain head on a fixed interval, keeps a sliding window of
//! recent head observations for rate diagnostics, and tiles any newly
//! produced span into catch-up chunks processed through the same validated
//! path as the backfill.

use super::{ChunkIndexer, ProgressEvent, ProgressStep};
use crate::config::TierTable;
use crate::session::{partition_chunks, SessionHandle, SessionStatus};
use crate::tier::SubscriptionLookup;
use eyre::Result;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};

pub const TAIL_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Head observations kept for the production-rate window.
const HEAD_WINDOW: usize = 20;

pub struct TailMonitor {
    indexer: Arc<ChunkIndexer>,
    poll_interval: Duration,
    tier_check: Option<(Arc<dyn SubscriptionLookup>, TierTable)>,
}

impl TailMonitor {
    pub fn new(indexer: Arc<ChunkIndexer>, poll_interval: Duration) -> Self {
        Self {
            indexer,
            poll_interval,
            tier_check: None,
        }
    }

    /// Re-resolve the account's tier on every poll. A downgrade away from
    /// continuous sync ends the tail within one interval; a failed lookup
    /// counts as a downgrade.
    pub fn with_tier_check(
        mut self,
        lookup: Arc<dyn SubscriptionLookup>,
        tiers: TierTable,
    ) -> Self {
        self.tier_check = Some((lookup, tiers));
        self
    }

    /// True while the account's current tier still includes continuous sync.
    async fn tier_still_syncs(&self, account: &str) -> bool {
        let Some((lookup, tiers)) = &self.tier_check else {
            return true;
        };
        match lookup.subscription(account).await {
            Ok(info) => tiers
                .get(&info.tier)
                .map(|tier| tier.continuous_sync)
                .unwrap_or(false),
            Err(err) => {
                tracing::warn!(account, error = %err, "tier recheck failed; treating as downgrade");
                false
            }
        }
    }

    /// Follow the chain head until cancelled. Expects the backfill for this
    /// session to have completed; the first catch-up span starts right after
    /// the backfill window.
    pub async fn run(&self, handle: &SessionHandle) -> Result<()> {
        let session = handle.session.clone();
        session.set_status(SessionStatus::Tailing);
        tracing::info!(
            session = %session.key,
            poll_secs = self.poll_interval.as_secs(),
            "tail sync started"
        );

        let mut validator = self.indexer.seeded_validator(&session).await?;
        let mut next_block = session.decision.end_block.saturating_add(1);
        let mut heads: VecDeque<(Instant, u64)> = VecDeque::with_capacity(HEAD_WINDOW);
        let mut cancel = handle.cancel_token();
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        session.set_status(SessionStatus::Cancelled);
                        return Ok(());
                    }
                    continue;
                }
            }

            if !self.tier_still_syncs(&session.key.account).await {
                tracing::info!(session = %session.key, "tier no longer includes continuous sync; stopping tail");
                session.set_status(SessionStatus::Complete);
                return Ok(());
            }

            let head = match self.indexer.head(session.key.chain_id).await {
                Ok(head) => head,
                Err(err) => {
                    tracing::warn!(session = %session.key, error = %err, "head poll failed");
                    continue;
                }
            };
            session.metrics.observe_head(head);
            heads.push_back((Instant::now(), head));
            while heads.len() > HEAD_WINDOW {
                heads.pop_front();
            }
            let lag = head.saturating_sub(next_block.saturating_sub(1));
            self.indexer.sink().emit(ProgressEvent {
                session: session.key.clone(),
                step: ProgressStep::TailTick { head, lag },
            });
            if let Some(rate) = observed_rate(&heads) {
                tracing::debug!(session = %session.key, blocks_per_sec = rate, "head window rate");
            }

            if head < next_block {
                continue;
            }

            // Plan indices keep counting up even after eviction compacts old
            // entries, so the next catch-up chunk follows the highest index.
            let base = self
                .indexer
                .store()
                .session(&session.key)
                .await?
                .map(|record| record.next_index())
                .unwrap_or(0);
            let mut chunks =
                partition_chunks(next_block, head.saturating_add(1), self.indexer.chunk_size());
            for chunk in &mut chunks {
                chunk.index += base;
            }
            self.indexer
                .store()
                .append_chunks(&session.key, &chunks)
                .await?;
            session.metrics.add_planned_chunks(chunks.len());

            for chunk in chunks {
                if *cancel.borrow() {
                    session.set_status(SessionStatus::Cancelled);
                    return Ok(());
                }
                self.indexer.process_chunk(handle, &mut validator, chunk).await?;
            }
            next_block = head.saturating_add(1);

            // Keep a bounded tier's window sliding instead of growing: drop
            // records that have fallen out of the entitled span.
            let window = session
                .decision
                .end_block
                .saturating_add(1)
                .saturating_sub(session.decision.start_block);
            let threshold = next_block.saturating_sub(window);
            if threshold > session.decision.start_block {
                let evicted = self
                    .indexer
                    .store()
                    .evict_before(&session.key, threshold)
                    .await?;
                if evicted > 0 {
                    tracing::debug!(
                        session = %session.key,
                        threshold,
                        evicted,
                        "evicted records outside the sliding window"
                    );
                }
            }
        }
    }
}

/// Block production rate over the observation window, if it spans any time.
fn observed_rate(heads: &VecDeque<(Instant, u64)>) -> Option<f64> {
    let (first_at, first) = heads.front()?;
    let (last_at, last) = heads.back()?;
    let elapsed = last_at.duration_since(*first_at).as_secs_f64();
    if elapsed > 0.0 && last > first {
        Some((last - first) as f64 / elapsed)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::test_utils::{indexer_fixture, test_session_handle_sync, MockChain};
    use crate::tier::StaticSubscriptionLookup;

    #[tokio::test(start_paused = true)]
    async fn tail_catches_up_after_the_head_advances() {
        let chain = MockChain::default().with_head(100_000).with_deployment(0);
        let (indexer, connection) = indexer_fixture(chain, 50_000).await;
        let indexer = Arc::new(indexer);
        let handle = test_session_handle_sync(0, 100_000, 50_000);

        indexer.run_backfill(&handle).await.expect("backfill runs");
        assert_eq!(handle.session.status(), SessionStatus::Indexing);

        connection.set_head(100_500);
        let monitor = TailMonitor::new(indexer.clone(), Duration::from_secs(30));
        let tail_handle = handle.clone();
        let task = tokio::spawn(async move { monitor.run(&tail_handle).await });

        // Paused time auto-advances; wait until the catch-up chunk lands.
        let key = handle.session.key.clone();
        tokio::time::timeout(Duration::from_secs(600), async {
            loop {
                let record = indexer.store().session(&key).await.expect("store ok");
                if record.map(|r| r.completed()).unwrap_or(0) >= 4 {
                    break;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        })
        .await
        .expect("tail indexes the new span");

        handle.cancel();
        task.await.expect("tail task joins").expect("tail exits cleanly");

        let record = indexer
            .store()
            .session(&handle.session.key)
            .await
            .expect("store ok")
            .expect("session stored");
        let last = record.chunks.last().expect("catch-up chunk appended");
        assert_eq!(last.chunk.start_block, 100_001);
        assert_eq!(last.chunk.end_block, 100_501);
        // The window slid forward by 500 blocks, so the log at block 0 is out.
        let logs = indexer
            .store()
            .logs(&handle.session.key)
            .await
            .expect("logs stored");
        assert!(logs.iter().all(|log| log.block_number >= 500));
        assert_eq!(handle.session.status(), SessionStatus::Cancelled);
        let snapshot = handle.session.metrics.snapshot();
        assert_eq!(snapshot.head_seen, Some(100_500));
        assert_eq!(snapshot.last_indexed, Some(100_500));
        assert_eq!(snapshot.lag_to_head, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn tier_downgrade_ends_the_tail() {
        let chain = MockChain::default().with_head(100_000).with_deployment(0);
        let (indexer, _connection) = indexer_fixture(chain, 50_000).await;
        let indexer = Arc::new(indexer);
        let handle = test_session_handle_sync(0, 100_000, 50_000);
        indexer.run_backfill(&handle).await.expect("backfill runs");

        // The account now resolves to a tier without continuous sync.
        let lookup = Arc::new(StaticSubscriptionLookup::new().with_account("acct", "free"));
        let monitor = TailMonitor::new(indexer, Duration::from_secs(30))
            .with_tier_check(lookup, AppConfig::builtin().tier_table());

        monitor.run(&handle).await.expect("tail stops cleanly");
        assert_eq!(handle.session.status(), SessionStatus::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn tail_idles_while_the_head_stands_still() {
        let chain = MockChain::default().with_head(100_000).with_deployment(0);
        let (indexer, connection) = indexer_fixture(chain, 50_000).await;
        let indexer = Arc::new(indexer);
        let handle = test_session_handle_sync(0, 100_000, 50_000);
        indexer.run_backfill(&handle).await.expect("backfill runs");
        let polls_before = connection.count_for_method("eth_blockNumber");

        let monitor = TailMonitor::new(indexer.clone(), Duration::from_secs(30));
        let tail_handle = handle.clone();
        let task = tokio::spawn(async move { monitor.run(&tail_handle).await });

        tokio::time::timeout(Duration::from_secs(600), async {
            loop {
                if connection.count_for_method("eth_blockNumber") >= polls_before + 3 {
                    break;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        })
        .await
        .expect("tail keeps polling");

        // No new blocks, so the plan stays at the backfill's three chunks.
        let record = indexer
            .store()
            .session(&handle.session.key)
            .await
            .expect("store ok")
            .expect("session stored");
        assert_eq!(record.chunks.len(), 3);

        handle.cancel();
        task.await.expect("tail task joins").expect("tail exits cleanly");
    }
}
