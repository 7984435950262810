//! Boundary validation between and within chunks.
//!
//! Every completed chunk is checked before its results are persisted: the
//! plan must open at the session window's start and tile it seam-tight, no
//! transaction hash may appear in more than one chunk of the session, and
//! log block numbers must be monotonic and inside the chunk. Any violation
//! aborts the session; data that failed validation is never stored.

use crate::session::{Chunk, ChunkRecords};
use alloy_primitives::B256;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BoundaryViolation {
    #[error("plan starts at {found}, session window starts at {expected}")]
    PlanStartMismatch { expected: u64, found: u64 },
    #[error("plan ends at {found}, session window ends at {expected}")]
    PlanEndMismatch { expected: u64, found: u64 },
    #[error("gap before chunk {current}: previous chunk ended at {expected}, next starts at {found}")]
    Gap {
        current: usize,
        expected: u64,
        found: u64,
    },
    #[error("overlap before chunk {current}: previous chunk ended at {expected}, next starts at {found}")]
    Overlap {
        current: usize,
        expected: u64,
        found: u64,
    },
    #[error("transaction {tx_hash} in chunk {current} was already claimed by an earlier chunk")]
    DuplicateTransaction { current: usize, tx_hash: B256 },
    #[error("log block numbers regress in chunk {index}: {prior} then {found}")]
    NonMonotonicLogs { index: usize, prior: u64, found: u64 },
    #[error("chunk {index} has a log at block {block} outside [{start}, {end})")]
    LogOutOfRange {
        index: usize,
        block: u64,
        start: u64,
        end: u64,
    },
}

/// Sequential validator; feed it chunks in plan order.
///
/// The transaction hash set accumulates over the whole session, not just the
/// previous chunk, so a hash duplicated chunks apart is still caught.
pub struct BoundaryValidator {
    window_start: u64,
    /// Exclusive end of the session window.
    window_end: u64,
    previous: Option<Chunk>,
    seen_tx_hashes: HashSet<B256>,
}

impl BoundaryValidator {
    pub fn new(window_start: u64, window_end: u64) -> Self {
        Self {
            window_start,
            window_end,
            previous: None,
            seen_tx_hashes: HashSet::new(),
        }
    }

    /// Prime the validator with the state of an earlier run: the last chunk
    /// it completed and every transaction hash it recorded, so a resumed
    /// session keeps its cross-chunk checks.
    pub fn seed(&mut self, chunk: Chunk, tx_hashes: HashSet<B256>) {
        self.previous = Some(chunk);
        self.seen_tx_hashes = tx_hashes;
    }

    pub fn validate(
        &mut self,
        chunk: &Chunk,
        records: &ChunkRecords,
    ) -> Result<(), BoundaryViolation> {
        match &self.previous {
            Some(previous) => {
                let expected = previous.end_block;
                if chunk.start_block > expected {
                    return Err(BoundaryViolation::Gap {
                        current: chunk.index,
                        expected,
                        found: chunk.start_block,
                    });
                }
                if chunk.start_block < expected {
                    return Err(BoundaryViolation::Overlap {
                        current: chunk.index,
                        expected,
                        found: chunk.start_block,
                    });
                }
            }
            None => {
                if chunk.start_block != self.window_start {
                    return Err(BoundaryViolation::PlanStartMismatch {
                        expected: self.window_start,
                        found: chunk.start_block,
                    });
                }
            }
        }
        for tx in &records.transactions {
            if self.seen_tx_hashes.contains(&tx.hash) {
                return Err(BoundaryViolation::DuplicateTransaction {
                    current: chunk.index,
                    tx_hash: tx.hash,
                });
            }
        }

        let mut prior: Option<u64> = None;
        for log in &records.logs {
            if !chunk.contains(log.block_number) {
                return Err(BoundaryViolation::LogOutOfRange {
                    index: chunk.index,
                    block: log.block_number,
                    start: chunk.start_block,
                    end: chunk.end_block,
                });
            }
            if let Some(prior) = prior {
                if log.block_number < prior {
                    return Err(BoundaryViolation::NonMonotonicLogs {
                        index: chunk.index,
                        prior,
                        found: log.block_number,
                    });
                }
            }
            prior = Some(log.block_number);
        }

        self.previous = Some(*chunk);
        self.seen_tx_hashes
            .extend(records.transactions.iter().map(|tx| tx.hash));
        Ok(())
    }

    /// Call after the plan is exhausted: the final chunk must close the
    /// session window exactly.
    pub fn finish(&self) -> Result<(), BoundaryViolation> {
        let found = self
            .previous
            .map(|chunk| chunk.end_block)
            .unwrap_or(self.window_start);
        if found != self.window_end {
            return Err(BoundaryViolation::PlanEndMismatch {
                expected: self.window_end,
                found,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{LogRecord, TxRecord};
    use crate::test_utils::{test_address, test_hash};
    use alloy_primitives::U256;

    fn chunk(index: usize, start: u64, end: u64) -> Chunk {
        Chunk {
            index,
            start_block: start,
            end_block: end,
        }
    }

    fn log_at(block: u64) -> LogRecord {
        LogRecord {
            address: test_address(0xaa),
            block_number: block,
            tx_hash: test_hash(block),
            topics: Vec::new(),
        }
    }

    fn tx_with(hash: B256, block: u64) -> TxRecord {
        TxRecord {
            hash,
            block_number: block,
            from: test_address(0x01),
            to: Some(test_address(0x02)),
            value: U256::ZERO,
        }
    }

    #[test]
    fn seam_tight_chunks_pass() {
        let mut validator = BoundaryValidator::new(0, 400);
        let records = ChunkRecords {
            logs: vec![log_at(10), log_at(150)],
            ..Default::default()
        };
        validator
            .validate(&chunk(0, 0, 200), &records)
            .expect("first chunk passes");
        validator
            .validate(&chunk(1, 200, 400), &ChunkRecords::default())
            .expect("adjacent chunk passes");
        validator.finish().expect("plan closes the window");
    }

    #[test]
    fn gap_and_overlap_are_fatal() {
        let mut validator = BoundaryValidator::new(0, 400);
        validator
            .validate(&chunk(0, 0, 200), &ChunkRecords::default())
            .expect("first chunk passes");

        let gap = validator
            .validate(&chunk(1, 201, 400), &ChunkRecords::default())
            .expect_err("gap detected");
        assert!(matches!(gap, BoundaryViolation::Gap { expected: 200, found: 201, .. }));

        let overlap = validator
            .validate(&chunk(1, 199, 400), &ChunkRecords::default())
            .expect_err("overlap detected");
        assert!(matches!(
            overlap,
            BoundaryViolation::Overlap { expected: 200, found: 199, .. }
        ));
    }

    #[test]
    fn plan_must_open_at_the_window_start() {
        let mut validator = BoundaryValidator::new(100, 300);
        let err = validator
            .validate(&chunk(0, 150, 300), &ChunkRecords::default())
            .expect_err("stale plan detected");
        assert!(matches!(
            err,
            BoundaryViolation::PlanStartMismatch { expected: 100, found: 150 }
        ));
    }

    #[test]
    fn finish_requires_the_window_to_be_closed() {
        let mut validator = BoundaryValidator::new(0, 400);
        validator
            .validate(&chunk(0, 0, 200), &ChunkRecords::default())
            .expect("first chunk passes");
        let err = validator.finish().expect_err("truncated plan detected");
        assert!(matches!(
            err,
            BoundaryViolation::PlanEndMismatch { expected: 400, found: 200 }
        ));

        validator
            .validate(&chunk(1, 200, 400), &ChunkRecords::default())
            .expect("final chunk passes");
        validator.finish().expect("window closed");
    }

    #[test]
    fn duplicate_transaction_across_boundary_is_fatal() {
        let mut validator = BoundaryValidator::new(0, 400);
        let shared = test_hash(7);
        let first = ChunkRecords {
            transactions: vec![tx_with(shared, 199)],
            ..Default::default()
        };
        validator.validate(&chunk(0, 0, 200), &first).expect("passes");

        let second = ChunkRecords {
            transactions: vec![tx_with(shared, 200)],
            ..Default::default()
        };
        let err = validator
            .validate(&chunk(1, 200, 400), &second)
            .expect_err("duplicate detected");
        assert!(matches!(err, BoundaryViolation::DuplicateTransaction { tx_hash, .. } if tx_hash == shared));
    }

    #[test]
    fn duplicate_transaction_chunks_apart_is_fatal() {
        let mut validator = BoundaryValidator::new(0, 600);
        let shared = test_hash(7);
        let first = ChunkRecords {
            transactions: vec![tx_with(shared, 10)],
            ..Default::default()
        };
        validator.validate(&chunk(0, 0, 200), &first).expect("passes");
        validator
            .validate(&chunk(1, 200, 400), &ChunkRecords::default())
            .expect("empty middle chunk passes");

        // The hash resurfaces two chunks later; the accumulated set catches it.
        let third = ChunkRecords {
            transactions: vec![tx_with(shared, 450)],
            ..Default::default()
        };
        let err = validator
            .validate(&chunk(2, 400, 600), &third)
            .expect_err("non-adjacent duplicate detected");
        assert!(matches!(err, BoundaryViolation::DuplicateTransaction { tx_hash, .. } if tx_hash == shared));
    }

    #[test]
    fn regressing_log_blocks_are_fatal() {
        let mut validator = BoundaryValidator::new(0, 200);
        let records = ChunkRecords {
            logs: vec![log_at(50), log_at(49)],
            ..Default::default()
        };
        let err = validator
            .validate(&chunk(0, 0, 200), &records)
            .expect_err("regression detected");
        assert!(matches!(
            err,
            BoundaryViolation::NonMonotonicLogs { prior: 50, found: 49, .. }
        ));
    }

    #[test]
    fn out_of_range_log_is_fatal() {
        let mut validator = BoundaryValidator::new(0, 200);
        let records = ChunkRecords {
            logs: vec![log_at(200)],
            ..Default::default()
        };
        let err = validator
            .validate(&chunk(0, 0, 200), &records)
            .expect_err("stray log detected");
        assert!(matches!(err, BoundaryViolation::LogOutOfRange { block: 200, .. }));
    }

    #[test]
    fn seeded_validator_checks_the_resume_boundary() {
        let mut validator = BoundaryValidator::new(0, 400);
        let mut hashes = HashSet::new();
        hashes.insert(test_hash(3));
        validator.seed(chunk(0, 0, 200), hashes);

        let records = ChunkRecords {
            transactions: vec![tx_with(test_hash(3), 205)],
            ..Default::default()
        };
        let err = validator
            .validate(&chunk(1, 200, 400), &records)
            .expect_err("duplicate across resume boundary");
        assert!(matches!(err, BoundaryViolation::DuplicateTransaction { .. }));
    }
}
