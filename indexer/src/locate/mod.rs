//! Contract deployment discovery.
//!
//! Finds the first block where a contract has code via binary search over
//! `eth_getCode`. When the chain cannot answer, falls back to a coarse
//! recency heuristic and flags the result degraded so callers can surface
//! the reduced confidence instead of treating the estimate as exact.

use crate::rpc::RpcTransport;
use alloy_primitives::Address;
use std::sync::Arc;

/// Window assumed by the degraded fallback when binary search is impossible.
const FALLBACK_WINDOW_DAYS: u64 = 30;

#[derive(Debug, thiserror::Error)]
pub enum LocateError {
    #[error("contract {address} has no code at block {head}")]
    NotDeployed { address: Address, head: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeploymentInfo {
    /// First block at which the contract has code. Exact unless `degraded`.
    pub block: u64,
    /// True when the block is a heuristic estimate rather than a search result.
    pub degraded: bool,
}

pub struct DeploymentLocator {
    transport: Arc<RpcTransport>,
    blocks_per_day: u64,
}

impl DeploymentLocator {
    pub fn new(transport: Arc<RpcTransport>, blocks_per_day: u64) -> Self {
        Self {
            transport,
            blocks_per_day: blocks_per_day.max(1),
        }
    }

    /// Locate the deployment block of `address`, searching `[0, head]`.
    ///
    /// A contract with no code at `head` is a hard error. RPC trouble during
    /// the search degrades to an estimate instead of failing the caller.
    pub async fn locate(&self, address: Address, head: u64) -> Result<DeploymentInfo, LocateError> {
        let head_code = match self.transport.code_size_at(address, head).await {
            Ok(size) => size,
            Err(err) => {
                tracing::warn!(
                    %address,
                    head,
                    error = %err,
                    "code lookup at head failed; using fallback deployment estimate"
                );
                return Ok(self.fallback(head));
            }
        };
        if head_code == 0 {
            return Err(LocateError::NotDeployed { address, head });
        }

        // Invariant: code is present at `hi` and the answer lies in [lo, hi].
        let mut lo = 0u64;
        let mut hi = head;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.transport.code_size_at(address, mid).await {
                Ok(0) => lo = mid + 1,
                Ok(_) => hi = mid,
                Err(err) => {
                    tracing::warn!(
                        %address,
                        block = mid,
                        error = %err,
                        "code lookup failed mid-search; using fallback deployment estimate"
                    );
                    return Ok(self.fallback(head));
                }
            }
        }

        tracing::debug!(%address, block = lo, "located contract deployment");
        Ok(DeploymentInfo {
            block: lo,
            degraded: false,
        })
    }

    fn fallback(&self, head: u64) -> DeploymentInfo {
        DeploymentInfo {
            block: head.saturating_sub(FALLBACK_WINDOW_DAYS * self.blocks_per_day),
            degraded: true,
        }
    }
}
