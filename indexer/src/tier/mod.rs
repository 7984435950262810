//! Subscription tiers and the block range they entitle.
//!
//! The calculator turns an account's tier into a concrete `[start, end]`
//! block window for one chain. Lookup trouble fails closed: an account we
//! cannot resolve indexes under the most restrictive tier rather than being
//! rejected or silently over-served.

use crate::config::{ChainConfig, TierConfig, TierTable};
use async_trait::async_trait;
use eyre::{eyre, Result};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub account: String,
    pub tier: String,
}

#[derive(Debug, thiserror::Error)]
pub enum TierLookupError {
    #[error("no subscription on record for {account}")]
    Missing { account: String },
    #[error("subscription backend unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Source of truth for account subscriptions.
#[async_trait]
pub trait SubscriptionLookup: Send + Sync {
    async fn subscription(&self, account: &str) -> Result<SubscriptionInfo, TierLookupError>;
}

/// Fixed account-to-tier table, used by the CLI and in tests.
#[derive(Debug, Default)]
pub struct StaticSubscriptionLookup {
    entries: HashMap<String, String>,
}

impl StaticSubscriptionLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_account(mut self, account: impl Into<String>, tier: impl Into<String>) -> Self {
        self.entries.insert(account.into(), tier.into());
        self
    }
}

#[async_trait]
impl SubscriptionLookup for StaticSubscriptionLookup {
    async fn subscription(&self, account: &str) -> Result<SubscriptionInfo, TierLookupError> {
        self.entries
            .get(account)
            .map(|tier| SubscriptionInfo {
                account: account.to_string(),
                tier: tier.clone(),
            })
            .ok_or_else(|| TierLookupError::Missing {
                account: account.to_string(),
            })
    }
}

/// The indexing window granted to an account on one chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeDecision {
    pub tier: String,
    /// First block to index.
    pub start_block: u64,
    /// Last block to index, inclusive.
    pub end_block: u64,
    /// True when the tier window reaches further back than the contract
    /// exists and the start was clamped to the deployment block.
    pub clamped_to_deployment: bool,
    /// True when the tier could not be resolved and the most restrictive
    /// tier was applied instead.
    pub fail_closed: bool,
    pub continuous_sync: bool,
    pub tx_batch_size: usize,
}

pub struct TierRangeCalculator {
    lookup: Arc<dyn SubscriptionLookup>,
    tiers: TierTable,
}

impl TierRangeCalculator {
    pub fn new(lookup: Arc<dyn SubscriptionLookup>, tiers: TierTable) -> Result<Self> {
        if tiers.is_empty() {
            return Err(eyre!("tier table is empty; nothing to fail closed to"));
        }
        Ok(Self { lookup, tiers })
    }

    /// Resolve `account`'s tier and compute the block window it entitles on
    /// `chain`, given the contract's deployment block and the current head.
    pub async fn decide(
        &self,
        account: &str,
        chain: &ChainConfig,
        deployment_block: u64,
        current_block: u64,
    ) -> Result<RangeDecision> {
        let (tier, fail_closed) = self.resolve_tier(account).await?;
        let window = tier.historical_days.saturating_mul(chain.blocks_per_day);
        let earliest = current_block.saturating_sub(window);
        let clamped_to_deployment = deployment_block > earliest;
        let start_block = earliest.max(deployment_block).min(current_block);

        tracing::info!(
            account,
            tier = %tier.name,
            chain = %chain.name,
            start_block,
            end_block = current_block,
            clamped_to_deployment,
            fail_closed,
            "resolved indexing range"
        );
        Ok(RangeDecision {
            tier: tier.name.clone(),
            start_block,
            end_block: current_block,
            clamped_to_deployment,
            fail_closed,
            continuous_sync: tier.continuous_sync,
            tx_batch_size: tier.tx_batch_size,
        })
    }

    async fn resolve_tier(&self, account: &str) -> Result<(&TierConfig, bool)> {
        let named = match self.lookup.subscription(account).await {
            Ok(info) => match self.tiers.get(&info.tier) {
                Some(tier) => Some(tier),
                None => {
                    tracing::warn!(
                        account,
                        tier = %info.tier,
                        "subscription names an unknown tier; failing closed"
                    );
                    None
                }
            },
            Err(err) => {
                tracing::warn!(account, error = %err, "subscription lookup failed; failing closed");
                None
            }
        };
        match named {
            Some(tier) => Ok((tier, false)),
            None => {
                let tier = self
                    .tiers
                    .most_restrictive()
                    .ok_or_else(|| eyre!("tier table is empty"))?;
                Ok((tier, true))
            }
        }
    }
}
