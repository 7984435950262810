//! Chain and tier configuration tables, validated at startup.
//!
//! Chains differ in block time and therefore blocks/day; tiers differ in
//! historical window and usage ceilings. Both are explicit enumerated tables
//! loaded once and validated before anything dials out, never runtime string
//! dispatch.

use crate::rpc::QueueLimits;
use eyre::{eyre, Result, WrapErr};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CHUNK_SIZE: u64 = 200_000;

/// Per-chain configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainConfig {
    pub name: String,
    pub chain_id: u64,
    /// Ordered endpoint URLs; first is preferred, the rest are failover.
    pub endpoints: Vec<String>,
    pub avg_block_time_ms: u64,
    pub blocks_per_day: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

impl ChainConfig {
    pub fn avg_block_time(&self) -> Duration {
        Duration::from_millis(self.avg_block_time_ms)
    }
}

/// Per-tier usage ceilings and historical window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TierConfig {
    pub name: String,
    pub historical_days: u64,
    pub max_concurrent: usize,
    pub requests_per_minute: usize,
    /// Width of batched transaction-detail fetches inside a chunk.
    pub tx_batch_size: usize,
    pub continuous_sync: bool,
}

impl TierConfig {
    pub fn queue_limits(&self) -> QueueLimits {
        QueueLimits {
            max_concurrent: self.max_concurrent,
            requests_per_minute: self.requests_per_minute,
        }
    }
}

/// Ordered tier table with a fail-closed default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TierTable {
    tiers: Vec<TierConfig>,
}

impl TierTable {
    pub fn new(tiers: Vec<TierConfig>) -> Self {
        Self { tiers }
    }

    pub fn get(&self, name: &str) -> Option<&TierConfig> {
        self.tiers.iter().find(|tier| tier.name == name)
    }

    /// The tier used when a subscription lookup fails: smallest window first,
    /// lowest throughput as the tie-breaker. None only for an empty table.
    pub fn most_restrictive(&self) -> Option<&TierConfig> {
        self.tiers
            .iter()
            .min_by_key(|tier| (tier.historical_days, tier.requests_per_minute))
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }
}

/// Full application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    pub chains: Vec<ChainConfig>,
    pub tiers: Vec<TierConfig>,
}

impl AppConfig {
    /// Load and validate a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read config file {}", path.display()))?;
        let config: AppConfig = serde_json::from_str(&raw)
            .wrap_err_with(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Built-in tables for common chains and the standard subscription plans.
    pub fn builtin() -> Self {
        Self {
            chains: vec![
                ChainConfig {
                    name: "ethereum".to_string(),
                    chain_id: 1,
                    endpoints: vec![
                        "https://eth.llamarpc.com".to_string(),
                        "https://rpc.ankr.com/eth".to_string(),
                        "https://ethereum.publicnode.com".to_string(),
                    ],
                    avg_block_time_ms: 12_000,
                    blocks_per_day: 7_200,
                    chunk_size: DEFAULT_CHUNK_SIZE,
                },
                ChainConfig {
                    name: "polygon".to_string(),
                    chain_id: 137,
                    endpoints: vec![
                        "https://polygon-rpc.com".to_string(),
                        "https://rpc.ankr.com/polygon".to_string(),
                    ],
                    avg_block_time_ms: 2_000,
                    blocks_per_day: 43_200,
                    chunk_size: DEFAULT_CHUNK_SIZE,
                },
                ChainConfig {
                    name: "base".to_string(),
                    chain_id: 8453,
                    endpoints: vec![
                        "https://mainnet.base.org".to_string(),
                        "https://base.llamarpc.com".to_string(),
                    ],
                    avg_block_time_ms: 2_000,
                    blocks_per_day: 43_200,
                    chunk_size: DEFAULT_CHUNK_SIZE,
                },
            ],
            tiers: vec![
                TierConfig {
                    name: "free".to_string(),
                    historical_days: 30,
                    max_concurrent: 2,
                    requests_per_minute: 30,
                    tx_batch_size: 5,
                    continuous_sync: false,
                },
                TierConfig {
                    name: "starter".to_string(),
                    historical_days: 90,
                    max_concurrent: 4,
                    requests_per_minute: 120,
                    tx_batch_size: 10,
                    continuous_sync: false,
                },
                TierConfig {
                    name: "professional".to_string(),
                    historical_days: 365,
                    max_concurrent: 8,
                    requests_per_minute: 300,
                    tx_batch_size: 20,
                    continuous_sync: true,
                },
                TierConfig {
                    name: "enterprise".to_string(),
                    historical_days: 730,
                    max_concurrent: 16,
                    requests_per_minute: 600,
                    tx_batch_size: 40,
                    continuous_sync: true,
                },
            ],
        }
    }

    pub fn chain_by_name(&self, name: &str) -> Option<&ChainConfig> {
        self.chains.iter().find(|chain| chain.name == name)
    }

    pub fn chain_by_id(&self, chain_id: u64) -> Option<&ChainConfig> {
        self.chains.iter().find(|chain| chain.chain_id == chain_id)
    }

    pub fn tier_table(&self) -> TierTable {
        TierTable::new(self.tiers.clone())
    }

    pub fn validate(&self) -> Result<()> {
        if self.chains.is_empty() {
            return Err(eyre!("no chains configured"));
        }
        if self.tiers.is_empty() {
            return Err(eyre!("no tiers configured"));
        }

        let mut chain_ids = HashSet::new();
        for chain in &self.chains {
            if !chain_ids.insert(chain.chain_id) {
                return Err(eyre!("duplicate chain id {}", chain.chain_id));
            }
            if chain.endpoints.is_empty() {
                return Err(eyre!("chain {} has no endpoints", chain.name));
            }
            if chain.avg_block_time_ms == 0 {
                return Err(eyre!("chain {} has zero block time", chain.name));
            }
            if chain.blocks_per_day == 0 {
                return Err(eyre!("chain {} has zero blocks/day", chain.name));
            }
            if chain.chunk_size == 0 {
                return Err(eyre!("chain {} has zero chunk size", chain.name));
            }
        }

        let mut tier_names = HashSet::new();
        for tier in &self.tiers {
            if !tier_names.insert(tier.name.as_str()) {
                return Err(eyre!("duplicate tier {}", tier.name));
            }
            if tier.historical_days == 0 {
                return Err(eyre!("tier {} has zero historical window", tier.name));
            }
            if tier.max_concurrent == 0 || tier.requests_per_minute == 0 {
                return Err(eyre!("tier {} has zero usage ceiling", tier.name));
            }
            if tier.tx_batch_size == 0 {
                return Err(eyre!("tier {} has zero batch width", tier.name));
            }
        }

        Ok(())
    }
}
