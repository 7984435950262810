//! Round-robin failover transport for one chain.
//!
//! One `RpcTransport` owns an ordered endpoint list and is the only writer of
//! their health state. A logical `execute` checks the response cache, passes
//! the tiered admission queue, and then rotates through the endpoints for up
//! to `retries` full rounds before giving up.

use super::cache::ResponseCache;
use super::connection::RpcConnection;
use super::endpoint::{EndpointSnapshot, EndpointState};
use super::queue::{QueueLimits, TieredQueue};
use super::types::{
    parse_log, parse_quantity, parse_receipt, parse_transaction, quantity, LogRecord,
    ReceiptRecord, TxRecord,
};
use super::RpcError;
use alloy_primitives::{Address, B256};
use eyre::{eyre, Result};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::{sleep, timeout, Instant};

/// Methods whose answers depend on live node state and must never be served
/// from cache.
const NON_CACHEABLE_METHODS: &[&str] = &[
    "eth_blockNumber",
    "eth_getFilterChanges",
    "eth_newFilter",
    "eth_newPendingTransactionFilter",
    "eth_syncing",
];

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub chain_id: u64,
    pub endpoints: Vec<String>,
    /// Full rotation rounds before `TransportExhausted`; total attempts are
    /// bounded by `retries * endpoints.len()`.
    pub retries: u32,
    pub call_timeout: Duration,
    pub cache_ttl: Duration,
    pub cache_capacity: usize,
    pub error_log_capacity: usize,
    pub unhealthy_after: u32,
    /// Chain block interval, used for timestamp extrapolation.
    pub avg_block_time: Duration,
}

impl TransportConfig {
    pub fn new(chain_id: u64, endpoints: Vec<String>) -> Self {
        Self {
            chain_id,
            endpoints,
            retries: 2,
            call_timeout: Duration::from_secs(30),
            cache_ttl: Duration::from_secs(60),
            cache_capacity: 1024,
            error_log_capacity: 128,
            unhealthy_after: 3,
            avg_block_time: Duration::from_secs(12),
        }
    }

    pub fn with_avg_block_time(mut self, avg_block_time: Duration) -> Self {
        self.avg_block_time = avg_block_time;
        self
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }
}

/// Centralized backoff strategy, shared by every chain client.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// One failed call, with enough context to diagnose provider-specific
/// patterns after the fact.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub url: String,
    pub method: String,
    pub params: String,
    pub attempt: u32,
    pub at_unix_ms: u64,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TransportStats {
    pub successes: u64,
    pub failures: u64,
    pub cache_hits: u64,
    pub rate_limit_delays: u64,
}

/// A block timestamp, exact or extrapolated from the nearest known block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockTimestamp {
    pub block: u64,
    pub timestamp: u64,
    pub estimated: bool,
}

pub struct RpcTransport {
    config: TransportConfig,
    retry: RetryPolicy,
    connection: Arc<dyn RpcConnection>,
    endpoints: Mutex<Vec<EndpointState>>,
    cursor: AtomicUsize,
    cache: ResponseCache,
    queue: TieredQueue,
    errors: Mutex<VecDeque<ErrorRecord>>,
    timestamps: Mutex<BTreeMap<u64, u64>>,
    successes: AtomicU64,
    failures: AtomicU64,
    cache_hits: AtomicU64,
}

impl RpcTransport {
    pub fn new(
        config: TransportConfig,
        retry: RetryPolicy,
        connection: Arc<dyn RpcConnection>,
        limits: QueueLimits,
    ) -> Result<Self> {
        if config.endpoints.is_empty() {
            return Err(eyre!(
                "chain {} transport configured with no endpoints",
                config.chain_id
            ));
        }
        let endpoints = config
            .endpoints
            .iter()
            .cloned()
            .map(EndpointState::new)
            .collect();
        Ok(Self {
            cache: ResponseCache::new(config.cache_ttl, config.cache_capacity),
            queue: TieredQueue::new(limits),
            config,
            retry,
            connection,
            endpoints: Mutex::new(endpoints),
            cursor: AtomicUsize::new(0),
            errors: Mutex::new(VecDeque::new()),
            timestamps: Mutex::new(BTreeMap::new()),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
        })
    }

    pub fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    /// Reconfigure the admission queue for a new tier. In-flight calls keep
    /// their slots.
    pub fn set_tier(&self, limits: QueueLimits) {
        tracing::debug!(
            chain_id = self.config.chain_id,
            max_concurrent = limits.max_concurrent,
            requests_per_minute = limits.requests_per_minute,
            "retiered transport queue"
        );
        self.queue.set_limits(limits);
    }

    pub fn queue_limits(&self) -> QueueLimits {
        self.queue.limits()
    }

    /// Execute one logical JSON-RPC call with caching, admission, and
    /// round-robin failover.
    pub async fn execute(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let cache_key = self
            .is_cacheable(method)
            .then(|| format!("{method}:{params}"));
        if let Some(key) = &cache_key {
            if let Some(hit) = self.cache.get(key) {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(hit);
            }
        }

        let _permit = self.queue.admit().await;

        let endpoint_count = self.endpoint_count();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        let mut attempts = 0u32;

        for round in 0..self.config.retries.max(1) {
            if round > 0 {
                sleep(self.retry.delay_for(round - 1)).await;
            }
            for offset in 0..endpoint_count {
                let index = (start + offset) % endpoint_count;
                let url = self.endpoint_url(index);
                attempts += 1;

                let started = Instant::now();
                let outcome = match timeout(
                    self.config.call_timeout,
                    self.connection.request(&url, method, params.clone()),
                )
                .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => Err(RpcError::EndpointFailure {
                        url: url.clone(),
                        method: method.to_string(),
                        reason: format!("timed out after {:?}", self.config.call_timeout),
                    }),
                };

                match outcome {
                    Ok(value) => {
                        let latency_ms = started.elapsed().as_secs_f64() * 1_000.0;
                        self.record_success(index, latency_ms);
                        if let Some(key) = &cache_key {
                            self.cache.insert(key.clone(), value.clone());
                        }
                        self.successes.fetch_add(1, Ordering::Relaxed);
                        return Ok(value);
                    }
                    Err(err) => {
                        self.record_failure(index, method, &params, attempts, &err);
                        tracing::debug!(
                            chain_id = self.config.chain_id,
                            url = %url,
                            method,
                            attempt = attempts,
                            error = %err,
                            "endpoint call failed; rotating"
                        );
                    }
                }
            }
        }

        self.failures.fetch_add(1, Ordering::Relaxed);
        Err(RpcError::TransportExhausted {
            method: method.to_string(),
            endpoints: endpoint_count,
            attempts,
        })
    }

    fn is_cacheable(&self, method: &str) -> bool {
        !NON_CACHEABLE_METHODS.contains(&method)
    }

    fn endpoint_count(&self) -> usize {
        self.endpoints.lock().expect("endpoint lock poisoned").len()
    }

    fn endpoint_url(&self, index: usize) -> String {
        self.endpoints.lock().expect("endpoint lock poisoned")[index]
            .url
            .clone()
    }

    fn record_success(&self, index: usize, latency_ms: f64) {
        let mut endpoints = self.endpoints.lock().expect("endpoint lock poisoned");
        endpoints[index].record_success(latency_ms);
    }

    fn record_failure(
        &self,
        index: usize,
        method: &str,
        params: &Value,
        attempt: u32,
        err: &RpcError,
    ) {
        let url = {
            let mut endpoints = self.endpoints.lock().expect("endpoint lock poisoned");
            let endpoint = &mut endpoints[index];
            let newly_unhealthy =
                endpoint.record_failure(err.to_string(), self.config.unhealthy_after);
            if newly_unhealthy {
                tracing::warn!(
                    chain_id = self.config.chain_id,
                    url = %endpoint.url,
                    consecutive_failures = endpoint.consecutive_failures,
                    "endpoint marked unhealthy"
                );
            }
            endpoint.url.clone()
        };

        let mut errors = self.errors.lock().expect("error log lock poisoned");
        if errors.len() >= self.config.error_log_capacity {
            errors.pop_front();
        }
        errors.push_back(ErrorRecord {
            url,
            method: method.to_string(),
            params: params.to_string(),
            attempt,
            at_unix_ms: unix_ms(),
            reason: err.to_string(),
        });
    }

    pub fn endpoint_snapshots(&self) -> Vec<EndpointSnapshot> {
        self.endpoints
            .lock()
            .expect("endpoint lock poisoned")
            .iter()
            .map(EndpointState::snapshot)
            .collect()
    }

    pub fn has_healthy_endpoint(&self) -> bool {
        self.endpoints
            .lock()
            .expect("endpoint lock poisoned")
            .iter()
            .any(|endpoint| endpoint.healthy)
    }

    pub fn recent_errors(&self) -> Vec<ErrorRecord> {
        self.errors
            .lock()
            .expect("error log lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            rate_limit_delays: self.queue.delayed(),
        }
    }

    // Typed helpers over `execute`.

    pub async fn block_number(&self) -> Result<u64, RpcError> {
        let value = self.execute("eth_blockNumber", json!([])).await?;
        parse_quantity(&value, "eth_blockNumber")
    }

    pub async fn node_chain_id(&self) -> Result<u64, RpcError> {
        let value = self.execute("eth_chainId", json!([])).await?;
        parse_quantity(&value, "eth_chainId")
    }

    /// Deployed bytecode size at a given height; 0 means no code.
    pub async fn code_size_at(&self, address: Address, block: u64) -> Result<usize, RpcError> {
        let value = self
            .execute("eth_getCode", json!([address.to_string(), quantity(block)]))
            .await?;
        let raw = value.as_str().ok_or_else(|| RpcError::MalformedResponse {
            method: "eth_getCode".to_string(),
            reason: format!("expected hex string, got {value}"),
        })?;
        Ok(raw.strip_prefix("0x").unwrap_or(raw).len() / 2)
    }

    /// Event logs for `address` over the inclusive block range `[from, to]`.
    pub async fn get_logs(
        &self,
        address: Address,
        from: u64,
        to: u64,
    ) -> Result<Vec<LogRecord>, RpcError> {
        let params = json!([{
            "address": address.to_string(),
            "fromBlock": quantity(from),
            "toBlock": quantity(to),
        }]);
        let value = self.execute("eth_getLogs", params).await?;
        let raw = value.as_array().ok_or_else(|| RpcError::MalformedResponse {
            method: "eth_getLogs".to_string(),
            reason: format!("expected array, got {value}"),
        })?;
        raw.iter().map(|log| parse_log(log, "eth_getLogs")).collect()
    }

    pub async fn get_transaction(&self, hash: B256) -> Result<Option<TxRecord>, RpcError> {
        let value = self
            .execute("eth_getTransactionByHash", json!([hash.to_string()]))
            .await?;
        if value.is_null() {
            return Ok(None);
        }
        parse_transaction(&value, "eth_getTransactionByHash").map(Some)
    }

    pub async fn get_receipt(&self, hash: B256) -> Result<Option<ReceiptRecord>, RpcError> {
        let value = self
            .execute("eth_getTransactionReceipt", json!([hash.to_string()]))
            .await?;
        if value.is_null() {
            return Ok(None);
        }
        parse_receipt(&value, "eth_getTransactionReceipt").map(Some)
    }

    /// Timestamp for a block, cached per block id. If the chain lookup fails,
    /// extrapolates from the nearest known block using the configured block
    /// interval; the result is flagged estimated, never silently "now".
    pub async fn block_timestamp(&self, block: u64) -> Result<BlockTimestamp, RpcError> {
        let cached = {
            let timestamps = self.timestamps.lock().expect("timestamp lock poisoned");
            timestamps.get(&block).copied()
        };
        if let Some(timestamp) = cached {
            return Ok(BlockTimestamp {
                block,
                timestamp,
                estimated: false,
            });
        }

        match self
            .execute("eth_getBlockByNumber", json!([quantity(block), false]))
            .await
        {
            Ok(value) => {
                let raw = value
                    .get("timestamp")
                    .ok_or_else(|| RpcError::MalformedResponse {
                        method: "eth_getBlockByNumber".to_string(),
                        reason: "block missing timestamp".to_string(),
                    })?;
                let timestamp = parse_quantity(raw, "eth_getBlockByNumber")?;
                self.timestamps
                    .lock()
                    .expect("timestamp lock poisoned")
                    .insert(block, timestamp);
                Ok(BlockTimestamp {
                    block,
                    timestamp,
                    estimated: false,
                })
            }
            Err(err) => {
                tracing::warn!(
                    chain_id = self.config.chain_id,
                    block,
                    error = %err,
                    "timestamp lookup failed; extrapolating from nearest known block"
                );
                self.extrapolate_timestamp(block)
            }
        }
    }

    fn extrapolate_timestamp(&self, block: u64) -> Result<BlockTimestamp, RpcError> {
        let timestamps = self.timestamps.lock().expect("timestamp lock poisoned");
        let below = timestamps.range(..=block).next_back();
        let above = timestamps.range(block..).next();
        let nearest = match (below, above) {
            (Some((&lo, &lo_ts)), Some((&hi, &hi_ts))) => {
                if block - lo <= hi - block {
                    Some((lo, lo_ts))
                } else {
                    Some((hi, hi_ts))
                }
            }
            (Some((&lo, &lo_ts)), None) => Some((lo, lo_ts)),
            (None, Some((&hi, &hi_ts))) => Some((hi, hi_ts)),
            (None, None) => None,
        };
        let Some((known_block, known_ts)) = nearest else {
            return Err(RpcError::NoTimestampReference { block });
        };

        let interval = self.config.avg_block_time.as_secs_f64();
        let timestamp = if block >= known_block {
            known_ts.saturating_add(((block - known_block) as f64 * interval) as u64)
        } else {
            known_ts.saturating_sub(((known_block - block) as f64 * interval) as u64)
        };
        Ok(BlockTimestamp {
            block,
            timestamp,
            estimated: true,
        })
    }
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
