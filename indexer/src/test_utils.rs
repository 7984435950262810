//! Shared test fixtures: a deterministic mock chain behind the
//! `RpcConnection` seam, plus helpers for transports, sessions, and the
//! pipeline.
//!
//! The mock chain emits one log every `log_interval` blocks starting at the
//! contract's deployment, and encodes the originating block number in the
//! trailing bytes of each transaction hash so detail lookups can be answered
//! without any stored state.

use crate::locate::DeploymentInfo;
use crate::pipeline::{ChunkIndexer, IndexerOptions, NullSink};
use crate::provider::{ProviderOrchestrator, DEFAULT_PROBE_INTERVAL};
use crate::rpc::{
    quantity, QueueLimits, RetryPolicy, RpcConnection, RpcError, RpcTransport, TransportConfig,
};
use crate::session::{Chunk, ChunkMetrics, IndexingSession, SessionHandle, SessionKey, SessionRegistry};
use crate::store::MemoryStore;
use crate::tier::RangeDecision;
use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub fn test_address(tag: u64) -> Address {
    let mut bytes = [0u8; 20];
    bytes[12..].copy_from_slice(&tag.to_be_bytes());
    Address::from(bytes)
}

pub fn test_hash(tag: u64) -> B256 {
    let mut bytes = [0u8; 32];
    bytes[24..].copy_from_slice(&tag.to_be_bytes());
    B256::from(bytes)
}

fn block_of_hash(hash: B256) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_slice()[24..]);
    u64::from_be_bytes(bytes)
}

fn hex_to_u64(value: &Value) -> u64 {
    let raw = value.as_str().expect("hex string param");
    u64::from_str_radix(raw.trim_start_matches("0x"), 16).expect("valid hex param")
}

/// Deterministic chain model served by `MockConnection`.
#[derive(Debug, Clone, Copy)]
pub struct MockChain {
    pub chain_id: u64,
    pub head: u64,
    pub contract: Address,
    pub deployment_block: u64,
    pub block_time_secs: u64,
    pub genesis_timestamp: u64,
    /// One log is emitted at every block divisible by this interval.
    pub log_interval: u64,
}

impl Default for MockChain {
    fn default() -> Self {
        Self {
            chain_id: 1,
            head: 1_000_000,
            contract: test_address(0xc0),
            deployment_block: 0,
            block_time_secs: 12,
            genesis_timestamp: 1_600_000_000,
            log_interval: 1_000,
        }
    }
}

impl MockChain {
    pub fn with_chain_id(chain_id: u64) -> Self {
        Self {
            chain_id,
            ..Self::default()
        }
    }

    pub fn with_head(mut self, head: u64) -> Self {
        self.head = head;
        self
    }

    pub fn with_deployment(mut self, block: u64) -> Self {
        self.deployment_block = block;
        self
    }

    fn emits_log_at(&self, block: u64) -> bool {
        block >= self.deployment_block && block % self.log_interval == 0
    }

    /// Logs the mock emits over the inclusive range `[from, to]`.
    pub fn expected_log_count(&self, from: u64, to: u64) -> usize {
        (from..=to).filter(|block| self.emits_log_at(*block)).count()
    }
}

/// In-memory JSON-RPC server with switchable failure modes.
pub struct MockConnection {
    chain: MockChain,
    head: AtomicU64,
    fail_all: AtomicBool,
    fail_timestamps: AtomicBool,
    fail_urls: Mutex<HashSet<String>>,
    fail_methods: Mutex<HashSet<String>>,
    total_requests: AtomicU64,
    per_method: Mutex<HashMap<String, u64>>,
}

impl MockConnection {
    pub fn new(chain: MockChain) -> Self {
        Self {
            head: AtomicU64::new(chain.head),
            chain,
            fail_all: AtomicBool::new(false),
            fail_timestamps: AtomicBool::new(false),
            fail_urls: Mutex::new(HashSet::new()),
            fail_methods: Mutex::new(HashSet::new()),
            total_requests: AtomicU64::new(0),
            per_method: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_failing_url(self, url: &str) -> Self {
        self.fail_urls
            .lock()
            .expect("mock lock")
            .insert(url.to_string());
        self
    }

    pub fn set_fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_timestamps(&self, fail: bool) {
        self.fail_timestamps.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_method(&self, method: &str) {
        self.fail_methods
            .lock()
            .expect("mock lock")
            .insert(method.to_string());
    }

    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    pub fn request_count(&self) -> u64 {
        self.total_requests.load(Ordering::SeqCst)
    }

    pub fn count_for_method(&self, method: &str) -> u64 {
        self.per_method
            .lock()
            .expect("mock lock")
            .get(method)
            .copied()
            .unwrap_or(0)
    }

    fn refuse(&self, url: &str, method: &str) -> bool {
        self.fail_all.load(Ordering::SeqCst)
            || self.fail_urls.lock().expect("mock lock").contains(url)
            || self.fail_methods.lock().expect("mock lock").contains(method)
    }

    fn log_json(&self, block: u64) -> Value {
        json!({
            "address": self.chain.contract.to_string(),
            "blockNumber": quantity(block),
            "transactionHash": test_hash(block).to_string(),
            "topics": [test_hash(0xfeed).to_string()],
        })
    }
}

#[async_trait]
impl RpcConnection for MockConnection {
    async fn request(&self, url: &str, method: &str, params: Value) -> Result<Value, RpcError> {
        self.total_requests.fetch_add(1, Ordering::SeqCst);
        *self
            .per_method
            .lock()
            .expect("mock lock")
            .entry(method.to_string())
            .or_insert(0) += 1;

        let failure = |reason: &str| RpcError::EndpointFailure {
            url: url.to_string(),
            method: method.to_string(),
            reason: reason.to_string(),
        };
        if self.refuse(url, method) {
            return Err(failure("mock refusal"));
        }

        match method {
            "eth_chainId" => Ok(json!(quantity(self.chain.chain_id))),
            "eth_blockNumber" => Ok(json!(quantity(self.head.load(Ordering::SeqCst)))),
            "eth_getCode" => {
                let address: Address = params[0]
                    .as_str()
                    .expect("address param")
                    .parse()
                    .expect("valid address param");
                let block = hex_to_u64(&params[1]);
                if address == self.chain.contract && block >= self.chain.deployment_block {
                    Ok(json!("0x6001600101"))
                } else {
                    Ok(json!("0x"))
                }
            }
            "eth_getLogs" => {
                let filter = &params[0];
                let address: Address = filter["address"]
                    .as_str()
                    .expect("filter address")
                    .parse()
                    .expect("valid filter address");
                let from = hex_to_u64(&filter["fromBlock"]);
                let to = hex_to_u64(&filter["toBlock"]);
                if address != self.chain.contract {
                    return Ok(json!([]));
                }
                let logs: Vec<Value> = (from..=to)
                    .filter(|block| self.chain.emits_log_at(*block))
                    .map(|block| self.log_json(block))
                    .collect();
                Ok(Value::Array(logs))
            }
            "eth_getTransactionByHash" => {
                let hash: B256 = params[0]
                    .as_str()
                    .expect("hash param")
                    .parse()
                    .expect("valid hash param");
                let block = block_of_hash(hash);
                if !self.chain.emits_log_at(block) {
                    return Ok(Value::Null);
                }
                Ok(json!({
                    "hash": hash.to_string(),
                    "blockNumber": quantity(block),
                    "from": test_address(0xf0).to_string(),
                    "to": self.chain.contract.to_string(),
                    "value": "0x1",
                }))
            }
            "eth_getTransactionReceipt" => {
                let hash: B256 = params[0]
                    .as_str()
                    .expect("hash param")
                    .parse()
                    .expect("valid hash param");
                let block = block_of_hash(hash);
                if !self.chain.emits_log_at(block) {
                    return Ok(Value::Null);
                }
                Ok(json!({
                    "transactionHash": hash.to_string(),
                    "blockNumber": quantity(block),
                    "status": "0x1",
                    "gasUsed": "0x5208",
                }))
            }
            "eth_getBlockByNumber" => {
                if self.fail_timestamps.load(Ordering::SeqCst) {
                    return Err(failure("timestamps disabled"));
                }
                let block = hex_to_u64(&params[0]);
                let timestamp = self.chain.genesis_timestamp + block * self.chain.block_time_secs;
                Ok(json!({
                    "number": quantity(block),
                    "timestamp": quantity(timestamp),
                }))
            }
            other => Err(failure(&format!("unsupported mock method {other}"))),
        }
    }
}

pub fn free_limits() -> QueueLimits {
    QueueLimits {
        max_concurrent: 2,
        requests_per_minute: 30,
    }
}

fn transport_with(
    chain_id: u64,
    urls: Vec<&str>,
    connection: Arc<dyn RpcConnection>,
    limits: QueueLimits,
) -> Arc<RpcTransport> {
    let config = TransportConfig::new(chain_id, urls.into_iter().map(String::from).collect());
    Arc::new(
        RpcTransport::new(config, RetryPolicy::default(), connection, limits)
            .expect("endpoints configured"),
    )
}

pub fn mock_transport(urls: Vec<&str>, connection: Arc<dyn RpcConnection>) -> Arc<RpcTransport> {
    transport_with(1, urls, connection, free_limits())
}

pub fn mock_transport_for_chain(
    chain_id: u64,
    urls: Vec<&str>,
    connection: Arc<dyn RpcConnection>,
) -> Arc<RpcTransport> {
    transport_with(
        chain_id,
        urls,
        connection,
        QueueLimits {
            max_concurrent: 8,
            requests_per_minute: 10_000,
        },
    )
}

pub fn test_decision(start_block: u64, end_block: u64) -> RangeDecision {
    RangeDecision {
        tier: "free".to_string(),
        start_block,
        end_block,
        clamped_to_deployment: false,
        fail_closed: false,
        continuous_sync: false,
        tx_batch_size: 5,
    }
}

pub fn test_chunk_metrics(chunk: &Chunk) -> ChunkMetrics {
    ChunkMetrics {
        index: chunk.index,
        start_block: chunk.start_block,
        end_block: chunk.end_block,
        blocks: chunk.len(),
        log_count: 0,
        tx_count: 0,
        unique_accounts: 0,
        unique_blocks: 0,
        cumulative_value: U256::ZERO,
        elapsed_ms: 1,
        blocks_per_sec: 0.0,
    }
}

fn handle_with(decision: RangeDecision, chunk_size: u64, tail: bool) -> Arc<SessionHandle> {
    let mut session = IndexingSession::new(
        SessionKey {
            account: "acct".to_string(),
            chain_id: 1,
            contract: MockChain::default().contract,
        },
        decision,
        DeploymentInfo {
            block: 0,
            degraded: false,
        },
        chunk_size,
    );
    if tail {
        session = session.with_tail();
    }
    SessionRegistry::new()
        .create(Arc::new(session))
        .expect("fresh registry accepts the session")
}

pub fn test_session_handle(start: u64, end: u64, chunk_size: u64) -> Arc<SessionHandle> {
    handle_with(test_decision(start, end), chunk_size, false)
}

/// A continuous-sync session that will hand off to the tail after backfill.
pub fn test_session_handle_sync(start: u64, end: u64, chunk_size: u64) -> Arc<SessionHandle> {
    let mut decision = test_decision(start, end);
    decision.continuous_sync = true;
    handle_with(decision, chunk_size, true)
}

/// A `ChunkIndexer` wired to a fresh in-memory store and one registered mock
/// provider serving `chain`.
pub async fn indexer_fixture(
    chain: MockChain,
    chunk_size: u64,
) -> (ChunkIndexer, Arc<MockConnection>) {
    let chain_id = chain.chain_id;
    let connection = Arc::new(MockConnection::new(chain));
    let transport = transport_with(
        chain_id,
        vec!["http://mock"],
        connection.clone(),
        QueueLimits {
            max_concurrent: 16,
            requests_per_minute: 100_000,
        },
    );
    let orchestrator = Arc::new(ProviderOrchestrator::new(DEFAULT_PROBE_INTERVAL));
    orchestrator
        .register("mock", transport)
        .await
        .expect("mock provider registers");
    let indexer = ChunkIndexer::new(
        orchestrator,
        Arc::new(MemoryStore::new()),
        Arc::new(NullSink),
        IndexerOptions {
            chunk_size,
            ..Default::default()
        },
    );
    (indexer, connection)
}
