//! Provider registry and failover orchestration across chains.
//!
//! A `Provider` wraps one chain transport with liveness bookkeeping. The
//! orchestrator validates providers at registration, routes operations to
//! healthy providers first, and runs a background probe loop that keeps the
//! health flags current.

use crate::rpc::{EndpointSnapshot, RpcError, RpcTransport};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("no providers registered for chain {chain_id}")]
    UnknownChain { chain_id: u64 },
    #[error("provider {name} reports chain {reported}, expected {expected}")]
    ChainMismatch {
        name: String,
        expected: u64,
        reported: u64,
    },
    #[error("could not validate provider {name}: {source}")]
    ValidationFailed {
        name: String,
        #[source]
        source: RpcError,
    },
    #[error("all {providers} providers for chain {chain_id} failed")]
    AllProvidersExhausted { chain_id: u64, providers: usize },
}

/// One registered upstream for a chain.
pub struct Provider {
    pub name: String,
    pub transport: Arc<RpcTransport>,
    healthy: AtomicBool,
    last_head: AtomicU64,
    last_probe_unix_ms: AtomicU64,
}

impl Provider {
    fn new(name: String, transport: Arc<RpcTransport>) -> Self {
        Self {
            name,
            transport,
            healthy: AtomicBool::new(true),
            last_head: AtomicU64::new(0),
            last_probe_unix_ms: AtomicU64::new(0),
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.transport.chain_id()
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    fn mark(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    fn record_probe(&self, head: Option<u64>) {
        if let Some(head) = head {
            self.last_head.store(head, Ordering::Relaxed);
        }
        self.last_probe_unix_ms.store(unix_ms(), Ordering::Relaxed);
        self.mark(head.is_some());
    }

    pub fn snapshot(&self) -> ProviderSnapshot {
        ProviderSnapshot {
            name: self.name.clone(),
            chain_id: self.chain_id(),
            healthy: self.is_healthy(),
            last_head: self.last_head.load(Ordering::Relaxed),
            last_probe_unix_ms: self.last_probe_unix_ms.load(Ordering::Relaxed),
            endpoints: self.transport.endpoint_snapshots(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderSnapshot {
    pub name: String,
    pub chain_id: u64,
    pub healthy: bool,
    pub last_head: u64,
    pub last_probe_unix_ms: u64,
    pub endpoints: Vec<EndpointSnapshot>,
}

pub struct ProviderOrchestrator {
    providers: RwLock<HashMap<u64, Vec<Arc<Provider>>>>,
    probe_interval: Duration,
}

impl ProviderOrchestrator {
    pub fn new(probe_interval: Duration) -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            probe_interval,
        }
    }

    /// Register a provider after confirming the node really serves the chain
    /// the transport was configured for.
    pub async fn register(
        &self,
        name: impl Into<String>,
        transport: Arc<RpcTransport>,
    ) -> Result<Arc<Provider>, OrchestratorError> {
        let name = name.into();
        let expected = transport.chain_id();
        let reported =
            transport
                .node_chain_id()
                .await
                .map_err(|source| OrchestratorError::ValidationFailed {
                    name: name.clone(),
                    source,
                })?;
        if reported != expected {
            return Err(OrchestratorError::ChainMismatch {
                name,
                expected,
                reported,
            });
        }

        tracing::info!(provider = %name, chain_id = expected, "registered provider");
        let provider = Arc::new(Provider::new(name, transport));
        self.providers
            .write()
            .expect("provider lock poisoned")
            .entry(expected)
            .or_default()
            .push(provider.clone());
        Ok(provider)
    }

    /// Providers to try for a chain: healthy ones in registration order, and
    /// unhealthy ones after them as a last resort.
    fn candidates(&self, chain_id: u64) -> Result<Vec<Arc<Provider>>, OrchestratorError> {
        let providers = self.providers.read().expect("provider lock poisoned");
        let all = providers
            .get(&chain_id)
            .filter(|list| !list.is_empty())
            .ok_or(OrchestratorError::UnknownChain { chain_id })?;
        let (healthy, unhealthy): (Vec<_>, Vec<_>) =
            all.iter().cloned().partition(|provider| provider.is_healthy());
        Ok(healthy.into_iter().chain(unhealthy).collect())
    }

    /// Run `operation` against providers for `chain_id` until one succeeds.
    /// A failing provider is marked unhealthy and skipped on the next call
    /// until a probe or a later success revives it.
    pub async fn execute_with_failover<T, F, Fut>(
        &self,
        chain_id: u64,
        operation: F,
    ) -> Result<T, OrchestratorError>
    where
        F: Fn(Arc<Provider>) -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let candidates = self.candidates(chain_id)?;
        let total = candidates.len();
        for provider in candidates {
            match operation(provider.clone()).await {
                Ok(value) => {
                    provider.mark(true);
                    return Ok(value);
                }
                Err(err) => {
                    provider.mark(false);
                    tracing::warn!(
                        provider = %provider.name,
                        chain_id,
                        error = %err,
                        "provider failed; trying next"
                    );
                }
            }
        }
        Err(OrchestratorError::AllProvidersExhausted {
            chain_id,
            providers: total,
        })
    }

    pub fn snapshots(&self) -> Vec<ProviderSnapshot> {
        let providers = self.providers.read().expect("provider lock poisoned");
        let mut snapshots: Vec<_> = providers
            .values()
            .flatten()
            .map(|provider| provider.snapshot())
            .collect();
        snapshots.sort_by(|a, b| (a.chain_id, &a.name).cmp(&(b.chain_id, &b.name)));
        snapshots
    }

    fn all_providers(&self) -> Vec<Arc<Provider>> {
        self.providers
            .read()
            .expect("provider lock poisoned")
            .values()
            .flatten()
            .cloned()
            .collect()
    }

    /// Probe every provider once, updating health flags and last seen heads.
    pub async fn probe_all(&self) {
        for provider in self.all_providers() {
            let head = provider.transport.block_number().await.ok();
            if head.is_none() && provider.is_healthy() {
                tracing::warn!(
                    provider = %provider.name,
                    chain_id = provider.chain_id(),
                    "health probe failed; provider marked unhealthy"
                );
            }
            provider.record_probe(head);
        }
    }

    /// Background probe loop. Runs until `stop` flips to true.
    pub fn spawn_health_probe(
        self: &Arc<Self>,
        mut stop: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(orchestrator.probe_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => orchestrator.probe_all().await,
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            tracing::debug!("health probe loop stopping");
                            return;
                        }
                    }
                }
            }
        })
    }
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
