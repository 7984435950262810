//! Per-endpoint call bookkeeping.

use serde::Serialize;

const LATENCY_EWMA_WEIGHT: f64 = 0.2;

/// Mutable state for one configured endpoint URL. Owned exclusively by the
/// transport that dialed it and updated after every call.
#[derive(Debug)]
pub(crate) struct EndpointState {
    pub url: String,
    pub healthy: bool,
    pub consecutive_failures: u32,
    /// EWMA of observed latency in milliseconds; 0 until the first success.
    pub latency_ms: f64,
    pub last_error: Option<String>,
    pub successes: u64,
    pub failures: u64,
}

impl EndpointState {
    pub fn new(url: String) -> Self {
        Self {
            url,
            healthy: true,
            consecutive_failures: 0,
            latency_ms: 0.0,
            last_error: None,
            successes: 0,
            failures: 0,
        }
    }

    /// A successful call clears the failure streak and re-marks the endpoint
    /// healthy.
    pub fn record_success(&mut self, latency_ms: f64) {
        self.successes = self.successes.saturating_add(1);
        self.consecutive_failures = 0;
        self.healthy = true;
        self.latency_ms = if self.latency_ms == 0.0 {
            latency_ms
        } else {
            self.latency_ms * (1.0 - LATENCY_EWMA_WEIGHT) + latency_ms * LATENCY_EWMA_WEIGHT
        };
    }

    /// Returns true if this failure crossed the unhealthy threshold.
    pub fn record_failure(&mut self, reason: String, unhealthy_after: u32) -> bool {
        self.failures = self.failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_error = Some(reason);
        let newly_unhealthy = self.healthy && self.consecutive_failures >= unhealthy_after;
        if newly_unhealthy {
            self.healthy = false;
        }
        newly_unhealthy
    }

    pub fn snapshot(&self) -> EndpointSnapshot {
        EndpointSnapshot {
            url: self.url.clone(),
            healthy: self.healthy,
            consecutive_failures: self.consecutive_failures,
            latency_ms: self.latency_ms,
            last_error: self.last_error.clone(),
            successes: self.successes,
            failures: self.failures,
        }
    }
}

/// Read-only view of an endpoint's health, for diagnostics and summaries.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointSnapshot {
    pub url: String,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub latency_ms: f64,
    pub last_error: Option<String>,
    pub successes: u64,
    pub failures: u64,
}
