//! Progress events emitted by the pipeline.

use crate::session::{ChunkMetrics, SessionKey};
use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub session: SessionKey,
    pub step: ProgressStep,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum ProgressStep {
    HeadObserved {
        head: u64,
    },
    DeploymentLocated {
        block: u64,
        degraded: bool,
    },
    RangeResolved {
        tier: String,
        start_block: u64,
        end_block: u64,
        fail_closed: bool,
    },
    ChunkStarted {
        index: usize,
        start_block: u64,
        end_block: u64,
    },
    ChunkCompleted {
        metrics: ChunkMetrics,
    },
    ChunkFailed {
        index: usize,
        reason: String,
    },
    TailTick {
        head: u64,
        lag: u64,
    },
    BackfillFinished,
}

/// Where the pipeline reports progress. Emission must never block indexing,
/// so sinks are synchronous and drop-tolerant.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// Fans events out to a session's broadcast channel. Lagging or absent
/// observers are ignored.
pub struct BroadcastSink {
    sender: broadcast::Sender<ProgressEvent>,
}

impl BroadcastSink {
    pub fn new(sender: broadcast::Sender<ProgressEvent>) -> Self {
        Self { sender }
    }
}

impl ProgressSink for BroadcastSink {
    fn emit(&self, event: ProgressEvent) {
        // send fails only when no observer is attached.
        let _ = self.sender.send(event);
    }
}

pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _event: ProgressEvent) {}
}
