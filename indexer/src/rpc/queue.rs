//! Tier-scoped admission queue: bounded concurrency plus a per-minute window.
//!
//! Calls that exceed the throughput ceiling are delayed, never rejected.
//! Limits can be swapped at runtime without touching in-flight work.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use tokio::time::{sleep, Instant};

const ADMIT_RETRY_DELAY: Duration = Duration::from_millis(25);
const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    pub max_concurrent: usize,
    pub requests_per_minute: usize,
}

#[derive(Debug)]
pub struct TieredQueue {
    limits: RwLock<QueueLimits>,
    inflight: AtomicUsize,
    window: Mutex<VecDeque<Instant>>,
    delayed: AtomicU64,
}

/// RAII admission token; releases the concurrency slot on drop.
#[derive(Debug)]
pub struct QueuePermit<'a> {
    queue: &'a TieredQueue,
}

impl Drop for QueuePermit<'_> {
    fn drop(&mut self) {
        self.queue.inflight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl TieredQueue {
    pub fn new(limits: QueueLimits) -> Self {
        Self {
            limits: RwLock::new(limits),
            inflight: AtomicUsize::new(0),
            window: Mutex::new(VecDeque::new()),
            delayed: AtomicU64::new(0),
        }
    }

    /// Swap limits at runtime. In-flight permits keep their slots; only new
    /// admissions see the new ceilings.
    pub fn set_limits(&self, limits: QueueLimits) {
        *self.limits.write().expect("queue limits lock poisoned") = limits;
    }

    pub fn limits(&self) -> QueueLimits {
        *self.limits.read().expect("queue limits lock poisoned")
    }

    /// Wait until both ceilings admit one more call.
    pub async fn admit(&self) -> QueuePermit<'_> {
        let mut waited = false;
        loop {
            if self.try_admit() {
                if waited {
                    self.delayed.fetch_add(1, Ordering::Relaxed);
                }
                return QueuePermit { queue: self };
            }
            waited = true;
            sleep(ADMIT_RETRY_DELAY).await;
        }
    }

    fn try_admit(&self) -> bool {
        let limits = self.limits();

        let acquired = self
            .inflight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < limits.max_concurrent).then_some(current + 1)
            })
            .is_ok();
        if !acquired {
            return false;
        }

        let mut window = self.window.lock().expect("queue window lock poisoned");
        let now = Instant::now();
        while let Some(front) = window.front() {
            if now.duration_since(*front) >= WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }
        if window.len() < limits.requests_per_minute {
            window.push_back(now);
            true
        } else {
            drop(window);
            self.inflight.fetch_sub(1, Ordering::SeqCst);
            false
        }
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    /// Number of admissions that had to wait for a ceiling.
    pub fn delayed(&self) -> u64 {
        self.delayed.load(Ordering::Relaxed)
    }
}
