//! Concurrent, throttled transfer of manifest entries.

pub mod orchestrator;
pub mod progress;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub use orchestrator::{
    download_or_skip, upload_or_freshen, Download, TransferPolicy, TransferSummary,
};
pub use progress::{NoProgress, ProgressReport, ProgressSink, StagedProgress};

/// Aggregate rate limit shared by every worker of one operation.
///
/// Workers report the bytes they are about to move; a worker is put to sleep
/// until the total moved so far fits under `bytes_per_second` since start.
#[derive(Debug)]
pub struct BandwidthLimiter {
    bytes_per_second: u64,
    start: Instant,
    consumed: AtomicU64,
}

impl BandwidthLimiter {
    pub fn new(bytes_per_second: u64) -> Self {
        Self {
            bytes_per_second: bytes_per_second.max(1),
            start: Instant::now(),
            consumed: AtomicU64::new(0),
        }
    }

    pub async fn acquire(&self, bytes: u64) {
        let total = self.consumed.fetch_add(bytes, Ordering::Relaxed) + bytes;
        let due = Duration::from_secs_f64(total as f64 / self.bytes_per_second as f64);
        let elapsed = self.start.elapsed();

        if due > elapsed {
            tokio::time::sleep(due - elapsed).await;
        }
    }
}

/// Byte counter for one transfer attempt, optionally throttled.
#[derive(Debug, Clone, Default)]
pub struct TransferMeter {
    limiter: Option<Arc<BandwidthLimiter>>,
    bytes: Arc<AtomicU64>,
}

impl TransferMeter {
    pub fn new(limiter: Option<Arc<BandwidthLimiter>>) -> Self {
        Self {
            limiter,
            bytes: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Count `bytes` and wait for the limiter, if any.
    pub async fn record(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        if let Some(limiter) = &self.limiter {
            limiter.acquire(bytes).await;
        }
    }

    pub fn transferred(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}
