//! Transfer progress: reports, sinks and speed tracking.

use super::TransferSummary;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Progress of one upload or download run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgressReport {
    /// Entries transferred or freshened so far
    pub completed_entries: usize,

    pub total_entries: usize,

    /// Entries skipped because the destination was already current
    pub freshened_entries: usize,

    /// Bytes moved over the wire, including in-flight entries
    pub transferred_bytes: u64,

    pub total_bytes: u64,

    pub bytes_per_second: u64,

    pub eta_seconds: u64,
}

impl ProgressReport {
    /// Completion in `[0, 1]`, by entry count. An empty run is complete.
    pub fn fraction(&self) -> f64 {
        if self.total_entries == 0 {
            return 1.0;
        }
        (self.completed_entries as f64 / self.total_entries as f64).min(1.0)
    }

    pub fn is_complete(&self) -> bool {
        self.completed_entries >= self.total_entries
    }
}

/// Receives progress while entries are transferred.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, report: ProgressReport);
}

/// Sink that drops every report
pub struct NoProgress;

#[async_trait]
impl ProgressSink for NoProgress {
    async fn report(&self, _report: ProgressReport) {}
}

/// Presents several consecutive runs as one: reports of the current run are
/// offset by what earlier runs completed and scaled to the overall totals.
pub struct StagedProgress {
    inner: Arc<dyn ProgressSink>,
    done_entries: usize,
    done_freshened: usize,
    done_bytes: u64,
    total_entries: usize,
    total_bytes: u64,
}

impl StagedProgress {
    pub fn new(inner: Arc<dyn ProgressSink>, total_entries: usize, total_bytes: u64) -> Self {
        Self {
            inner,
            done_entries: 0,
            done_freshened: 0,
            done_bytes: 0,
            total_entries,
            total_bytes,
        }
    }

    /// Offset reports by the finished run `earlier`.
    pub fn after(mut self, earlier: &TransferSummary) -> Self {
        self.done_entries += earlier.entries;
        self.done_freshened += earlier.freshened_entries;
        self.done_bytes += earlier.transferred_bytes;
        self
    }
}

#[async_trait]
impl ProgressSink for StagedProgress {
    async fn report(&self, report: ProgressReport) {
        self.inner
            .report(ProgressReport {
                completed_entries: self.done_entries + report.completed_entries,
                total_entries: self.total_entries,
                freshened_entries: self.done_freshened + report.freshened_entries,
                transferred_bytes: self.done_bytes + report.transferred_bytes,
                total_bytes: self.total_bytes,
                ..report
            })
            .await;
    }
}

/// Turns raw counters into reports with speed and ETA.
pub struct ProgressTracker {
    start_time: Instant,
    last_update_time: Instant,
    last_bytes: u64,
    total_bytes: u64,
    total_entries: usize,
}

impl ProgressTracker {
    pub fn new(total_bytes: u64, total_entries: usize) -> Self {
        let now = Instant::now();
        Self {
            start_time: now,
            last_update_time: now,
            last_bytes: 0,
            total_bytes,
            total_entries,
        }
    }

    /// Build a report from the current counters; speed is measured since the
    /// previous call.
    pub fn update(
        &mut self,
        completed_entries: usize,
        freshened_entries: usize,
        transferred_bytes: u64,
    ) -> ProgressReport {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update_time).as_secs_f64();

        let bytes_per_second = if elapsed > 0.1 {
            let diff = transferred_bytes.saturating_sub(self.last_bytes);
            (diff as f64 / elapsed) as u64
        } else {
            0
        };

        let eta_seconds = if bytes_per_second > 0 {
            self.total_bytes.saturating_sub(transferred_bytes) / bytes_per_second
        } else {
            0
        };

        self.last_update_time = now;
        self.last_bytes = transferred_bytes;

        ProgressReport {
            completed_entries,
            total_entries: self.total_entries,
            freshened_entries,
            transferred_bytes,
            total_bytes: self.total_bytes,
            bytes_per_second,
            eta_seconds,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Average speed since start
    pub fn average_speed(&self, transferred_bytes: u64) -> u64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            (transferred_bytes as f64 / elapsed) as u64
        } else {
            0
        }
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed as human-readable string
pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

/// Format duration as human-readable string
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}
