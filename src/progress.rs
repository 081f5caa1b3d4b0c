//! Transfer progress tracking
//!
//! Counters are plain atomics so that parallel workers can share one
//! [`TransferProgress`] without locking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Shared transfer counters
#[derive(Debug)]
pub struct TransferProgress {
    rows: AtomicU64,
    bytes: AtomicU64,
    chunks: AtomicU64,
    retries: AtomicU64,
    total_rows: AtomicU64,
    start: Instant,
}

impl TransferProgress {
    /// Create a tracker; the clock starts now
    pub fn new() -> Self {
        Self {
            rows: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            chunks: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            total_rows: AtomicU64::new(0),
            start: Instant::now(),
        }
    }

    /// Set the expected row count, when known
    pub fn set_total_rows(&self, rows: u64) {
        self.total_rows.store(rows, Ordering::SeqCst);
    }

    /// Record delivered or uploaded rows
    pub fn add_rows(&self, rows: u64, bytes: u64) {
        self.rows.fetch_add(rows, Ordering::SeqCst);
        self.bytes.fetch_add(bytes, Ordering::SeqCst);
    }

    /// Record a committed chunk
    pub fn add_chunk(&self) {
        self.chunks.fetch_add(1, Ordering::SeqCst);
    }

    /// Record retried attempts
    pub fn add_retries(&self, retries: u64) {
        self.retries.fetch_add(retries, Ordering::SeqCst);
    }

    /// Get current progress snapshot
    pub fn snapshot(&self) -> ProgressSnapshot {
        let rows = self.rows.load(Ordering::SeqCst);
        let bytes = self.bytes.load(Ordering::SeqCst);
        let total_rows = self.total_rows.load(Ordering::SeqCst);
        let elapsed = self.start.elapsed();

        let throughput = if elapsed.as_secs_f64() > 0.0 {
            bytes as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        let percent = if total_rows > 0 {
            (rows as f64 / total_rows as f64) * 100.0
        } else {
            0.0
        };

        ProgressSnapshot {
            rows,
            bytes,
            chunks: self.chunks.load(Ordering::SeqCst),
            retries: self.retries.load(Ordering::SeqCst),
            total_rows,
            elapsed,
            throughput,
            percent,
        }
    }
}

impl Default for TransferProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// Progress snapshot
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    /// Rows transferred
    pub rows: u64,
    /// Payload bytes transferred
    pub bytes: u64,
    /// Chunks stored
    pub chunks: u64,
    /// Retried attempts
    pub retries: u64,
    /// Expected rows; 0 when unknown
    pub total_rows: u64,
    /// Time since start
    pub elapsed: Duration,
    /// Bytes per second
    pub throughput: f64,
    /// Share of `total_rows` done
    pub percent: f64,
}

impl ProgressSnapshot {
    /// One-line human readable summary
    pub fn summary(&self) -> String {
        use humansize::{format_size, BINARY};

        format!(
            "{} rows, {} in {:.2}s ({}/s), {} chunks, {} retries",
            self.rows,
            format_size(self.bytes, BINARY),
            self.elapsed.as_secs_f64(),
            format_size(self.throughput as u64, BINARY),
            self.chunks,
            self.retries
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_tracking() {
        let progress = TransferProgress::new();
        progress.set_total_rows(200);
        progress.add_rows(100, 2048);
        progress.add_chunk();
        progress.add_retries(2);

        let snapshot = progress.snapshot();
        assert_eq!(snapshot.rows, 100);
        assert_eq!(snapshot.bytes, 2048);
        assert_eq!(snapshot.chunks, 1);
        assert_eq!(snapshot.retries, 2);
        assert_eq!(snapshot.percent, 50.0);
        assert!(snapshot.summary().contains("100 rows, 2 KiB"));
    }
}
