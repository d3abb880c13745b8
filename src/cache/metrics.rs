//! Cache Metrics Collection
//!
//! Counters for monitoring the hit rate, write traffic and rotation
//! behaviour of one cache instance.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // Lookups
    queue_hits: AtomicU64,
    disk_hits: AtomicU64,
    misses: AtomicU64,
    parent_forwards: AtomicU64,
    failed_reads: AtomicU64,

    // Writes
    blobs_written: AtomicU64,
    bytes_written: AtomicU64,
    duplicate_writes: AtomicU64,
    failed_writes: AtomicU64,
    queue_drops: AtomicU64,

    // Maintenance
    rotations: AtomicU64,
    removals: AtomicU64,
    shard_loads: AtomicU64,

    // Restarts
    dump_records_written: AtomicU64,
    dump_records_restored: AtomicU64,

    // Disk request latency (microseconds, exponential moving average)
    io_latency_us: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_queue_hit(&self) {
        self.queue_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disk_hit(&self) {
        self.disk_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_parent_forward(&self) {
        self.parent_forwards.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_read(&self) {
        self.failed_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self, bytes: u64) {
        self.blobs_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_duplicate_write(&self) {
        self.duplicate_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_write(&self) {
        self.failed_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queue_drops(&self, count: u64) {
        self.queue_drops.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_rotation(&self) {
        self.rotations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_removal(&self) {
        self.removals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_shard_load(&self) {
        self.shard_loads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dump_written(&self, records: u64) {
        self.dump_records_written.fetch_add(records, Ordering::Relaxed);
    }

    pub fn record_dump_restored(&self, records: u64) {
        self.dump_records_restored.fetch_add(records, Ordering::Relaxed);
    }

    pub fn queue_hits(&self) -> u64 {
        self.queue_hits.load(Ordering::Relaxed)
    }

    pub fn disk_hits(&self) -> u64 {
        self.disk_hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn blobs_written(&self) -> u64 {
        self.blobs_written.load(Ordering::Relaxed)
    }

    pub fn duplicate_writes(&self) -> u64 {
        self.duplicate_writes.load(Ordering::Relaxed)
    }

    pub fn rotations(&self) -> u64 {
        self.rotations.load(Ordering::Relaxed)
    }

    pub fn shard_loads(&self) -> u64 {
        self.shard_loads.load(Ordering::Relaxed)
    }

    /// Fraction of lookups answered locally
    pub fn hit_ratio(&self) -> f64 {
        let hits = (self.queue_hits() + self.disk_hits()) as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Fold one disk request duration into the moving average
    pub fn record_io_latency(&self, duration: Duration) {
        let new_us = duration.as_micros() as u64;
        let alpha = 0.1; // EMA smoothing factor

        loop {
            let current = self.io_latency_us.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            };

            if self
                .io_latency_us
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    pub fn io_latency(&self) -> Duration {
        Duration::from_micros(self.io_latency_us.load(Ordering::Relaxed))
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            queue_hits: self.queue_hits(),
            disk_hits: self.disk_hits(),
            misses: self.misses(),
            parent_forwards: self.parent_forwards.load(Ordering::Relaxed),
            failed_reads: self.failed_reads.load(Ordering::Relaxed),
            hit_ratio: self.hit_ratio(),

            blobs_written: self.blobs_written(),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            duplicate_writes: self.duplicate_writes(),
            failed_writes: self.failed_writes.load(Ordering::Relaxed),
            queue_drops: self.queue_drops.load(Ordering::Relaxed),

            rotations: self.rotations(),
            removals: self.removals.load(Ordering::Relaxed),
            shard_loads: self.shard_loads(),

            dump_records_written: self.dump_records_written.load(Ordering::Relaxed),
            dump_records_restored: self.dump_records_restored.load(Ordering::Relaxed),

            io_latency_us: self.io_latency_us.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of all cache metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    // Lookups
    pub queue_hits: u64,
    pub disk_hits: u64,
    pub misses: u64,
    pub parent_forwards: u64,
    pub failed_reads: u64,
    pub hit_ratio: f64,

    // Writes
    pub blobs_written: u64,
    pub bytes_written: u64,
    pub duplicate_writes: u64,
    pub failed_writes: u64,
    pub queue_drops: u64,

    // Maintenance
    pub rotations: u64,
    pub removals: u64,
    pub shard_loads: u64,

    // Restarts
    pub dump_records_written: u64,
    pub dump_records_restored: u64,

    pub io_latency_us: u64,
}

/// Point-in-time view of a cache instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub collected_at: DateTime<Utc>,
    pub phase: String,
    pub max_size: u64,
    pub max_size_per_file: u64,
    pub total_size: u64,
    pub current_file: usize,
    pub file_sizes: Vec<u64>,
    pub write_queue_len: usize,
    pub write_queue_bytes: usize,
    pub pending_finds: usize,
    pub pending_removals: usize,
    pub metrics: MetricsSnapshot,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = CacheMetrics::new();
        assert_eq!(metrics.queue_hits(), 0);
        assert_eq!(metrics.disk_hits(), 0);
        assert_eq!(metrics.hit_ratio(), 0.0);
    }

    #[test]
    fn test_hit_tracking() {
        let metrics = CacheMetrics::new();

        metrics.record_queue_hit();
        metrics.record_disk_hit();
        metrics.record_miss();

        assert_eq!(metrics.queue_hits(), 1);
        assert_eq!(metrics.disk_hits(), 1);
        assert!((metrics.hit_ratio() - 0.666).abs() < 0.01);
    }

    #[test]
    fn test_write_tracking() {
        let metrics = CacheMetrics::new();
        metrics.record_write(10);
        metrics.record_write(20);
        metrics.record_duplicate_write();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.blobs_written, 2);
        assert_eq!(snapshot.bytes_written, 30);
        assert_eq!(snapshot.duplicate_writes, 1);
    }

    #[test]
    fn test_latency_tracking() {
        let metrics = CacheMetrics::new();

        metrics.record_io_latency(Duration::from_micros(100));
        assert_eq!(metrics.io_latency(), Duration::from_micros(100));

        // EMA should smooth values
        metrics.record_io_latency(Duration::from_micros(200));
        let latency = metrics.io_latency().as_micros();
        assert!(latency > 100 && latency < 200);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = CacheMetrics::new();
        metrics.record_rotation();
        let json = serde_json::to_string(&metrics.snapshot()).unwrap();
        assert!(json.contains("\"rotations\":1"));
    }
}
