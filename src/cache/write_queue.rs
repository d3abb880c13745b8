//! Write-Behind Queue
//!
//! In-memory FIFO of blobs accepted by `put` but not yet on disk. Lookups
//! hit this queue before any disk search, which gives read-your-writes for
//! data that has not been flushed.

use std::collections::VecDeque;

use bytes::Bytes;
use tracing::debug;

use super::descriptor::Descriptor;

/// A blob waiting to be persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrite {
    /// Key of the blob
    pub descriptor: Descriptor,
    /// Blob contents
    pub blob: Bytes,
}

impl PendingWrite {
    /// Create a pending write
    pub fn new(descriptor: Descriptor, blob: Bytes) -> Self {
        Self { descriptor, blob }
    }

    /// Bytes accounted against the queue budget
    fn footprint(&self) -> usize {
        self.descriptor.len() + self.blob.len()
    }
}

/// FIFO of pending writes with a soft byte budget
///
/// Pushing past the budget drops the oldest entries; the newest entry is
/// always kept even if it alone exceeds the budget. A descriptor appears
/// at most once: pushing it again replaces the queued blob and moves it to
/// the back.
#[derive(Debug)]
pub struct WriteBehindQueue {
    entries: VecDeque<PendingWrite>,
    bytes: usize,
    max_bytes: usize,
}

impl WriteBehindQueue {
    /// Create an empty queue with a budget of `max_bytes`
    pub fn new(max_bytes: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            bytes: 0,
            max_bytes,
        }
    }

    /// Queue a blob, returning the number of older entries dropped
    pub fn push(&mut self, descriptor: Descriptor, blob: Bytes) -> usize {
        self.remove(&descriptor);

        let entry = PendingWrite::new(descriptor, blob);
        self.bytes += entry.footprint();
        self.entries.push_back(entry);

        let mut dropped = 0;
        while self.bytes > self.max_bytes && self.entries.len() > 1 {
            if let Some(old) = self.pop_front() {
                debug!(descriptor = %old.descriptor, "Write queue full, dropping oldest write");
                dropped += 1;
            }
        }
        dropped
    }

    /// Remove and return the oldest queued write
    pub fn pop_front(&mut self) -> Option<PendingWrite> {
        let entry = self.entries.pop_front()?;
        self.bytes -= entry.footprint();
        Some(entry)
    }

    /// Blob queued for `descriptor`, if any
    pub fn contains(&self, descriptor: &Descriptor) -> Option<Bytes> {
        self.entries
            .iter()
            .find(|entry| &entry.descriptor == descriptor)
            .map(|entry| entry.blob.clone())
    }

    /// Drop the queued write for `descriptor`, returning whether one existed
    pub fn remove(&mut self, descriptor: &Descriptor) -> bool {
        let Some(pos) = self
            .entries
            .iter()
            .position(|entry| &entry.descriptor == descriptor)
        else {
            return false;
        };
        if let Some(entry) = self.entries.remove(pos) {
            self.bytes -= entry.footprint();
        }
        true
    }

    /// Iterate from oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = &PendingWrite> {
        self.entries.iter()
    }

    /// Number of queued writes
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing is queued
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes currently accounted against the budget
    pub fn size_bytes(&self) -> usize {
        self.bytes
    }
}

// =============================================================================
// Tests
// =============================================================================
