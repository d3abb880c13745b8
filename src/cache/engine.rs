//! Multi-File Cache Engine
//!
//! The engine persists blobs into `nbr_files` rotating data files, each
//! indexed by `nbr_hash` shard files, and runs at most one disk request at
//! a time:
//!
//! ```text
//!            ┌──────────────▶ LookingForMap ──▶ ReadingMap ──────────┐
//!            │                                                      ▼
//!          Idle ──▶ WritingLookingForMap ──▶ WritingMapData ──▶ WritingIndex
//!            │  ▲                                                   │
//!            │  └───────────────────────────────────────────────────┘
//!            └──────────────▶ RemovingMap
//! ```
//!
//! Whenever it is idle the engine picks new work in a fixed order: a
//! pending size change, then removals, then lookups, then writes. Lookups
//! search the newest file first; a write first checks the two newest files
//! for an existing copy and is dropped if one is found.
//!
//! Data files are written round-robin. Once the current file (data plus its
//! shards) reaches the per-file budget, the next file is cleared and becomes
//! current, so the least recently written file is always evicted whole.
//!
//! # Driving I/O
//!
//! ```ignore
//! cache.put(descriptor, blob);
//! while let Some(request) = cache.next_io() {
//!     let completion = request.execute();
//!     cache.complete_io(completion);
//! }
//! ```

use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::mem;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, info, trace, warn};

use super::block_file::{BlockFile, FilePos, FileProvider, IoCompletion, IoOp, IoRequest};
use super::descriptor::Descriptor;
use super::dump::{read_dump, write_dump};
use super::index::{IndexStep, ShardIndexManager};
use super::metrics::{CacheMetrics, CacheStats};
use super::shard::ShardEntry;
use super::write_queue::{PendingWrite, WriteBehindQueue};
use super::DUPLICATE_SEARCH_FILES;
use crate::config::CacheConfig;
use crate::error::Result;

/// Receiver of blobs found by [`MultiFileCache::get`]
pub trait BufferListener: Send + Sync {
    fn buffer_received(&self, descriptor: &Descriptor, blob: Bytes);
}

/// Next tier consulted when a descriptor is not cached locally
pub trait ParentCache: Send + Sync {
    /// Fetch `descriptor` and deliver it to `listener`
    fn request(&self, descriptor: &Descriptor, listener: Arc<dyn BufferListener>);

    /// Hand back a blob the cache is finished with
    fn release(&self, _descriptor: &Descriptor, _blob: Bytes) {}

    /// Drop every outstanding request
    fn cancel_all(&self) {}
}

/// Externally visible engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePhase {
    Idle,
    LookingForMap,
    ReadingMap,
    WritingLookingForMap,
    WritingMapData,
    WritingIndex,
    RemovingMap,
}

impl fmt::Display for CachePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

struct FindRequest {
    descriptor: Descriptor,
    listener: Arc<dyn BufferListener>,
    cancelled: bool,
}

impl FindRequest {
    fn same_as(&self, descriptor: &Descriptor, listener: &Arc<dyn BufferListener>) -> bool {
        self.descriptor == *descriptor
            && Arc::as_ptr(&self.listener).cast::<()>() == Arc::as_ptr(listener).cast::<()>()
    }
}

enum State {
    Idle,
    LookingForMap(FindRequest),
    ReadingMap { request: FindRequest, expected: usize },
    WritingLookingForMap(PendingWrite),
    WritingMapData { write: PendingWrite, offset: u64 },
    WritingIndex(PendingWrite),
    RemovingMap(Descriptor),
}

impl State {
    fn phase(&self) -> CachePhase {
        match self {
            State::Idle => CachePhase::Idle,
            State::LookingForMap(_) => CachePhase::LookingForMap,
            State::ReadingMap { .. } => CachePhase::ReadingMap,
            State::WritingLookingForMap(_) => CachePhase::WritingLookingForMap,
            State::WritingMapData { .. } => CachePhase::WritingMapData,
            State::WritingIndex(_) => CachePhase::WritingIndex,
            State::RemovingMap(_) => CachePhase::RemovingMap,
        }
    }

    fn in_flight_write(&self) -> Option<&PendingWrite> {
        match self {
            State::WritingLookingForMap(write)
            | State::WritingMapData { write, .. }
            | State::WritingIndex(write) => Some(write),
            _ => None,
        }
    }

    fn find_request_mut(&mut self) -> Option<&mut FindRequest> {
        match self {
            State::LookingForMap(request) | State::ReadingMap { request, .. } => Some(request),
            _ => None,
        }
    }
}

/// Disk-backed blob cache over rotating data files
pub struct MultiFileCache {
    config: CacheConfig,
    data_files: Vec<Arc<dyn BlockFile>>,
    dump_file: Arc<dyn BlockFile>,
    initial_dump_file: Arc<dyn BlockFile>,
    index: ShardIndexManager,
    parent: Option<Arc<dyn ParentCache>>,

    state: State,
    pending_io: Option<IoRequest>,
    io_outstanding: bool,

    write_queue: WriteBehindQueue,
    find_queue: VecDeque<FindRequest>,
    remove_set: BTreeSet<Descriptor>,

    last_written: usize,
    max_size: u64,
    new_size: u64,
    max_size_per_file: u64,
    writes_since_check: u64,
    clear_requested: bool,
    shutting_down: bool,

    metrics: Arc<CacheMetrics>,
}

impl MultiFileCache {
    /// Open the cache instance described by `config`
    ///
    /// Applies the size budget, continues writing into the file that was
    /// written last (or the one after it if that file is full) and queues
    /// the contents of both dump files.
    pub fn open(
        config: CacheConfig,
        provider: &dyn FileProvider,
        parent: Option<Arc<dyn ParentCache>>,
    ) -> Result<Self> {
        config.validate()?;
        let metrics = Arc::new(CacheMetrics::new());

        let data_files = (0..config.nbr_files)
            .map(|file| provider.open(&config.data_file_path(file)))
            .collect::<Result<Vec<_>>>()?;
        let index = ShardIndexManager::open(&config, provider, Arc::clone(&metrics))?;
        let dump_file = provider.open(&config.dump_file_path())?;
        let initial_dump_file = provider.open(&config.initial_dump_file_path())?;

        let mut cache = Self {
            write_queue: WriteBehindQueue::new(config.write_queue_bytes),
            max_size: config.max_size,
            new_size: config.max_size,
            max_size_per_file: config.max_size / config.nbr_files as u64 + 1,
            config,
            data_files,
            dump_file,
            initial_dump_file,
            index,
            parent,
            state: State::Idle,
            pending_io: None,
            io_outstanding: false,
            find_queue: VecDeque::new(),
            remove_set: BTreeSet::new(),
            last_written: 0,
            writes_since_check: 0,
            clear_requested: false,
            shutting_down: false,
            metrics,
        };

        cache.last_written = cache.index.most_recent_file().unwrap_or(0);
        cache.apply_max_size(cache.max_size);
        // A file emptied by the last rotation has no shard to date it
        if cache.file_size(cache.last_written) >= cache.max_size_per_file {
            cache.rotate();
        }
        cache.restore_dumps();

        info!(
            path = %cache.config.storage_dir().display(),
            nbr_files = cache.config.nbr_files,
            nbr_hash = cache.config.nbr_hash,
            max_size = cache.max_size,
            current_file = cache.last_written,
            queued = cache.write_queue.len(),
            "Opened tile cache"
        );
        Ok(cache)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    // =========================================================================
    // Public operations
    // =========================================================================

    /// Look up `descriptor`
    ///
    /// Queued blobs are delivered before this returns. Otherwise the lookup
    /// is queued; on a miss it is forwarded to the parent cache, and without
    /// a parent the listener is never called.
    pub fn get(&mut self, descriptor: &Descriptor, listener: Arc<dyn BufferListener>) {
        if self.shutting_down {
            return;
        }
        if let Some(blob) = self.queued_blob(descriptor) {
            self.metrics.record_queue_hit();
            listener.buffer_received(descriptor, blob);
            return;
        }

        if self.is_being_removed(descriptor) {
            debug!(%descriptor, "Lookup of descriptor being removed");
            self.metrics.record_miss();
            self.forward_to_parent(descriptor, listener);
        } else if self
            .find_queue
            .iter()
            .any(|request| request.same_as(descriptor, &listener))
        {
            trace!(%descriptor, "Lookup already queued");
        } else {
            self.find_queue.push_back(FindRequest {
                descriptor: descriptor.clone(),
                listener,
                cancelled: false,
            });
        }
        self.start_working();
    }

    /// Queue `blob` for writing under `descriptor`
    pub fn put(&mut self, descriptor: Descriptor, blob: Bytes) {
        if self.shutting_down {
            warn!(%descriptor, "Cache is shutting down, dropping write");
            return;
        }
        if u32::try_from(blob.len()).is_err() {
            warn!(%descriptor, len = blob.len(), "Blob too large to cache");
            return;
        }
        let dropped = self.write_queue.push(descriptor, blob);
        if dropped > 0 {
            self.metrics.record_queue_drops(dropped as u64);
        }
        self.start_working();
    }

    /// Forget `descriptor` in the write queue and in every data file
    pub fn remove(&mut self, descriptor: &Descriptor) {
        self.write_queue.remove(descriptor);
        self.remove_set.insert(descriptor.clone());
        self.start_working();
    }

    /// Drop every queued lookup
    ///
    /// A lookup already in progress completes without notifying anybody.
    pub fn cancel_all(&mut self) {
        let dropped = self.find_queue.len();
        self.find_queue.clear();
        if let Some(request) = self.state.find_request_mut() {
            request.cancelled = true;
        }
        debug!(dropped, "Cancelled pending lookups");
        if let Some(parent) = &self.parent {
            parent.cancel_all();
        }
    }

    /// Change the total size budget
    ///
    /// Takes effect immediately when idle, otherwise the next time the
    /// engine becomes idle.
    pub fn set_max_size(&mut self, size: u64) {
        self.new_size = size;
        if self.is_idle() {
            self.apply_max_size(size);
        }
    }

    /// Cancel lookups and empty every data file and shard
    pub fn clear_cache(&mut self) {
        self.cancel_all();
        self.clear_requested = true;
        self.start_working();
    }

    // =========================================================================
    // I/O driving
    // =========================================================================

    /// Take the request that must be executed next
    pub fn next_io(&mut self) -> Option<IoRequest> {
        self.pending_io.take()
    }

    /// Resume with the completion of the last request taken by [`Self::next_io`]
    pub fn complete_io(&mut self, completion: IoCompletion) {
        if self.shutting_down {
            trace!("Ignoring completion during shutdown");
            return;
        }
        if !self.io_outstanding {
            warn!("Completion arrived with no request outstanding");
            return;
        }
        self.io_outstanding = false;

        match mem::replace(&mut self.state, State::Idle) {
            State::ReadingMap { request, expected } => self.read_done(request, expected, completion),
            State::WritingMapData { write, offset } => self.write_done(write, offset, completion),
            State::Idle => warn!("Completion arrived while idle"),
            state => {
                self.state = state;
                let step = self.index.on_completion(completion);
                self.handle_index_step(step);
            }
        }
        self.start_working();
    }

    /// Start queued work, such as blobs restored from a dump at open
    pub fn resume(&mut self) {
        self.start_working();
    }

    /// Execute requests on the calling thread until nothing is left to do
    pub fn run_until_idle(&mut self) {
        self.start_working();
        while let Some(request) = self.next_io() {
            let started = Instant::now();
            let completion = request.execute();
            self.metrics.record_io_latency(started.elapsed());
            self.complete_io(completion);
        }
    }

    /// Check if no request is outstanding
    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Idle) && !self.io_outstanding
    }

    /// Check if idle with no queued work of any kind
    pub fn is_quiescent(&self) -> bool {
        self.is_idle()
            && self.write_queue.is_empty()
            && self.find_queue.is_empty()
            && self.remove_set.is_empty()
            && !self.clear_requested
            && self.new_size == self.max_size
    }

    pub fn phase(&self) -> CachePhase {
        self.state.phase()
    }

    // =========================================================================
    // Sizes and statistics
    // =========================================================================

    /// Bytes used by data file `file` and its shards
    pub fn file_size(&self, file: usize) -> u64 {
        self.data_files[file].len() + self.index.shard_bytes(file)
    }

    /// Bytes used by every data and shard file
    pub fn total_size(&self) -> u64 {
        (0..self.config.nbr_files).map(|file| self.file_size(file)).sum()
    }

    /// File new blobs are appended to
    pub fn current_file(&self) -> usize {
        self.last_written
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn max_size_per_file(&self) -> u64 {
        self.max_size_per_file
    }

    pub fn write_queue_len(&self) -> usize {
        self.write_queue.len()
    }

    pub fn pending_finds(&self) -> usize {
        self.find_queue.len()
    }

    pub fn pending_removals(&self) -> usize {
        self.remove_set.len()
    }

    /// Point-in-time statistics
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            collected_at: Utc::now(),
            phase: self.phase().to_string(),
            max_size: self.max_size,
            max_size_per_file: self.max_size_per_file,
            total_size: self.total_size(),
            current_file: self.last_written,
            file_sizes: (0..self.config.nbr_files)
                .map(|file| self.file_size(file))
                .collect(),
            write_queue_len: self.write_queue.len(),
            write_queue_bytes: self.write_queue.size_bytes(),
            pending_finds: self.find_queue.len(),
            pending_removals: self.remove_set.len(),
            metrics: self.metrics.snapshot(),
        }
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stop the engine and save unwritten blobs to the dump file
    ///
    /// Completions arriving afterwards are ignored. Returns the number of
    /// records dumped; later calls do nothing.
    pub fn shutdown(&mut self) -> Result<usize> {
        if self.shutting_down {
            return Ok(0);
        }
        self.shutting_down = true;
        self.pending_io = None;
        self.find_queue.clear();

        let result = {
            let records = self
                .state
                .in_flight_write()
                .into_iter()
                .chain(self.write_queue.iter())
                .filter(|write| !self.is_being_removed(&write.descriptor))
                .map(|write| (&write.descriptor, &write.blob));
            write_dump(self.dump_file.as_ref(), records, self.config.disk_headroom)
        };
        self.write_queue = WriteBehindQueue::new(self.config.write_queue_bytes);

        for file in &self.data_files {
            file.cancel();
        }
        for file in 0..self.config.nbr_files {
            for shard in self.index.shard_files(file) {
                shard.cancel();
            }
        }
        self.dump_file.cancel();

        let written = result?;
        self.metrics.record_dump_written(written as u64);
        info!(records = written, "Tile cache shut down");
        Ok(written)
    }

    // =========================================================================
    // Driver
    // =========================================================================

    /// Start queued work until a request is outstanding or nothing is left
    fn start_working(&mut self) {
        if self.shutting_down {
            return;
        }
        while self.is_idle() {
            if self.clear_requested {
                self.clear_requested = false;
                self.clear_all_files();
            }
            if self.max_size != self.new_size {
                self.apply_max_size(self.new_size);
            }
            if self.start_removing() || self.start_finding() || self.start_writing() {
                continue;
            }
            break;
        }
    }

    fn start_removing(&mut self) -> bool {
        let Some(descriptor) = self.remove_set.pop_first() else {
            return false;
        };
        debug!(%descriptor, "Removing from shards");
        self.state = State::RemovingMap(descriptor.clone());
        let step = self.index.remove(&descriptor);
        self.handle_index_step(step);
        true
    }

    fn start_finding(&mut self) -> bool {
        let Some(request) = self.find_queue.pop_front() else {
            return false;
        };
        if let Some(blob) = self.queued_blob(&request.descriptor) {
            self.metrics.record_queue_hit();
            request.listener.buffer_received(&request.descriptor, blob);
            return true;
        }

        let descriptor = request.descriptor.clone();
        self.state = State::LookingForMap(request);
        let step = self
            .index
            .find(&descriptor, self.last_written, self.config.nbr_files);
        self.handle_index_step(step);
        true
    }

    fn start_writing(&mut self) -> bool {
        let Some(write) = self.write_queue.pop_front() else {
            return false;
        };
        let descriptor = write.descriptor.clone();
        self.state = State::WritingLookingForMap(write);
        let step = self
            .index
            .find(&descriptor, self.last_written, DUPLICATE_SEARCH_FILES);
        self.handle_index_step(step);
        true
    }

    fn issue(&mut self, request: IoRequest) {
        debug_assert!(!self.io_outstanding, "disk request already outstanding");
        trace!(?request, phase = ?self.phase(), "Issuing disk request");
        self.pending_io = Some(request);
        self.io_outstanding = true;
    }

    fn handle_index_step(&mut self, step: IndexStep) {
        match step {
            IndexStep::Io(request) => self.issue(request),
            IndexStep::Found { file, entry } => self.find_complete(Some((file, entry))),
            IndexStep::NotFound => self.find_complete(None),
            IndexStep::IndexWritten => self.index_written(),
            IndexStep::IndexFailed => self.index_failed(),
            IndexStep::RemoveComplete => self.remove_complete(),
            IndexStep::Idle => {}
        }
    }

    // =========================================================================
    // Completions
    // =========================================================================

    fn find_complete(&mut self, found: Option<(usize, ShardEntry)>) {
        match mem::replace(&mut self.state, State::Idle) {
            State::LookingForMap(request) => {
                if request.cancelled {
                    debug!(descriptor = %request.descriptor, "Discarding cancelled lookup");
                    return;
                }
                let Some((file, entry)) = found else {
                    self.metrics.record_miss();
                    self.forward_to_parent(&request.descriptor, request.listener);
                    return;
                };

                let data_file = Arc::clone(&self.data_files[file]);
                if entry.end().map_or(true, |end| end > data_file.len()) {
                    warn!(
                        descriptor = %request.descriptor,
                        file,
                        offset = entry.offset,
                        length = entry.length,
                        "Shard entry points past end of data file"
                    );
                    self.metrics.record_miss();
                    self.forward_to_parent(&request.descriptor, request.listener);
                    return;
                }
                if entry.length == 0 {
                    self.metrics.record_disk_hit();
                    request
                        .listener
                        .buffer_received(&request.descriptor, Bytes::new());
                    return;
                }

                trace!(descriptor = %request.descriptor, file, "Reading blob");
                let expected = entry.length as usize;
                self.state = State::ReadingMap { request, expected };
                self.issue(IoRequest::new(
                    data_file,
                    IoOp::Read {
                        pos: FilePos::Start(entry.offset),
                        len: expected,
                    },
                ));
            }
            State::WritingLookingForMap(write) => {
                if found.is_some() {
                    debug!(descriptor = %write.descriptor, "Already in a recent file, skipping write");
                    self.metrics.record_duplicate_write();
                    let PendingWrite { descriptor, blob } = write;
                    self.release_to_parent(&descriptor, blob);
                    self.after_write();
                    return;
                }

                let data_file = Arc::clone(&self.data_files[self.last_written]);
                let offset = data_file.len();
                let data = write.blob.clone();
                trace!(descriptor = %write.descriptor, file = self.last_written, offset, "Appending blob");
                self.state = State::WritingMapData { write, offset };
                self.issue(IoRequest::new(
                    data_file,
                    IoOp::Write {
                        pos: FilePos::End,
                        data,
                    },
                ));
            }
            state => {
                warn!(phase = ?state.phase(), "Unexpected lookup result");
                self.state = state;
            }
        }
    }

    fn read_done(&mut self, request: FindRequest, expected: usize, completion: IoCompletion) {
        if request.cancelled {
            debug!(descriptor = %request.descriptor, "Discarding cancelled read");
            return;
        }
        match completion {
            IoCompletion::Read(blob) if blob.len() == expected => {
                self.metrics.record_disk_hit();
                request.listener.buffer_received(&request.descriptor, blob);
            }
            other => {
                warn!(
                    descriptor = %request.descriptor,
                    expected,
                    got = other.into_bytes().len(),
                    "Failed to read blob"
                );
                self.metrics.record_failed_read();
                self.metrics.record_miss();
                self.forward_to_parent(&request.descriptor, request.listener);
            }
        }
    }

    fn write_done(&mut self, write: PendingWrite, offset: u64, completion: IoCompletion) {
        self.writes_since_check += 1;
        let written = completion.written();
        let len = write.blob.len();

        if written != len {
            warn!(descriptor = %write.descriptor, expected = len, written, "Failed to write blob");
            self.metrics.record_failed_write();
            let PendingWrite { descriptor, blob } = write;
            self.release_to_parent(&descriptor, blob);
            return;
        }

        self.metrics.record_write(len as u64);
        let descriptor = write.descriptor.clone();
        // Held until indexed; shutdown dumps it from here.
        self.state = State::WritingIndex(write);
        let step = self.index.update_map_index(
            self.last_written,
            &descriptor,
            ShardEntry::new(offset, len as u32),
        );
        self.handle_index_step(step);
    }

    fn index_written(&mut self) {
        match mem::replace(&mut self.state, State::Idle) {
            State::WritingIndex(PendingWrite { descriptor, blob }) => {
                trace!(%descriptor, "Index written");
                self.release_to_parent(&descriptor, blob);
                self.after_write();
            }
            state => {
                warn!(phase = ?state.phase(), "Unexpected index write");
                self.state = state;
            }
        }
    }

    /// The blob is in the data file but unreachable; the space is
    /// reclaimed when the file rotates out
    fn index_failed(&mut self) {
        match mem::replace(&mut self.state, State::Idle) {
            State::WritingIndex(PendingWrite { descriptor, blob }) => {
                warn!(%descriptor, "Failed to index blob, dropping write");
                self.metrics.record_failed_write();
                self.release_to_parent(&descriptor, blob);
                self.after_write();
            }
            state => {
                warn!(phase = ?state.phase(), "Unexpected index failure");
                self.state = state;
            }
        }
    }

    fn remove_complete(&mut self) {
        match mem::replace(&mut self.state, State::Idle) {
            State::RemovingMap(descriptor) => {
                debug!(%descriptor, "Removal complete");
                self.metrics.record_removal();
            }
            state => {
                warn!(phase = ?state.phase(), "Unexpected removal result");
                self.state = state;
            }
        }
    }

    /// Rotate if the current file is full and periodically re-check the disk
    fn after_write(&mut self) {
        let size = self.file_size(self.last_written);
        if size >= self.max_size_per_file {
            self.rotate();
        }
        if self.writes_since_check >= self.config.disk_check_interval {
            self.writes_since_check = 0;
            self.apply_max_size(self.new_size);
        }
    }

    fn rotate(&mut self) {
        let full = self.last_written;
        self.last_written = (self.last_written + 1) % self.config.nbr_files;
        self.clear_file_and_index(self.last_written);
        self.metrics.record_rotation();
        info!(
            full,
            current = self.last_written,
            per_file = self.max_size_per_file,
            "Rotated to next data file"
        );
    }

    // =========================================================================
    // Size budget
    // =========================================================================

    /// Largest total size allowed given the free space on the device
    fn max_allowed_size(&self, wanted: u64) -> u64 {
        let available = self
            .data_files
            .first()
            .map(|file| file.available_space())
            .unwrap_or(0);
        let usable = available
            .saturating_add(self.total_size())
            .saturating_sub(self.config.disk_headroom);
        wanted.min(usable)
    }

    /// Apply `size` as the budget, clearing old files while over it
    fn apply_max_size(&mut self, size: u64) {
        self.max_size = size;
        self.new_size = size;
        let nbr_files = self.config.nbr_files as u64;

        for _ in 0..nbr_files {
            let allowed = self.max_allowed_size(self.max_size);
            self.max_size_per_file = allowed / nbr_files + 1;
            let total = self.total_size();
            if allowed != 0 && allowed >= total {
                break;
            }
            warn!(allowed, total, "Cache over budget, clearing oldest file");
            self.clear_oldest_not_empty_file();
        }
        debug!(
            max_size = self.max_size,
            per_file = self.max_size_per_file,
            "Applied size budget"
        );
    }

    fn clear_oldest_not_empty_file(&mut self) -> u64 {
        let nbr_files = self.config.nbr_files;
        let mut file = (self.last_written + 1) % nbr_files;
        for _ in 0..nbr_files {
            if self.file_size(file) != 0 {
                break;
            }
            file = (file + 1) % nbr_files;
        }
        let freed = self.file_size(file);
        self.clear_file_and_index(file);
        debug!(file, freed, "Cleared oldest data file");
        freed
    }

    fn clear_file_and_index(&mut self, file: usize) {
        let data_file = &self.data_files[file];
        if let Err(e) = data_file.clear() {
            warn!(path = %data_file.path().display(), error = %e, "Failed to clear data file");
        }
        self.index.clear_file_shards(file);
    }

    fn clear_all_files(&mut self) {
        for file in 0..self.config.nbr_files {
            self.clear_file_and_index(file);
        }
        info!("Cleared tile cache");
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Blob waiting to be written, including the one being written now
    fn queued_blob(&self, descriptor: &Descriptor) -> Option<Bytes> {
        self.write_queue.contains(descriptor).or_else(|| {
            self.state
                .in_flight_write()
                .filter(|write| write.descriptor == *descriptor)
                .map(|write| write.blob.clone())
        })
    }

    fn is_being_removed(&self, descriptor: &Descriptor) -> bool {
        matches!(&self.state, State::RemovingMap(current) if current == descriptor)
            || self.remove_set.contains(descriptor)
    }

    fn forward_to_parent(&self, descriptor: &Descriptor, listener: Arc<dyn BufferListener>) {
        match &self.parent {
            Some(parent) => {
                trace!(%descriptor, "Forwarding lookup to parent");
                self.metrics.record_parent_forward();
                parent.request(descriptor, listener);
            }
            None => trace!(%descriptor, "Miss with no parent cache"),
        }
    }

    fn release_to_parent(&self, descriptor: &Descriptor, blob: Bytes) {
        if let Some(parent) = &self.parent {
            parent.release(descriptor, blob);
        }
    }

    fn restore_dumps(&mut self) {
        let dumps = [
            Arc::clone(&self.initial_dump_file),
            Arc::clone(&self.dump_file),
        ];
        for file in dumps {
            match read_dump(file.as_ref()) {
                Ok(records) => {
                    let restored = records.len();
                    for record in records {
                        let dropped = self.write_queue.push(record.descriptor, record.blob);
                        self.metrics.record_queue_drops(dropped as u64);
                    }
                    if restored > 0 {
                        info!(path = %file.path().display(), records = restored, "Restored dump");
                        self.metrics.record_dump_restored(restored as u64);
                    }
                }
                Err(e) => {
                    warn!(path = %file.path().display(), error = %e, "Failed to read dump");
                }
            }
            if let Err(e) = file.clear() {
                warn!(path = %file.path().display(), error = %e, "Failed to clear dump");
            }
        }
    }
}

impl Drop for MultiFileCache {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "Failed to write dump on drop");
        }
    }
}

impl fmt::Debug for MultiFileCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiFileCache")
            .field("path", &self.config.storage_dir())
            .field("phase", &self.phase())
            .field("current_file", &self.last_written)
            .field("max_size", &self.max_size)
            .field("write_queue", &self.write_queue.len())
            .field("find_queue", &self.find_queue.len())
            .field("remove_set", &self.remove_set.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
