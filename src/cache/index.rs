//! Shard Index Manager
//!
//! Owns the `nbr_files × nbr_hash` shard files of a cache instance and the
//! resident copies of the shards touched so far. Every public operation
//! starts a small sub-state machine:
//!
//! ```text
//! Idle ─▶ ReadingLength ─▶ ReadingBody ─▶ (next file | WritingIndex) ─▶ Idle
//!    └───────── shard resident ──────────┘
//! ```
//!
//! Shards are loaded lazily and stay resident until [`ShardIndexManager::clear_index`]
//! drops them, except that a shard whose encoded size exceeds the resident
//! limit is dropped again right after it is rewritten.
//!
//! Like the engine above it, the manager never blocks: each step either
//! finishes with a result or hands back an [`IoRequest`] whose completion
//! must be passed to [`ShardIndexManager::on_completion`].

use std::sync::Arc;

use tracing::{debug, trace, warn};

use super::block_file::{BlockFile, FilePos, FileProvider, IoCompletion, IoOp, IoRequest};
use super::descriptor::Descriptor;
use super::metrics::CacheMetrics;
use super::shard::{
    parse_length_prefix, ShardEntry, ShardIndex, MAX_SHARD_BODY_LEN, SHARD_LENGTH_PREFIX,
};
use crate::config::CacheConfig;
use crate::error::Result;

/// Operation a shard load belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexMode {
    Finding,
    Writing,
    Removing,
}

/// Sub-state of the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    Idle,
    ReadingLength(IndexMode),
    ReadingBody { mode: IndexMode, len: usize },
    WritingIndex { mode: IndexMode, len: usize },
}

/// Outcome of driving the manager one step
#[derive(Debug)]
pub enum IndexStep {
    /// Execute this request and pass its completion back
    Io(IoRequest),
    /// `find` located the descriptor
    Found { file: usize, entry: ShardEntry },
    /// `find` searched every requested file
    NotFound,
    /// `update_map_index` rewrote the shard
    IndexWritten,
    /// `update_map_index` could not read or write the shard
    IndexFailed,
    /// `remove` swept every file
    RemoveComplete,
    /// No operation was in progress
    Idle,
}

#[derive(Debug)]
enum Task {
    Find {
        descriptor: Descriptor,
        bucket: usize,
        file: usize,
        remaining: usize,
    },
    Write {
        descriptor: Descriptor,
        bucket: usize,
        file: usize,
        entry: ShardEntry,
    },
    Remove {
        descriptor: Descriptor,
        bucket: usize,
        file: usize,
    },
}

impl Task {
    fn mode(&self) -> IndexMode {
        match self {
            Task::Find { .. } => IndexMode::Finding,
            Task::Write { .. } => IndexMode::Writing,
            Task::Remove { .. } => IndexMode::Removing,
        }
    }

    fn location(&self) -> (usize, usize) {
        match self {
            Task::Find { file, bucket, .. }
            | Task::Write { file, bucket, .. }
            | Task::Remove { file, bucket, .. } => (*file, *bucket),
        }
    }
}

/// What visiting a resident shard decided
enum Visit {
    Hit(usize, ShardEntry),
    Exhausted,
    Rewrite,
    NextFile,
}

/// Manager of every shard of one cache instance
pub struct ShardIndexManager {
    nbr_files: usize,
    nbr_hash: usize,
    resident_limit: usize,
    files: Vec<Arc<dyn BlockFile>>,
    resident: Vec<Option<ShardIndex>>,
    state: IndexState,
    task: Option<Task>,
    metrics: Arc<CacheMetrics>,
}

impl ShardIndexManager {
    /// Open every shard file of the instance described by `config`
    pub fn open(
        config: &CacheConfig,
        provider: &dyn FileProvider,
        metrics: Arc<CacheMetrics>,
    ) -> Result<Self> {
        let mut files = Vec::with_capacity(config.nbr_files * config.nbr_hash);
        for file in 0..config.nbr_files {
            for bucket in 0..config.nbr_hash {
                files.push(provider.open(&config.shard_file_path(file, bucket))?);
            }
        }

        Ok(Self {
            nbr_files: config.nbr_files,
            nbr_hash: config.nbr_hash,
            resident_limit: config.shard_resident_limit,
            resident: (0..files.len()).map(|_| None).collect(),
            files,
            state: IndexState::Idle,
            task: None,
            metrics,
        })
    }

    /// Current sub-state
    pub fn state(&self) -> IndexState {
        self.state
    }

    /// Check if no operation is in progress
    pub fn is_idle(&self) -> bool {
        self.task.is_none()
    }

    /// Shard files indexing data file `file`
    pub fn shard_files(&self, file: usize) -> &[Arc<dyn BlockFile>] {
        &self.files[file * self.nbr_hash..(file + 1) * self.nbr_hash]
    }

    /// Bytes used on disk by the shards of `file`
    pub fn shard_bytes(&self, file: usize) -> u64 {
        self.shard_files(file).iter().map(|f| f.len()).sum()
    }

    /// Resident copy of a shard, if loaded
    pub fn resident(&self, file: usize, bucket: usize) -> Option<&ShardIndex> {
        self.resident[self.slot(file, bucket)].as_ref()
    }

    /// Data file owning the most recently modified shard file
    pub fn most_recent_file(&self) -> Option<usize> {
        self.files
            .iter()
            .enumerate()
            .filter_map(|(idx, file)| file.modified().map(|time| (idx, time)))
            .max_by_key(|(_, time)| *time)
            .map(|(idx, _)| idx / self.nbr_hash)
    }

    /// Drop the resident shards of `file`
    pub fn clear_index(&mut self, file: usize) {
        let start = file * self.nbr_hash;
        for slot in &mut self.resident[start..start + self.nbr_hash] {
            *slot = None;
        }
    }

    /// Truncate the shard files of `file` and drop their resident copies
    pub fn clear_file_shards(&mut self, file: usize) {
        for shard in self.shard_files(file) {
            if let Err(e) = shard.clear() {
                warn!(path = %shard.path().display(), error = %e, "Failed to clear shard file");
            }
        }
        self.clear_index(file);
    }

    /// Look for `descriptor` in up to `max_files` files, walking backward
    /// from `start_file`
    pub fn find(&mut self, descriptor: &Descriptor, start_file: usize, max_files: usize) -> IndexStep {
        self.begin(Task::Find {
            descriptor: descriptor.clone(),
            bucket: descriptor.bucket(self.nbr_hash),
            file: start_file % self.nbr_files,
            remaining: max_files.clamp(1, self.nbr_files),
        })
    }

    /// Record that `descriptor` lives at `entry` in data file `file`
    pub fn update_map_index(&mut self, file: usize, descriptor: &Descriptor, entry: ShardEntry) -> IndexStep {
        self.begin(Task::Write {
            descriptor: descriptor.clone(),
            bucket: descriptor.bucket(self.nbr_hash),
            file,
            entry,
        })
    }

    /// Erase `descriptor` from the shards of every file
    pub fn remove(&mut self, descriptor: &Descriptor) -> IndexStep {
        self.begin(Task::Remove {
            descriptor: descriptor.clone(),
            bucket: descriptor.bucket(self.nbr_hash),
            file: 0,
        })
    }

    /// Resume the current operation with the completion of its request
    pub fn on_completion(&mut self, completion: IoCompletion) -> IndexStep {
        let Some(task) = self.task.as_ref() else {
            warn!("Shard completion arrived with no operation in progress");
            return IndexStep::Idle;
        };
        let (file, bucket) = task.location();
        let slot = self.slot(file, bucket);

        match self.state {
            IndexState::ReadingLength(mode) => {
                if completion == IoCompletion::Failed {
                    warn!(file, bucket, "Failed to read shard length");
                    return self.skip_unreadable();
                }
                let prefix = completion.into_bytes();
                match parse_length_prefix(&prefix) {
                    Some(len) if (4..=MAX_SHARD_BODY_LEN).contains(&len) => {
                        trace!(file, bucket, len, "Reading shard body");
                        self.state = IndexState::ReadingBody { mode, len };
                        return IndexStep::Io(IoRequest::new(
                            Arc::clone(&self.files[slot]),
                            IoOp::Read {
                                pos: FilePos::Start(SHARD_LENGTH_PREFIX as u64),
                                len,
                            },
                        ));
                    }
                    Some(len) => {
                        warn!(file, bucket, len, "Shard length out of range, using an empty shard");
                    }
                    None if !prefix.is_empty() => {
                        warn!(file, bucket, "Short shard header, using an empty shard");
                    }
                    None => {}
                }
                self.load(slot, ShardIndex::new());
                self.advance()
            }
            IndexState::ReadingBody { len, .. } => {
                if completion == IoCompletion::Failed {
                    warn!(file, bucket, "Failed to read shard body");
                    return self.skip_unreadable();
                }
                let body = completion.into_bytes();
                let shard = if body.len() < len {
                    warn!(file, bucket, expected = len, got = body.len(), "Short shard body, using an empty shard");
                    ShardIndex::new()
                } else {
                    ShardIndex::decode_body(&body[..len]).unwrap_or_else(|e| {
                        warn!(file, bucket, error = %e, "Corrupt shard, using an empty shard");
                        ShardIndex::new()
                    })
                };
                self.load(slot, shard);
                self.advance()
            }
            IndexState::WritingIndex { mode, len } => {
                let written = completion.written();
                let failed = written != len;
                if failed {
                    warn!(file, bucket, expected = len, written, "Shard write failed");
                    self.resident[slot] = None;
                } else if len > self.resident_limit {
                    debug!(file, bucket, len, "Dropping large shard from memory");
                    self.resident[slot] = None;
                }
                self.state = IndexState::Idle;

                match mode {
                    IndexMode::Removing => {
                        if self.next_remove_file() {
                            self.advance()
                        } else {
                            IndexStep::RemoveComplete
                        }
                    }
                    IndexMode::Writing | IndexMode::Finding => {
                        self.finish();
                        if failed {
                            IndexStep::IndexFailed
                        } else {
                            IndexStep::IndexWritten
                        }
                    }
                }
            }
            IndexState::Idle => {
                warn!(file, bucket, "Unexpected shard completion");
                IndexStep::Idle
            }
        }
    }

    fn slot(&self, file: usize, bucket: usize) -> usize {
        file * self.nbr_hash + bucket
    }

    fn begin(&mut self, task: Task) -> IndexStep {
        debug_assert!(self.task.is_none(), "shard operation already in progress");
        trace!(mode = ?task.mode(), "Starting shard operation");
        self.task = Some(task);
        self.state = IndexState::Idle;
        self.advance()
    }

    fn finish(&mut self) {
        self.task = None;
        self.state = IndexState::Idle;
    }

    fn load(&mut self, slot: usize, shard: ShardIndex) {
        self.metrics.record_shard_load();
        self.resident[slot] = Some(shard);
        self.state = IndexState::Idle;
    }

    /// Move a removal sweep to the next file; false once all were visited
    fn next_remove_file(&mut self) -> bool {
        if let Some(Task::Remove { file, .. }) = self.task.as_mut() {
            *file += 1;
            if *file < self.nbr_files {
                return true;
            }
        }
        self.finish();
        false
    }

    /// Give up on a shard whose file could not be read
    ///
    /// Nothing is loaded, so the shard is read again next time. A search
    /// moves on to the next file, a removal sweep skips this file and a
    /// write leaves the shard file as it is.
    fn skip_unreadable(&mut self) -> IndexStep {
        self.state = IndexState::Idle;
        let Some(mode) = self.task.as_ref().map(Task::mode) else {
            return IndexStep::Idle;
        };
        match mode {
            IndexMode::Finding => {
                let nbr_files = self.nbr_files;
                let mut exhausted = true;
                if let Some(Task::Find { file, remaining, .. }) = self.task.as_mut() {
                    *remaining -= 1;
                    *file = (*file + nbr_files - 1) % nbr_files;
                    exhausted = *remaining == 0;
                }
                if exhausted {
                    self.finish();
                    IndexStep::NotFound
                } else {
                    self.advance()
                }
            }
            IndexMode::Removing => {
                if self.next_remove_file() {
                    self.advance()
                } else {
                    IndexStep::RemoveComplete
                }
            }
            IndexMode::Writing => {
                self.finish();
                IndexStep::IndexFailed
            }
        }
    }

    /// Run the current task against resident shards until it needs I/O or
    /// finishes
    fn advance(&mut self) -> IndexStep {
        loop {
            let Some(task) = self.task.as_mut() else {
                return IndexStep::Idle;
            };
            let (file, bucket) = task.location();
            let slot = file * self.nbr_hash + bucket;

            let Some(shard) = self.resident[slot].as_mut() else {
                let mode = task.mode();
                trace!(file, bucket, ?mode, "Loading shard");
                self.state = IndexState::ReadingLength(mode);
                return IndexStep::Io(IoRequest::new(
                    Arc::clone(&self.files[slot]),
                    IoOp::Read {
                        pos: FilePos::Start(0),
                        len: SHARD_LENGTH_PREFIX,
                    },
                ));
            };

            let visit = match task {
                Task::Find {
                    descriptor,
                    file,
                    remaining,
                    ..
                } => match shard.get(descriptor) {
                    Some(entry) => Visit::Hit(*file, entry),
                    None => {
                        *remaining -= 1;
                        if *remaining == 0 {
                            Visit::Exhausted
                        } else {
                            *file = (*file + self.nbr_files - 1) % self.nbr_files;
                            continue;
                        }
                    }
                },
                Task::Write {
                    descriptor, entry, ..
                } => {
                    shard.insert(descriptor.clone(), *entry);
                    Visit::Rewrite
                }
                Task::Remove { descriptor, .. } => {
                    if shard.remove(descriptor).is_some() {
                        Visit::Rewrite
                    } else {
                        Visit::NextFile
                    }
                }
            };

            match visit {
                Visit::Hit(file, entry) => {
                    self.finish();
                    return IndexStep::Found { file, entry };
                }
                Visit::Exhausted => {
                    self.finish();
                    return IndexStep::NotFound;
                }
                Visit::Rewrite => return self.write_shard(slot),
                Visit::NextFile => {
                    if !self.next_remove_file() {
                        return IndexStep::RemoveComplete;
                    }
                }
            }
        }
    }

    fn write_shard(&mut self, slot: usize) -> IndexStep {
        let data = self.resident[slot]
            .as_ref()
            .map(ShardIndex::encode)
            .unwrap_or_default();
        let mode = self
            .task
            .as_ref()
            .map(Task::mode)
            .unwrap_or(IndexMode::Writing);
        self.state = IndexState::WritingIndex {
            mode,
            len: data.len(),
        };
        IndexStep::Io(IoRequest::new(
            Arc::clone(&self.files[slot]),
            IoOp::Rewrite { data },
        ))
    }
}

impl std::fmt::Debug for ShardIndexManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardIndexManager")
            .field("nbr_files", &self.nbr_files)
            .field("nbr_hash", &self.nbr_hash)
            .field("state", &self.state)
            .field(
                "resident",
                &self.resident.iter().filter(|s| s.is_some()).count(),
            )
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
