//! Block Files - Storage Backend Abstraction
//!
//! Every file the cache touches (data files, shard files, dump files) sits
//! behind the [`BlockFile`] trait so the engine can run against real files
//! or against the in-memory fake used by the tests.
//!
//! # I/O Requests
//!
//! The engine never performs positioned I/O itself. It describes the
//! operation as an [`IoRequest`], a driver executes it (inline, or on a
//! blocking thread) and hands the [`IoCompletion`] back. Only cheap
//! metadata calls (`len`, `clear`, `available_space`, `modified`) are made
//! directly, and only while no request is in flight.

use std::collections::HashMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::warn;

use crate::error::Result;

/// Cursor position for the next read or write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilePos {
    /// Absolute byte offset
    Start(u64),
    /// Current end of file
    End,
}

/// One file owned by the cache
pub trait BlockFile: Send + Sync + fmt::Debug {
    /// Path of the file
    fn path(&self) -> &Path;

    /// Move the cursor, returning the new absolute position
    fn set_pos(&self, pos: FilePos) -> io::Result<u64>;

    /// Current cursor position
    fn tell(&self) -> io::Result<u64>;

    /// Read up to `max_len` bytes at the cursor
    ///
    /// Fewer bytes are returned at end of file.
    fn read(&self, max_len: usize) -> io::Result<Bytes>;

    /// Write `data` at the cursor, returning the number of bytes written
    fn write(&self, data: &[u8]) -> io::Result<usize>;

    /// Current length in bytes
    fn len(&self) -> u64;

    /// Check if the file is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Truncate to zero length and rewind
    fn clear(&self) -> io::Result<()>;

    /// Free bytes on the device holding the file
    fn available_space(&self) -> u64;

    /// Last modification time, `None` while the file is empty
    fn modified(&self) -> Option<SystemTime>;

    /// Abandon outstanding work on shutdown
    fn cancel(&self) {}
}

// =============================================================================
// I/O Requests
// =============================================================================

/// Operation to perform on a block file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoOp {
    /// Read up to `len` bytes at `pos`
    Read { pos: FilePos, len: usize },
    /// Write `data` at `pos`
    Write { pos: FilePos, data: Bytes },
    /// Replace the whole file with `data`
    Rewrite { data: Bytes },
}

/// A pending disk operation issued by the engine
pub struct IoRequest {
    file: Arc<dyn BlockFile>,
    op: IoOp,
}

impl IoRequest {
    /// Create a request for `op` on `file`
    pub fn new(file: Arc<dyn BlockFile>, op: IoOp) -> Self {
        Self { file, op }
    }

    /// Target file
    pub fn file(&self) -> &Arc<dyn BlockFile> {
        &self.file
    }

    /// Requested operation
    pub fn op(&self) -> &IoOp {
        &self.op
    }

    /// Perform the operation, blocking the calling thread
    ///
    /// Errors are logged and reported as [`IoCompletion::Failed`]; the
    /// engine treats them like a short read or write.
    pub fn execute(self) -> IoCompletion {
        let result = match &self.op {
            IoOp::Read { pos, len } => self
                .file
                .set_pos(*pos)
                .and_then(|_| self.file.read(*len))
                .map(IoCompletion::Read),
            IoOp::Write { pos, data } => self
                .file
                .set_pos(*pos)
                .and_then(|_| self.file.write(data))
                .map(IoCompletion::Written),
            IoOp::Rewrite { data } => self
                .file
                .clear()
                .and_then(|_| self.file.write(data))
                .map(IoCompletion::Written),
        };

        result.unwrap_or_else(|e| {
            warn!(
                path = %self.file.path().display(),
                error = %e,
                "Block file operation failed"
            );
            IoCompletion::Failed
        })
    }
}

impl fmt::Debug for IoRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match &self.op {
            IoOp::Read { pos, len } => format!("Read({pos:?}, {len})"),
            IoOp::Write { pos, data } => format!("Write({pos:?}, {} bytes)", data.len()),
            IoOp::Rewrite { data } => format!("Rewrite({} bytes)", data.len()),
        };
        f.debug_struct("IoRequest")
            .field("path", &self.file.path())
            .field("op", &op)
            .finish()
    }
}

/// Result of an executed [`IoRequest`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoCompletion {
    /// Bytes read; may be shorter than requested
    Read(Bytes),
    /// Number of bytes written
    Written(usize),
    /// The operation could not be performed
    Failed,
}

impl IoCompletion {
    /// Bytes delivered by a read, empty for anything else
    pub fn into_bytes(self) -> Bytes {
        match self {
            IoCompletion::Read(bytes) => bytes,
            _ => Bytes::new(),
        }
    }

    /// Bytes written by a write, zero for anything else
    pub fn written(&self) -> usize {
        match self {
            IoCompletion::Written(n) => *n,
            _ => 0,
        }
    }
}

// =============================================================================
// OS Files
// =============================================================================

/// Block file backed by a regular file
#[derive(Debug)]
pub struct OsBlockFile {
    path: PathBuf,
    file: Mutex<File>,
}

impl OsBlockFile {
    /// Open or create the file, creating missing parent directories
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }
}

impl BlockFile for OsBlockFile {
    fn path(&self) -> &Path {
        &self.path
    }

    fn set_pos(&self, pos: FilePos) -> io::Result<u64> {
        let mut file = self.file.lock();
        match pos {
            FilePos::Start(offset) => file.seek(SeekFrom::Start(offset)),
            FilePos::End => file.seek(SeekFrom::End(0)),
        }
    }

    fn tell(&self) -> io::Result<u64> {
        self.file.lock().stream_position()
    }

    fn read(&self, max_len: usize) -> io::Result<Bytes> {
        let mut file = self.file.lock();
        let mut buf = Vec::with_capacity(max_len);
        (&mut *file).take(max_len as u64).read_to_end(&mut buf)?;
        Ok(Bytes::from(buf))
    }

    fn write(&self, data: &[u8]) -> io::Result<usize> {
        let mut file = self.file.lock();
        file.write_all(data)?;
        Ok(data.len())
    }

    fn len(&self) -> u64 {
        self.file.lock().metadata().map(|m| m.len()).unwrap_or(0)
    }

    fn clear(&self) -> io::Result<()> {
        let mut file = self.file.lock();
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    fn available_space(&self) -> u64 {
        let dir = self.path.parent().unwrap_or(&self.path);
        fs2::available_space(dir).unwrap_or_else(|e| {
            warn!(path = %dir.display(), error = %e, "Could not query free disk space");
            u64::MAX
        })
    }

    fn modified(&self) -> Option<SystemTime> {
        let file = self.file.lock();
        let metadata = file.metadata().ok()?;
        if metadata.len() == 0 {
            return None;
        }
        metadata.modified().ok()
    }

    fn cancel(&self) {
        if let Err(e) = self.file.lock().sync_data() {
            warn!(path = %self.path.display(), error = %e, "Failed to sync file on shutdown");
        }
    }
}

// =============================================================================
// In-Memory Files
// =============================================================================

#[derive(Debug, Default)]
struct MemContents {
    data: Vec<u8>,
    pos: u64,
    modified: Option<SystemTime>,
}

/// In-memory block file for tests and dry runs
///
/// Supports failure injection and a settable free space figure.
#[derive(Debug)]
pub struct MemBlockFile {
    path: PathBuf,
    contents: Mutex<MemContents>,
    available: AtomicU64,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    clock: Arc<AtomicU64>,
}

impl MemBlockFile {
    /// Create an empty file with its own modification clock
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_clock(path, Arc::new(AtomicU64::new(1)))
    }

    fn with_clock(path: impl Into<PathBuf>, clock: Arc<AtomicU64>) -> Self {
        Self {
            path: path.into(),
            contents: Mutex::new(MemContents::default()),
            available: AtomicU64::new(u64::MAX / 2),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            clock,
        }
    }

    /// Make subsequent reads fail
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Relaxed);
    }

    /// Make subsequent writes fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Set the value reported by `available_space`
    pub fn set_available_space(&self, bytes: u64) {
        self.available.store(bytes, Ordering::Relaxed);
    }

    /// Copy of the whole file contents
    pub fn contents(&self) -> Vec<u8> {
        self.contents.lock().data.clone()
    }

    /// Replace the file contents
    pub fn set_contents(&self, data: &[u8]) {
        let mut contents = self.contents.lock();
        contents.data = data.to_vec();
        contents.pos = 0;
        contents.modified = Some(self.tick());
    }

    fn tick(&self) -> SystemTime {
        let millis = self.clock.fetch_add(1, Ordering::Relaxed);
        UNIX_EPOCH + Duration::from_millis(millis)
    }
}

impl BlockFile for MemBlockFile {
    fn path(&self) -> &Path {
        &self.path
    }

    fn set_pos(&self, pos: FilePos) -> io::Result<u64> {
        let mut contents = self.contents.lock();
        contents.pos = match pos {
            FilePos::Start(offset) => offset,
            FilePos::End => contents.data.len() as u64,
        };
        Ok(contents.pos)
    }

    fn tell(&self) -> io::Result<u64> {
        Ok(self.contents.lock().pos)
    }

    fn read(&self, max_len: usize) -> io::Result<Bytes> {
        if self.fail_reads.load(Ordering::Relaxed) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected read failure"));
        }
        let mut contents = self.contents.lock();
        let start = (contents.pos as usize).min(contents.data.len());
        let end = start.saturating_add(max_len).min(contents.data.len());
        let bytes = Bytes::copy_from_slice(&contents.data[start..end]);
        contents.pos = end as u64;
        Ok(bytes)
    }

    fn write(&self, data: &[u8]) -> io::Result<usize> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected write failure"));
        }
        let modified = self.tick();
        let mut contents = self.contents.lock();
        let start = contents.pos as usize;
        let end = start + data.len();
        if contents.data.len() < end {
            contents.data.resize(end, 0);
        }
        contents.data[start..end].copy_from_slice(data);
        contents.pos = end as u64;
        contents.modified = Some(modified);
        Ok(data.len())
    }

    fn len(&self) -> u64 {
        self.contents.lock().data.len() as u64
    }

    fn clear(&self) -> io::Result<()> {
        let mut contents = self.contents.lock();
        contents.data.clear();
        contents.pos = 0;
        Ok(())
    }

    fn available_space(&self) -> u64 {
        self.available.load(Ordering::Relaxed)
    }

    fn modified(&self) -> Option<SystemTime> {
        let contents = self.contents.lock();
        if contents.data.is_empty() {
            return None;
        }
        contents.modified
    }
}

// =============================================================================
// File Providers
// =============================================================================

/// Opens the files of a cache instance
pub trait FileProvider: Send + Sync {
    /// Open (creating if needed) the file at `path`
    fn open(&self, path: &Path) -> Result<Arc<dyn BlockFile>>;
}

/// Provider of [`OsBlockFile`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct OsFileProvider;

impl FileProvider for OsFileProvider {
    fn open(&self, path: &Path) -> Result<Arc<dyn BlockFile>> {
        let file: Arc<dyn BlockFile> = Arc::new(OsBlockFile::open(path)?);
        Ok(file)
    }
}

/// Provider of [`MemBlockFile`]s
///
/// Files are retained by path, so opening a second cache on the same
/// provider behaves like a process restart on the same directory.
#[derive(Debug)]
pub struct MemFileProvider {
    files: Mutex<HashMap<PathBuf, Arc<MemBlockFile>>>,
    clock: Arc<AtomicU64>,
    available: AtomicU64,
}

impl Default for MemFileProvider {
    fn default() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            clock: Arc::new(AtomicU64::new(1)),
            available: AtomicU64::new(u64::MAX / 2),
        }
    }
}

impl MemFileProvider {
    /// Create an empty provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a previously opened file
    pub fn file(&self, path: &Path) -> Option<Arc<MemBlockFile>> {
        self.files.lock().get(path).cloned()
    }

    /// Set the free space reported by every file, present and future
    pub fn set_available_space(&self, bytes: u64) {
        self.available.store(bytes, Ordering::Relaxed);
        for file in self.files.lock().values() {
            file.set_available_space(bytes);
        }
    }

    /// Number of files opened so far
    pub fn len(&self) -> usize {
        self.files.lock().len()
    }

    /// Check if no file has been opened
    pub fn is_empty(&self) -> bool {
        self.files.lock().is_empty()
    }
}

impl FileProvider for MemFileProvider {
    fn open(&self, path: &Path) -> Result<Arc<dyn BlockFile>> {
        let mut files = self.files.lock();
        let file: Arc<dyn BlockFile> = files
            .entry(path.to_path_buf())
            .or_insert_with(|| {
                let file = MemBlockFile::with_clock(path, Arc::clone(&self.clock));
                file.set_available_space(self.available.load(Ordering::Relaxed));
                Arc::new(file)
            })
            .clone();
        Ok(file)
    }
}

// =============================================================================
// Tests
// =============================================================================
