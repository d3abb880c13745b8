//! Multi-File Tile Cache
//!
//! Disk-backed cache for rendered tiles and other opaque blobs keyed by a
//! string descriptor. Blobs are appended to a small ring of data files;
//! each data file is indexed by a fixed number of shard files selected by a
//! hash of the descriptor.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                      CacheHandle (async, cloneable)                  │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                        CacheService (tokio task)                     │
//! │                                │                                     │
//! │                   MultiFileCache (state machine)                     │
//! │   ┌──────────────────┐   ┌──────────────────┐   ┌────────────────┐   │
//! │   │ WriteBehindQueue │   │ ShardIndexManager│   │  ParentCache   │   │
//! │   │ (pending blobs)  │   │ (fili.<n>_<h>)   │   │  (next tier)   │   │
//! │   └──────────────────┘   └──────────────────┘   └────────────────┘   │
//! │                                │                                     │
//! │        fil.0   fil.1   ...   fil.<nbr_files-1>   fil.dump            │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - A blob is visible to `get` as soon as `put` returns
//! - At most one disk request is outstanding per cache instance
//! - Disk failures degrade to a miss or a dropped write, never an error
//! - Blobs still queued at shutdown are restored on the next start

mod block_file;
mod buffer;
mod descriptor;
mod dump;
mod engine;
mod index;
mod metrics;
mod service;
mod shard;
mod write_queue;

pub use block_file::{
    BlockFile, FilePos, FileProvider, IoCompletion, IoOp, IoRequest, MemBlockFile,
    MemFileProvider, OsBlockFile, OsFileProvider,
};
pub use buffer::{ByteReader, ByteWriter};
pub use descriptor::{bucket_of, descriptor_hash, Descriptor};
pub use dump::{read_dump, write_dump};
pub use engine::{BufferListener, CachePhase, MultiFileCache, ParentCache};
pub use index::{IndexMode, IndexState, IndexStep, ShardIndexManager};
pub use metrics::{CacheMetrics, CacheStats, MetricsSnapshot};
pub use service::{CacheHandle, CacheService};
pub use shard::{parse_length_prefix, ShardEntry, ShardIndex, MAX_SHARD_BODY_LEN, SHARD_LENGTH_PREFIX};
pub use write_queue::{PendingWrite, WriteBehindQueue};

/// Number of most recently written files checked for an existing copy
/// before a blob is written
pub const DUPLICATE_SEARCH_FILES: usize = 2;
