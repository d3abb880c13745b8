//! Tilecache - Disk-Backed Multi-File Buffer Cache
//!
//! A persistent cache for rendered map tiles and other opaque blobs keyed
//! by a string descriptor. Writes are buffered in a write-behind queue,
//! appended to a ring of rotating data files and indexed by hashed shard
//! files. The least recently written file is evicted whole once the size
//! budget is reached.
//!
//! # Architecture
//!
//! ```text
//! CacheHandle → CacheService (tokio) → MultiFileCache → BlockFile
//!                                            │
//!                                            └──▶ ParentCache (on miss)
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Cache engine, on-disk formats and async service
//! - [`config`] - Cache configuration
//! - [`error`] - Error types

pub mod cache;
pub mod config;
pub mod error;

// Re-export commonly used types
pub use cache::{
    BufferListener, CacheHandle, CacheMetrics, CacheService, CacheStats, Descriptor,
    MultiFileCache, OsFileProvider, ParentCache,
};
pub use config::CacheConfig;
pub use error::{Error, Result};
