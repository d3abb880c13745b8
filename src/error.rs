//! Error types for the tile cache

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the tile cache
///
/// Disk failures inside the running engine are not reported through this
/// type: they degrade to a cache miss or a dropped write. These variants
/// cover construction, configuration, the on-disk codecs and the async
/// service handle.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML configuration parse error
    #[error("Failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Descriptor cannot be stored in a shard file
    #[error("Invalid descriptor {0:?}: descriptors must not contain NUL bytes")]
    InvalidDescriptor(String),

    /// A record ended before a field could be read
    #[error("Buffer too short: needed {needed} bytes, {remaining} remaining")]
    ShortBuffer { needed: usize, remaining: usize },

    /// Shard file contents could not be decoded
    #[error("Corrupt shard index: {0}")]
    CorruptShard(String),

    /// Dump file contents could not be decoded
    #[error("Corrupt dump file: {0}")]
    CorruptDump(String),

    /// The cache service task has stopped
    #[error("Cache service is not running")]
    ServiceClosed,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
