//! Cache configuration
//!
//! Loaded from YAML by the binary and layered under command line flags.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default number of rotating data files
pub const DEFAULT_NBR_FILES: usize = 5;

/// Default number of shard files per data file
pub const DEFAULT_NBR_HASH: usize = 23;

/// Default total on-disk budget (10MB)
pub const DEFAULT_MAX_SIZE: u64 = 10 * 1024 * 1024;

/// Default write-behind queue budget (256KB)
pub const DEFAULT_WRITE_QUEUE_BYTES: usize = 256 * 1024;

/// Serialized shard size above which the shard is not kept in memory (10KB)
pub const DEFAULT_SHARD_RESIDENT_LIMIT: usize = 10 * 1024;

/// Free space always left on the disk (512KB)
pub const DEFAULT_DISK_HEADROOM: u64 = 512 * 1024;

/// Number of writes between two free space checks
pub const DEFAULT_DISK_CHECK_INTERVAL: u64 = 32;

/// Multi-file cache configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Root directory of the cache
    pub base_path: PathBuf,
    /// Instance name, used as the storage directory below `base_path`
    pub instance: String,
    /// Number of rotating data files
    pub nbr_files: usize,
    /// Number of shard files per data file
    pub nbr_hash: usize,
    /// Target total on-disk size in bytes
    pub max_size: u64,
    /// Soft byte budget of the write-behind queue
    pub write_queue_bytes: usize,
    /// Serialized shard size above which a shard is evicted from memory
    pub shard_resident_limit: usize,
    /// Free space kept on the disk when sizing the cache
    pub disk_headroom: u64,
    /// Successful writes between two free space checks
    pub disk_check_interval: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("./tilecache"),
            instance: "a".to_string(),
            nbr_files: DEFAULT_NBR_FILES,
            nbr_hash: DEFAULT_NBR_HASH,
            max_size: DEFAULT_MAX_SIZE,
            write_queue_bytes: DEFAULT_WRITE_QUEUE_BYTES,
            shard_resident_limit: DEFAULT_SHARD_RESIDENT_LIMIT,
            disk_headroom: DEFAULT_DISK_HEADROOM,
            disk_check_interval: DEFAULT_DISK_CHECK_INTERVAL,
        }
    }
}

impl CacheConfig {
    /// Create a configuration rooted at `base_path` with default sizing
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            ..Default::default()
        }
    }

    /// Load a configuration from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&text)
    }

    /// Parse a configuration from YAML text
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every count and limit is usable
    pub fn validate(&self) -> Result<()> {
        if self.nbr_files == 0 {
            return Err(Error::Config("nbr_files must be at least 1".into()));
        }
        if self.nbr_hash == 0 {
            return Err(Error::Config("nbr_hash must be at least 1".into()));
        }
        if self.instance.is_empty() || self.instance.contains(['/', '\\']) {
            return Err(Error::Config(format!(
                "instance {:?} is not a valid directory name",
                self.instance
            )));
        }
        if self.disk_check_interval == 0 {
            return Err(Error::Config(
                "disk_check_interval must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Directory holding every file of this instance
    pub fn storage_dir(&self) -> PathBuf {
        self.base_path.join(&self.instance)
    }

    /// Path of data file `file`
    pub fn data_file_path(&self, file: usize) -> PathBuf {
        self.storage_dir().join(format!("fil.{file}"))
    }

    /// Path of the shard file for `bucket` of data file `file`
    pub fn shard_file_path(&self, file: usize, bucket: usize) -> PathBuf {
        self.storage_dir()
            .join(file.to_string())
            .join(format!("fili.{file}_{bucket}"))
    }

    /// Path of the shutdown dump file
    pub fn dump_file_path(&self) -> PathBuf {
        self.storage_dir().join("fil.dump")
    }

    /// Path of the dump file with maps installed before first start
    pub fn initial_dump_file_path(&self) -> PathBuf {
        self.storage_dir().join("initial.dump")
    }
}

// =============================================================================
// Tests
// =============================================================================
