//! Tilecache Admin CLI
//!
//! Opens a cache instance on disk, performs one operation through the
//! async service and shuts it down cleanly, so queued writes are either
//! flushed or dumped before the process exits.
//!
//! ```text
//! tilecache put 12/2048/1361.png tile.png
//! tilecache get 12/2048/1361.png --output tile.png
//! tilecache stats --json
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use bytes::Bytes;
use clap::{Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tilecache::cache::{CacheService, Descriptor, MultiFileCache, OsFileProvider, ShardIndex};
use tilecache::config::CacheConfig;
use tilecache::error::{Error, Result};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Tilecache - disk-backed multi-file tile cache
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file, overridden by the flags below
    #[arg(long, env = "TILECACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Cache root directory
    #[arg(long, env = "TILECACHE_DIR")]
    dir: Option<PathBuf>,

    /// Number of rotating data files
    #[arg(long, env = "TILECACHE_FILES")]
    files: Option<usize>,

    /// Number of shard files per data file
    #[arg(long, env = "TILECACHE_SHARDS")]
    shards: Option<usize>,

    /// Target total size in bytes
    #[arg(long, env = "TILECACHE_MAX_SIZE")]
    max_size: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store the contents of a file under a descriptor
    Put {
        descriptor: String,
        file: PathBuf,
    },
    /// Fetch a blob, writing it to stdout unless --output is given
    Get {
        descriptor: String,
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Remove a descriptor from every file
    Remove { descriptor: String },
    /// Print sizes and counters
    Stats {
        #[arg(long)]
        json: bool,
    },
    /// Print the shard bucket of a descriptor
    Bucket { descriptor: String },
    /// List the entries of one shard file
    Shard { file: usize, bucket: usize },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    init_logging(&args);

    let config = load_config(&args)?;
    debug!(?config, "Loaded configuration");

    match args.command {
        Command::Bucket { descriptor } => {
            let descriptor = Descriptor::new(descriptor)?;
            println!("{}", descriptor.bucket(config.nbr_hash));
            Ok(ExitCode::SUCCESS)
        }
        Command::Shard { file, bucket } => print_shard(&config, file, bucket).await,
        command => run_command(config, command).await,
    }
}

async fn run_command(config: CacheConfig, command: Command) -> Result<ExitCode> {
    let cache = tokio::task::spawn_blocking(move || {
        MultiFileCache::open(config, &OsFileProvider, None)
    })
    .await
    .map_err(|e| Error::Internal(format!("Cache open task failed: {}", e)))??;
    let handle = CacheService::spawn(cache);

    let outcome = match command {
        Command::Put { descriptor, file } => {
            let descriptor = Descriptor::new(descriptor)?;
            let blob = tokio::fs::read(&file).await?;
            info!(%descriptor, bytes = blob.len(), "Storing blob");
            handle.put(descriptor, Bytes::from(blob))?;
            ExitCode::SUCCESS
        }
        Command::Get { descriptor, output } => {
            let descriptor = Descriptor::new(descriptor)?;
            match handle.get(&descriptor).await? {
                Some(blob) => {
                    match output {
                        Some(path) => tokio::fs::write(&path, &blob).await?,
                        None => {
                            let mut stdout = tokio::io::stdout();
                            stdout.write_all(&blob).await?;
                            stdout.flush().await?;
                        }
                    }
                    ExitCode::SUCCESS
                }
                None => {
                    eprintln!("{}: not found", descriptor);
                    ExitCode::from(1)
                }
            }
        }
        Command::Remove { descriptor } => {
            handle.remove(&Descriptor::new(descriptor)?)?;
            ExitCode::SUCCESS
        }
        Command::Stats { json } => {
            handle.flush().await?;
            let stats = handle.stats().await?;
            if json {
                let text = serde_json::to_string_pretty(&stats)
                    .map_err(|e| Error::Internal(format!("Failed to encode stats: {}", e)))?;
                println!("{}", text);
            } else {
                println!("phase:         {}", stats.phase);
                println!("max size:      {}", stats.max_size);
                println!("per file:      {}", stats.max_size_per_file);
                println!("total size:    {}", stats.total_size);
                println!("current file:  {}", stats.current_file);
                for (file, size) in stats.file_sizes.iter().enumerate() {
                    println!("  fil.{:<9} {}", file, size);
                }
                println!("queued writes: {}", stats.write_queue_len);
            }
            ExitCode::SUCCESS
        }
        Command::Bucket { .. } | Command::Shard { .. } => ExitCode::SUCCESS,
    };

    handle.flush().await?;
    let dumped = handle.shutdown().await?;
    debug!(dumped, "Cache shut down");
    Ok(outcome)
}

async fn print_shard(config: &CacheConfig, file: usize, bucket: usize) -> Result<ExitCode> {
    if file >= config.nbr_files || bucket >= config.nbr_hash {
        return Err(Error::Config(format!(
            "shard {}/{} out of range for {} files x {} shards",
            file, bucket, config.nbr_files, config.nbr_hash
        )));
    }

    let path = config.shard_file_path(file, bucket);
    let data = match tokio::fs::read(&path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    let shard = if data.is_empty() {
        ShardIndex::new()
    } else {
        ShardIndex::decode(&data)?
    };

    println!("# {} ({} entries)", path.display(), shard.len());
    for (descriptor, entry) in shard.iter() {
        println!("{}\t{}\t{}", descriptor, entry.offset, entry.length);
    }
    Ok(ExitCode::SUCCESS)
}

// =============================================================================
// Configuration
// =============================================================================

fn load_config(args: &Args) -> Result<CacheConfig> {
    let mut config = match &args.config {
        Some(path) => CacheConfig::from_yaml_file(path)?,
        None => CacheConfig::default(),
    };

    if let Some(dir) = &args.dir {
        config.base_path = dir.clone();
    }
    if let Some(files) = args.files {
        config.nbr_files = files;
    }
    if let Some(shards) = args.shards {
        config.nbr_hash = shards;
    }
    if let Some(max_size) = args.max_size {
        config.max_size = max_size;
    }

    config.validate()?;
    Ok(config)
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // stdout carries blob data for `get`
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
