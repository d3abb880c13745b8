//! Async Cache Service
//!
//! Runs a [`MultiFileCache`] on a tokio task. Callers talk to it through a
//! cloneable [`CacheHandle`]; disk requests are executed on the blocking
//! thread pool, one at a time, and their completions are fed back into the
//! engine from the service loop.
//!
//! ```text
//!   CacheHandle ──mpsc──▶ service loop ──spawn_blocking──▶ IoRequest::execute
//!        ▲                    │   ▲                               │
//!        └──── oneshot ───────┘   └────────── IoCompletion ───────┘
//! ```

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, instrument, warn};

use super::block_file::IoCompletion;
use super::descriptor::Descriptor;
use super::engine::{BufferListener, MultiFileCache};
use super::metrics::{CacheMetrics, CacheStats};
use crate::error::{Error, Result};

enum Command {
    Get {
        descriptor: Descriptor,
        listener: Arc<dyn BufferListener>,
    },
    Put {
        descriptor: Descriptor,
        blob: Bytes,
    },
    Remove(Descriptor),
    CancelAll,
    SetMaxSize(u64),
    ClearCache,
    Stats(oneshot::Sender<CacheStats>),
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<Result<usize>>),
}

enum Event {
    IoDone(std::result::Result<IoCompletion, JoinError>),
    Command(Option<Command>),
}

/// Delivers one blob to a waiting `get`
struct OneshotListener {
    tx: Mutex<Option<oneshot::Sender<Bytes>>>,
}

impl BufferListener for OneshotListener {
    fn buffer_received(&self, _descriptor: &Descriptor, blob: Bytes) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(blob);
        }
    }
}

/// Spawner of the service task
pub struct CacheService;

impl CacheService {
    /// Move `cache` onto a new tokio task
    pub fn spawn(cache: MultiFileCache) -> CacheHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let metrics = Arc::clone(cache.metrics());
        tokio::spawn(run(cache, rx));
        CacheHandle { tx, metrics }
    }
}

/// Handle to a running cache service
#[derive(Clone)]
pub struct CacheHandle {
    tx: mpsc::UnboundedSender<Command>,
    metrics: Arc<CacheMetrics>,
}

impl CacheHandle {
    /// Look up `descriptor`, resolving to `None` on a miss
    pub async fn get(&self, descriptor: &Descriptor) -> Result<Option<Bytes>> {
        let (tx, rx) = oneshot::channel();
        let listener = Arc::new(OneshotListener {
            tx: Mutex::new(Some(tx)),
        });
        self.get_with(descriptor, listener)?;
        Ok(rx.await.ok())
    }

    /// Look up `descriptor`, delivering a hit to `listener`
    pub fn get_with(&self, descriptor: &Descriptor, listener: Arc<dyn BufferListener>) -> Result<()> {
        self.send(Command::Get {
            descriptor: descriptor.clone(),
            listener,
        })
    }

    pub fn put(&self, descriptor: Descriptor, blob: Bytes) -> Result<()> {
        self.send(Command::Put { descriptor, blob })
    }

    pub fn remove(&self, descriptor: &Descriptor) -> Result<()> {
        self.send(Command::Remove(descriptor.clone()))
    }

    pub fn cancel_all(&self) -> Result<()> {
        self.send(Command::CancelAll)
    }

    pub fn set_max_size(&self, size: u64) -> Result<()> {
        self.send(Command::SetMaxSize(size))
    }

    pub fn clear_cache(&self) -> Result<()> {
        self.send(Command::ClearCache)
    }

    /// Current statistics
    pub async fn stats(&self) -> Result<CacheStats> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Stats(tx))?;
        rx.await.map_err(|_| Error::ServiceClosed)
    }

    /// Wait until every queued write, lookup and removal has been handled
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Flush(tx))?;
        rx.await.map_err(|_| Error::ServiceClosed)
    }

    /// Stop the service, saving unwritten blobs to the dump file
    ///
    /// Returns the number of records dumped.
    pub async fn shutdown(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Shutdown(tx))?;
        rx.await.map_err(|_| Error::ServiceClosed)?
    }

    /// Live counters of the cache
    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    fn send(&self, command: Command) -> Result<()> {
        self.tx.send(command).map_err(|_| Error::ServiceClosed)
    }
}

#[instrument(skip_all, fields(path = %cache.config().storage_dir().display()))]
async fn run(mut cache: MultiFileCache, mut rx: mpsc::UnboundedReceiver<Command>) {
    info!("Starting cache service");
    let mut in_flight: Option<JoinHandle<IoCompletion>> = None;
    let mut flush_waiters: Vec<oneshot::Sender<()>> = Vec::new();
    cache.resume();

    loop {
        if in_flight.is_none() {
            if let Some(request) = cache.next_io() {
                let metrics = Arc::clone(cache.metrics());
                in_flight = Some(tokio::task::spawn_blocking(move || {
                    let started = Instant::now();
                    let completion = request.execute();
                    metrics.record_io_latency(started.elapsed());
                    completion
                }));
            } else if cache.is_quiescent() {
                for waiter in flush_waiters.drain(..) {
                    let _ = waiter.send(());
                }
            }
        }

        let event = tokio::select! {
            done = async {
                match in_flight.as_mut() {
                    Some(handle) => handle.await,
                    None => std::future::pending().await,
                }
            } => Event::IoDone(done),
            command = rx.recv() => Event::Command(command),
        };

        match event {
            Event::IoDone(done) => {
                in_flight = None;
                cache.complete_io(completion_of(done));
            }
            Event::Command(Some(Command::Shutdown(reply))) => {
                let result = shutdown(cache, in_flight.take()).await;
                let _ = reply.send(result);
                return;
            }
            Event::Command(Some(command)) => handle_command(&mut cache, command, &mut flush_waiters),
            Event::Command(None) => {
                debug!("All cache handles dropped");
                if let Err(e) = shutdown(cache, in_flight.take()).await {
                    warn!(error = %e, "Failed to shut down cache");
                }
                return;
            }
        }
    }
}

fn handle_command(
    cache: &mut MultiFileCache,
    command: Command,
    flush_waiters: &mut Vec<oneshot::Sender<()>>,
) {
    match command {
        Command::Get {
            descriptor,
            listener,
        } => cache.get(&descriptor, listener),
        Command::Put { descriptor, blob } => cache.put(descriptor, blob),
        Command::Remove(descriptor) => cache.remove(&descriptor),
        Command::CancelAll => cache.cancel_all(),
        Command::SetMaxSize(size) => cache.set_max_size(size),
        Command::ClearCache => cache.clear_cache(),
        Command::Stats(reply) => {
            let _ = reply.send(cache.stats());
        }
        Command::Flush(reply) => flush_waiters.push(reply),
        Command::Shutdown(_) => {}
    }
}

fn completion_of(done: std::result::Result<IoCompletion, JoinError>) -> IoCompletion {
    done.unwrap_or_else(|e| {
        warn!(error = %e, "Disk request task failed");
        IoCompletion::Failed
    })
}

/// Finish the outstanding request, then dump on a blocking thread
async fn shutdown(
    mut cache: MultiFileCache,
    in_flight: Option<JoinHandle<IoCompletion>>,
) -> Result<usize> {
    if let Some(handle) = in_flight {
        cache.complete_io(completion_of(handle.await));
    }
    let result = tokio::task::spawn_blocking(move || cache.shutdown())
        .await
        .map_err(|e| Error::Internal(format!("shutdown task failed: {e}")))?;
    info!("Cache service stopped");
    result
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::block_file::MemFileProvider;
    use crate::cache::engine::ParentCache;
    use crate::config::CacheConfig;
    use assert_matches::assert_matches;

    fn desc(s: &str) -> Descriptor {
        Descriptor::new(s).unwrap()
    }

    fn config() -> CacheConfig {
        let mut config = CacheConfig::new("/mem");
        config.nbr_files = 3;
        config.nbr_hash = 4;
        config.max_size = 64 * 1024;
        config
    }

    fn spawn(provider: &MemFileProvider, parent: Option<Arc<dyn ParentCache>>) -> CacheHandle {
        let cache = MultiFileCache::open(config(), provider, parent).unwrap();
        CacheService::spawn(cache)
    }

    /// Answers every request with the descriptor text
    struct EchoParent;

    impl ParentCache for EchoParent {
        fn request(&self, descriptor: &Descriptor, listener: Arc<dyn BufferListener>) {
            listener.buffer_received(descriptor, Bytes::copy_from_slice(descriptor.as_bytes()));
        }
    }

    #[tokio::test]
    async fn test_put_flush_get() {
        let provider = MemFileProvider::new();
        let handle = spawn(&provider, None);

        handle.put(desc("a"), Bytes::from_static(b"alpha")).unwrap();
        handle.flush().await.unwrap();

        assert_eq!(
            handle.get(&desc("a")).await.unwrap(),
            Some(Bytes::from_static(b"alpha"))
        );
        assert_eq!(handle.metrics().disk_hits(), 1);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_get_before_flush_hits_queue() {
        let provider = MemFileProvider::new();
        let handle = spawn(&provider, None);

        handle.put(desc("a"), Bytes::from_static(b"1")).unwrap();
        assert_eq!(
            handle.get(&desc("a")).await.unwrap(),
            Some(Bytes::from_static(b"1"))
        );
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_miss_resolves_to_none() {
        let provider = MemFileProvider::new();
        let handle = spawn(&provider, None);
        assert_eq!(handle.get(&desc("missing")).await.unwrap(), None);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_miss_goes_to_parent() {
        let provider = MemFileProvider::new();
        let handle = spawn(&provider, Some(Arc::new(EchoParent)));
        assert_eq!(
            handle.get(&desc("from-parent")).await.unwrap(),
            Some(Bytes::from_static(b"from-parent"))
        );
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_and_stats() {
        let provider = MemFileProvider::new();
        let handle = spawn(&provider, None);

        handle.put(desc("a"), Bytes::from_static(b"1")).unwrap();
        handle.put(desc("b"), Bytes::from_static(b"2")).unwrap();
        handle.flush().await.unwrap();
        handle.remove(&desc("a")).unwrap();
        handle.flush().await.unwrap();

        assert_eq!(handle.get(&desc("a")).await.unwrap(), None);
        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.metrics.blobs_written, 2);
        assert_eq!(stats.metrics.removals, 1);
        assert_eq!(stats.pending_removals, 0);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_then_restart_keeps_blobs() {
        let provider = MemFileProvider::new();
        let handle = spawn(&provider, None);
        for i in 0..20 {
            handle
                .put(desc(&format!("t{i}")), Bytes::from(vec![i as u8; 100]))
                .unwrap();
        }
        handle.shutdown().await.unwrap();
        assert_matches!(handle.stats().await, Err(Error::ServiceClosed));

        let handle = spawn(&provider, None);
        for i in 0..20 {
            assert_eq!(
                handle.get(&desc(&format!("t{i}"))).await.unwrap(),
                Some(Bytes::from(vec![i as u8; 100])),
                "t{i} lost across restart"
            );
        }
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_clear_cache() {
        let provider = MemFileProvider::new();
        let handle = spawn(&provider, None);
        handle.put(desc("a"), Bytes::from_static(b"1")).unwrap();
        handle.flush().await.unwrap();

        handle.clear_cache().unwrap();
        handle.flush().await.unwrap();
        assert_eq!(handle.stats().await.unwrap().total_size, 0);
        assert_eq!(handle.get(&desc("a")).await.unwrap(), None);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_set_max_size() {
        let provider = MemFileProvider::new();
        let handle = spawn(&provider, None);
        handle.set_max_size(3000).unwrap();
        handle.flush().await.unwrap();

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.max_size, 3000);
        assert_eq!(stats.max_size_per_file, 1001);
        handle.shutdown().await.unwrap();
    }
}
