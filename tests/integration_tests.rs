//! Tilecache Integration Tests
//!
//! End-to-end scenarios against real files in a temporary directory:
//! - Engine driven synchronously over the OS block files
//! - Async service restart with dump files
//! - Startup behaviour with seeded and damaged files

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tempfile::TempDir;

use tilecache::cache::{
    write_dump, BlockFile, BufferListener, CacheService, Descriptor, MultiFileCache, OsBlockFile,
    OsFileProvider, ParentCache, ShardIndex,
};
use tilecache::config::CacheConfig;

fn desc(s: &str) -> Descriptor {
    Descriptor::new(s).unwrap()
}

fn config(dir: &TempDir) -> CacheConfig {
    let mut config = CacheConfig::new(dir.path());
    config.nbr_files = 3;
    config.nbr_hash = 5;
    config.max_size = 1024 * 1024;
    config.disk_headroom = 0;
    config
}

#[derive(Default)]
struct Recorder {
    received: Mutex<Vec<Bytes>>,
}

impl BufferListener for Recorder {
    fn buffer_received(&self, _descriptor: &Descriptor, blob: Bytes) {
        self.received.lock().push(blob);
    }
}

#[derive(Default)]
struct MissLog {
    requests: Mutex<Vec<Descriptor>>,
}

impl ParentCache for MissLog {
    fn request(&self, descriptor: &Descriptor, _listener: Arc<dyn BufferListener>) {
        self.requests.lock().push(descriptor.clone());
    }
}

fn get(cache: &mut MultiFileCache, descriptor: &str) -> Option<Bytes> {
    let recorder = Arc::new(Recorder::default());
    cache.get(&desc(descriptor), recorder.clone());
    cache.run_until_idle();
    let received = recorder.received.lock();
    received.first().cloned()
}

// =============================================================================
// Engine on real files
// =============================================================================

mod engine_tests {
    use super::*;

    #[test]
    fn test_round_trip_on_disk() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let mut cache = MultiFileCache::open(config.clone(), &OsFileProvider, None).unwrap();

        for i in 0..50u8 {
            cache.put(desc(&format!("12/{i}/7.png")), Bytes::from(vec![i; 200 + i as usize]));
        }
        cache.run_until_idle();
        assert!(cache.is_quiescent());

        for i in 0..50u8 {
            assert_eq!(
                get(&mut cache, &format!("12/{i}/7.png")),
                Some(Bytes::from(vec![i; 200 + i as usize]))
            );
        }
        assert_eq!(cache.metrics().disk_hits(), 50);

        let data_len = std::fs::metadata(config.data_file_path(0)).unwrap().len();
        let expected: u64 = (0..50u64).map(|i| 200 + i).sum();
        assert_eq!(data_len, expected);
    }

    #[test]
    fn test_storage_layout() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let mut cache = MultiFileCache::open(config.clone(), &OsFileProvider, None).unwrap();

        cache.put(desc("tile"), Bytes::from_static(b"payload"));
        cache.run_until_idle();

        let storage = dir.path().join("a");
        assert!(storage.join("fil.0").is_file());
        assert!(storage.join("fil.2").is_file());
        assert!(storage.join("0").join("fili.0_0").is_file());
        assert!(storage.join("2").join("fili.2_4").is_file());

        let bucket = desc("tile").bucket(config.nbr_hash);
        let bytes = std::fs::read(config.shard_file_path(0, bucket)).unwrap();
        let shard = ShardIndex::decode(&bytes).unwrap();
        let entry = shard.get(&desc("tile")).unwrap();
        assert_eq!((entry.offset, entry.length), (0, 7));
    }

    #[test]
    fn test_rotation_evicts_oldest_file() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.nbr_files = 2;
        config.nbr_hash = 2;
        config.max_size = 198;

        let parent = Arc::new(MissLog::default());
        let as_parent: Arc<dyn ParentCache> = parent.clone();
        let mut cache = MultiFileCache::open(config, &OsFileProvider, Some(as_parent)).unwrap();
        assert_eq!(cache.max_size_per_file(), 100);

        cache.put(desc("a"), Bytes::from(vec![0xaa; 10]));
        cache.run_until_idle();
        assert_eq!(get(&mut cache, "a"), Some(Bytes::from(vec![0xaa; 10])));

        for i in 0..10u8 {
            cache.put(desc(&format!("d{i}")), Bytes::from(vec![i; 10]));
            cache.run_until_idle();
        }

        assert_eq!(get(&mut cache, "a"), None);
        assert_eq!(*parent.requests.lock(), vec![desc("a")]);
        assert_eq!(get(&mut cache, "d9"), Some(Bytes::from(vec![9; 10])));
    }

    #[test]
    fn test_remove_on_disk() {
        let dir = TempDir::new().unwrap();
        let mut cache = MultiFileCache::open(config(&dir), &OsFileProvider, None).unwrap();

        cache.put(desc("keep"), Bytes::from_static(b"1"));
        cache.put(desc("drop"), Bytes::from_static(b"2"));
        cache.run_until_idle();

        cache.remove(&desc("drop"));
        cache.run_until_idle();

        assert_eq!(get(&mut cache, "drop"), None);
        assert_eq!(get(&mut cache, "keep"), Some(Bytes::from_static(b"1")));
    }

    #[test]
    fn test_corrupt_shard_is_treated_as_empty() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let bucket = desc("x").bucket(config.nbr_hash);
        let shard_path = config.shard_file_path(0, bucket);
        std::fs::create_dir_all(shard_path.parent().unwrap()).unwrap();
        std::fs::write(&shard_path, [0xff, 0xff, 0xff, 0xff, 1, 2, 3]).unwrap();

        let mut cache = MultiFileCache::open(config, &OsFileProvider, None).unwrap();
        assert_eq!(get(&mut cache, "x"), None);

        cache.put(desc("x"), Bytes::from_static(b"fresh"));
        cache.run_until_idle();
        assert_eq!(get(&mut cache, "x"), Some(Bytes::from_static(b"fresh")));
    }

    #[test]
    fn test_initial_dump_seeds_cache() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        {
            let file = OsBlockFile::open(config.initial_dump_file_path()).unwrap();
            let d = desc("seed");
            let blob = Bytes::from_static(b"seeded");
            assert_eq!(write_dump(&file, [(&d, &blob)], 0).unwrap(), 1);
        }

        let mut cache = MultiFileCache::open(config.clone(), &OsFileProvider, None).unwrap();
        assert_eq!(cache.write_queue_len(), 1);
        let initial = OsBlockFile::open(config.initial_dump_file_path()).unwrap();
        assert!(initial.is_empty());

        cache.run_until_idle();
        assert_eq!(get(&mut cache, "seed"), Some(Bytes::from_static(b"seeded")));
        assert_eq!(cache.metrics().snapshot().dump_records_restored, 1);
    }

    #[test]
    fn test_config_from_yaml() {
        let dir = TempDir::new().unwrap();
        let yaml = format!(
            "base_path: {}\ninstance: tiles\nnbr_files: 2\nnbr_hash: 3\nmax_size: 4096\n",
            dir.path().display()
        );
        let path = dir.path().join("cache.yaml");
        std::fs::write(&path, yaml).unwrap();

        let config = CacheConfig::from_yaml_file(&path).unwrap();
        assert_eq!(config.instance, "tiles");
        assert_eq!(config.nbr_files, 2);
        assert_eq!(config.disk_headroom, tilecache::config::DEFAULT_DISK_HEADROOM);

        let cache = MultiFileCache::open(config, &OsFileProvider, None).unwrap();
        assert!(dir.path().join("tiles").join("fil.1").is_file());
        assert!(cache.max_size() <= 4096);
    }
}

// =============================================================================
// Async service on real files
// =============================================================================

mod service_tests {
    use super::*;

    #[tokio::test]
    async fn test_restart_restores_queued_blobs() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);

        let cache = MultiFileCache::open(config.clone(), &OsFileProvider, None).unwrap();
        let handle = CacheService::spawn(cache);
        for i in 0..30u8 {
            handle
                .put(desc(&format!("t{i}")), Bytes::from(vec![i; 64]))
                .unwrap();
        }
        handle.shutdown().await.unwrap();

        let cache = MultiFileCache::open(config.clone(), &OsFileProvider, None).unwrap();
        let handle = CacheService::spawn(cache);
        for i in 0..30u8 {
            assert_eq!(
                handle.get(&desc(&format!("t{i}"))).await.unwrap(),
                Some(Bytes::from(vec![i; 64])),
                "t{i} lost across restart"
            );
        }
        handle.flush().await.unwrap();
        assert_eq!(handle.shutdown().await.unwrap(), 0);

        let dump = OsBlockFile::open(config.dump_file_path()).unwrap();
        assert_eq!(dump.len(), 4);
    }

    #[tokio::test]
    async fn test_flushed_blobs_survive_restart() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);

        let cache = MultiFileCache::open(config.clone(), &OsFileProvider, None).unwrap();
        let handle = CacheService::spawn(cache);
        handle.put(desc("z/x/y"), Bytes::from_static(b"tile")).unwrap();
        handle.flush().await.unwrap();
        handle.shutdown().await.unwrap();

        let cache = MultiFileCache::open(config, &OsFileProvider, None).unwrap();
        let handle = CacheService::spawn(cache);
        assert_eq!(
            handle.get(&desc("z/x/y")).await.unwrap(),
            Some(Bytes::from_static(b"tile"))
        );
        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.metrics.disk_hits, 1);
        assert_eq!(stats.write_queue_len, 0);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_handles() {
        let dir = TempDir::new().unwrap();
        let cache = MultiFileCache::open(config(&dir), &OsFileProvider, None).unwrap();
        let handle = CacheService::spawn(cache);

        let mut tasks = Vec::new();
        for worker in 0..4u8 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..10u8 {
                    let descriptor = desc(&format!("w{worker}/{i}"));
                    handle.put(descriptor.clone(), Bytes::from(vec![worker, i])).unwrap();
                    let blob = handle.get(&descriptor).await.unwrap();
                    assert_eq!(blob, Some(Bytes::from(vec![worker, i])));
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        handle.flush().await.unwrap();
        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.metrics.blobs_written, 40);
        handle.shutdown().await.unwrap();
    }
}
