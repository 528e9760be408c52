use crate::index_store::IndexStore;
use crate::route_watcher::set_watch_interval;
use crate::service::{Service, ServiceOptions};
use crate::stats::Stats;
use crate::summary::{FileSummary, TorrentSummary};
use std::sync::Arc;
use std::time::Duration;
use swarm_engine::{
    InfoHash, MemFileSpec, MemTorrentSpec, MemoryEngine, MemoryEngineOptions, PieceCache,
};
use swarm_vfs::{builtin_factories, ContainerFs, Filesystem};
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    engine: Arc<MemoryEngine>,
    db: Arc<IndexStore>,
    cache: Arc<PieceCache>,
    container: Arc<ContainerFs>,
    service: Arc<Service>,
}

async fn harness_with(engine_options: MemoryEngineOptions, options: ServiceOptions) -> Harness {
    let dir = TempDir::new().unwrap();
    let metadata_root = dir.path().join("metadata");
    let cache = Arc::new(
        PieceCache::open(dir.path().join("cache"), 64 << 20)
            .await
            .unwrap(),
    );
    let engine = Arc::new(MemoryEngine::new(
        engine_options.with_cache(cache.clone()),
    ));
    let db = Arc::new(IndexStore::open(&metadata_root.join("magnetdb")).unwrap());
    let stats = Arc::new(Stats::new());
    let container = Arc::new(ContainerFs::new(builtin_factories()));
    let service = Service::new(
        engine.clone(),
        db.clone(),
        stats,
        cache.clone(),
        container.clone(),
        ServiceOptions {
            metadata_root,
            ..options
        },
    );
    Harness {
        _dir: dir,
        engine,
        db,
        cache,
        container,
        service,
    }
}

async fn harness() -> Harness {
    harness_with(MemoryEngineOptions::default(), ServiceOptions::default()).await
}

fn hash(b: u8) -> InfoHash {
    InfoHash::new([b; 20])
}

async fn wait_until<F: Fn() -> bool>(what: &str, deadline: Duration, check: F) {
    let started = std::time::Instant::now();
    while started.elapsed() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_s1_add_magnet_list_and_read_a_byte() {
    let h = harness().await;
    let spec = MemTorrentSpec::single_file(hash(1), "bigbuck.mkv", 256 << 10, vec![42u8; 4 << 20]);
    let magnet = spec.magnet();
    h.engine.register(spec);

    h.service.add_magnet("movies", &magnet).await.unwrap();

    let listing = h.container.read_dir("/movies").await.unwrap();
    let entry = &listing["bigbuck.mkv"];
    assert_eq!(entry.size, 4194304);
    assert!(!entry.is_dir);

    let node = h.container.open("/movies/bigbuck.mkv").await.unwrap();
    let mut buf = [0u8; 1];
    assert_eq!(node.read_at(&mut buf, 0).await.unwrap(), 1);
    assert_eq!(buf[0], 42);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_s2_multi_file_wrapper() {
    let h = harness().await;
    let spec = MemTorrentSpec {
        hash: hash(2),
        name: "season1".to_string(),
        piece_length: 1024,
        files: vec![
            MemFileSpec {
                path: "e01.mkv".to_string(),
                data: vec![1u8; 10],
            },
            MemFileSpec {
                path: "e02.mkv".to_string(),
                data: vec![2u8; 20],
            },
        ],
    };
    let magnet = spec.magnet();
    h.engine.register(spec);
    h.service.add_magnet("tv", &magnet).await.unwrap();

    let root = h.container.read_dir("/tv").await.unwrap();
    assert!(root["season1"].is_dir);
    assert_eq!(root["season1"].size, 30);

    let season = h.container.read_dir("/tv/season1").await.unwrap();
    assert_eq!(season["e01.mkv"].size, 10);
    assert_eq!(season["e02.mkv"].size, 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_s3_overlay_serves_before_engine() {
    let h = harness().await;

    // A summary persisted by a previous run; the engine knows nothing yet.
    let summary = TorrentSummary {
        hash: hash(3).hex(),
        route: "books".to_string(),
        name: "book.pdf".to_string(),
        size_bytes: 1234,
        files: vec![FileSummary {
            path: "book.pdf".to_string(),
            length: 1234,
        }],
        ..Default::default()
    };
    h.db.set_meta(&hash(3), &summary.encode()).unwrap();
    h.db
        .add_magnet(
            "books",
            &format!("magnet:?xt=urn:btih:{}&dn=book.pdf", hash(3).hex()),
        )
        .unwrap();

    h.service.load_meta_from_db();
    h.service.pre_add_routes().await;

    let listing = h.container.read_dir("/books").await.unwrap();
    assert_eq!(listing["book.pdf"].size, 1234);
    assert!(!listing["book.pdf"].is_dir);

    // Placeholder opens as an empty readable file (the materializer can't
    // produce data: the engine has no metadata source for the hash).
    let node = h.container.open("/books/book.pdf").await.unwrap();
    assert_eq!(node.size(), 1234);
    let mut buf = [0u8; 8];
    assert_eq!(node.read_at(&mut buf, 0).await.unwrap(), 0);

    // Once the engine can resolve the content, open returns a real reader.
    h.engine.register(MemTorrentSpec::single_file(
        hash(3),
        "book.pdf",
        1024,
        vec![7u8; 1234],
    ));
    h.service.load().await;
    let node = h.container.open("/books/book.pdf").await.unwrap();
    assert_eq!(node.read_at(&mut buf, 0).await.unwrap(), 8);
    assert_eq!(buf[0], 7);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_s4_folder_reconciliation() {
    set_watch_interval(1);
    let h = harness().await;
    h.service.create_route("music").await.unwrap();

    let spec = MemTorrentSpec::single_file(hash(4), "track.flac", 1024, vec![9u8; 100]);
    let metainfo_path = h.service.route_folder("music").join("a.torrent");
    spec.write_metainfo(&metainfo_path).await.unwrap();

    let appeared = async {
        loop {
            if let Ok(listing) = h.container.read_dir("/music").await {
                if listing.contains_key("track.flac") {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(10), appeared)
        .await
        .expect("torrent never appeared from folder");

    tokio::fs::remove_file(&metainfo_path).await.unwrap();
    let vanished = async {
        loop {
            if let Ok(listing) = h.container.read_dir("/music").await {
                if !listing.contains_key("track.flac") {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(10), vanished)
        .await
        .expect("torrent never vanished after its file was removed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_s5_mount_and_unmount_live() {
    let h = harness().await;
    h.service.create_route("x").await.unwrap();
    assert!(h.container.read_dir("/").await.unwrap().contains_key("x"));
    assert!(h.container.read_dir("/x").await.unwrap().is_empty());

    h.service.delete_route("x").await.unwrap();
    assert!(!h.container.read_dir("/").await.unwrap().contains_key("x"));
    assert!(h
        .container
        .read_dir("/x")
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_s6_read_timeout_with_dead_swarm() {
    let h = harness_with(
        MemoryEngineOptions::default().with_stall_reads(true),
        ServiceOptions {
            read_timeout: Duration::from_secs(1),
            ..Default::default()
        },
    )
    .await;
    let spec = MemTorrentSpec::single_file(hash(6), "stuck.bin", 1024, vec![0u8; 4096]);
    let magnet = spec.magnet();
    h.engine.register(spec);
    h.service.add_magnet("movies", &magnet).await.unwrap();

    let node = h.container.open("/movies/stuck.bin").await.unwrap();
    let mut buf = [0u8; 16];
    let started = std::time::Instant::now();
    let err = node.read_at(&mut buf, 0).await.unwrap_err();
    assert!(err.is_timeout(), "got {:?}", err);
    assert!(started.elapsed() <= Duration::from_millis(1200));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remove_cleans_every_trace() {
    let h = harness().await;
    let spec = MemTorrentSpec::single_file(hash(7), "gone.bin", 8, vec![3u8; 64]);
    let magnet = spec.magnet();
    h.engine.register(spec);
    h.service.add_magnet("movies", &magnet).await.unwrap();

    // Touch data so the piece cache holds something for the hash.
    let node = h.container.open("/movies/gone.bin").await.unwrap();
    let mut buf = [0u8; 8];
    node.read_at(&mut buf, 0).await.unwrap();
    let cache = h.cache.clone();
    wait_until("cache to fill", Duration::from_secs(5), || {
        cache.contains(&hash(7), 0)
    })
    .await;
    let db = h.db.clone();
    wait_until("summary to persist", Duration::from_secs(5), || {
        db.get_meta(&hash(7)).unwrap().is_some()
    })
    .await;

    h.service.remove_from_hash("movies", &hash(7)).await.unwrap();

    assert!(h.db.list_magnets().unwrap().is_empty());
    assert!(h.db.list_file_paths().unwrap().is_empty());
    assert!(h.db.get_meta(&hash(7)).unwrap().is_none());
    assert!(!h.cache.contains(&hash(7), 0));
    assert!(h.service.stats().stat(&hash(7)).is_err());
    assert!(h.engine.mem_handle(&hash(7)).is_none());
    assert!(!h
        .container
        .read_dir("/movies")
        .await
        .unwrap()
        .contains_key("gone.bin"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_summary_round_trip_matches_engine_files() {
    let h = harness().await;
    let spec = MemTorrentSpec {
        hash: hash(8),
        name: "album".to_string(),
        piece_length: 1024,
        files: vec![
            MemFileSpec {
                path: "01.flac".to_string(),
                data: vec![0u8; 11],
            },
            MemFileSpec {
                path: "02.flac".to_string(),
                data: vec![0u8; 22],
            },
        ],
    };
    let magnet = spec.magnet();
    h.engine.register(spec);
    h.service.add_magnet("music", &magnet).await.unwrap();

    let db = h.db.clone();
    wait_until("summary to persist", Duration::from_secs(5), || {
        db.get_meta(&hash(8)).unwrap().is_some()
    })
    .await;

    let all = h.db.get_all_meta().unwrap();
    let summary = TorrentSummary::decode(&all[&hash(8).hex()]).unwrap();
    assert_eq!(summary.route, "music");
    assert_eq!(summary.name, "album");
    assert_eq!(
        summary.files,
        vec![
            FileSummary {
                path: "01.flac".to_string(),
                length: 11
            },
            FileSummary {
                path: "02.flac".to_string(),
                length: 22
            },
        ]
    );
    assert_eq!(summary.size_bytes, 33);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_empty_route_survives_until_deleted() {
    let h = harness().await;
    let spec = MemTorrentSpec::single_file(hash(9), "only.bin", 1024, vec![0u8; 16]);
    let magnet = spec.magnet();
    h.engine.register(spec);
    h.service.add_magnet("music", &magnet).await.unwrap();
    h.service.remove_from_hash("music", &hash(9)).await.unwrap();

    // The route stays mounted and listable with no torrents.
    assert!(h.container.read_dir("/music").await.unwrap().is_empty());
    assert!(h.service.stats().has_route("music"));

    h.service.delete_route("music").await.unwrap();
    assert!(h
        .container
        .read_dir("/music")
        .await
        .unwrap_err()
        .is_not_found());
    assert!(!h.service.stats().has_route("music"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_merged_route_page_unions_live_and_cached() {
    let h = harness().await;

    // One live torrent...
    let live = MemTorrentSpec::single_file(hash(10), "beta.bin", 1024, vec![0u8; 10]);
    let magnet = live.magnet();
    h.engine.register(live);
    h.service.add_magnet("mixed", &magnet).await.unwrap();

    // ...and one summary-only torrent that is not in the engine.
    let cached = TorrentSummary {
        hash: hash(11).hex(),
        route: "mixed".to_string(),
        name: "alpha.bin".to_string(),
        size_bytes: 555,
        files: vec![FileSummary {
            path: "alpha.bin".to_string(),
            length: 555,
        }],
        ..Default::default()
    };
    h.db.set_meta(&hash(11), &cached.encode()).unwrap();
    h.service.load_meta_from_db();

    let page = h.service.merged_route_page("mixed", 1, 10);
    assert_eq!(page.total, 2);
    assert_eq!(page.items[0].name, "alpha.bin");
    assert_eq!(page.items[0].size_bytes, 555);
    assert_eq!(page.items[1].name, "beta.bin");

    let first = h.service.merged_route_page("mixed", 1, 1);
    assert_eq!(first.items.len(), 1);
    assert_eq!(first.items[0].name, "alpha.bin");
    let second = h.service.merged_route_page("mixed", 2, 1);
    assert_eq!(second.items[0].name, "beta.bin");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_snapshot_persists_summaries() {
    let h = harness().await;
    let spec = MemTorrentSpec::single_file(hash(12), "snap.bin", 1024, vec![0u8; 64]);
    let magnet = spec.magnet();
    h.engine.register(spec);
    h.service.add_magnet("movies", &magnet).await.unwrap();

    h.service.stop_meta_persistence().await;
    let summary =
        TorrentSummary::decode(&h.db.get_meta(&hash(12)).unwrap().unwrap()).unwrap();
    assert_eq!(summary.name, "snap.bin");
    assert_eq!(summary.route, "movies");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_restores_routes_from_index() {
    let dir = TempDir::new().unwrap();
    let metadata_root = dir.path().join("metadata");
    let magnet = MemTorrentSpec::single_file(hash(13), "keep.bin", 1024, vec![0u8; 32]).magnet();

    {
        let db = Arc::new(IndexStore::open(&metadata_root.join("magnetdb")).unwrap());
        db.add_magnet("movies", &magnet).unwrap();
    }

    // A fresh service over the same metadata root mounts the route before
    // touching the engine.
    let cache = Arc::new(
        PieceCache::open(dir.path().join("cache"), 1 << 20)
            .await
            .unwrap(),
    );
    let engine = Arc::new(MemoryEngine::new(MemoryEngineOptions::default()));
    let db = Arc::new(IndexStore::open(&metadata_root.join("magnetdb")).unwrap());
    let container = Arc::new(ContainerFs::new(builtin_factories()));
    let service = Service::new(
        engine.clone(),
        db,
        Arc::new(Stats::new()),
        cache,
        container.clone(),
        ServiceOptions {
            metadata_root,
            ..Default::default()
        },
    );
    service.load_meta_from_db();
    service.pre_add_routes().await;
    assert!(container.read_dir("/").await.unwrap().contains_key("movies"));
}
