//! In-memory torrent engine. Serves file data from byte buffers with
//! configurable metadata and read latency, writes pieces through to the
//! shared piece cache, and honors the full engine contract. Used by the
//! test suites and for serving pre-seeded local content.

use crate::engine::{
    BlobReader, EngineStats, PieceRun, PieceStatus, TorrentEngine, TorrentFileInfo, TorrentHandle,
    TorrentInfo,
};
use crate::info_hash::InfoHash;
use crate::magnet::MagnetLink;
use crate::piece_cache::PieceCache;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::io::SeekFrom;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use swarm_vfs::{SwarmError, SwarmResult};
use tokio::io::{AsyncRead, AsyncSeek, ReadBuf};
use tokio::sync::watch;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemFileSpec {
    pub path: String,
    pub data: Vec<u8>,
}

/// Self-contained description of a torrent the memory engine can serve.
/// Its JSON form doubles as the engine's "metainfo file" format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemTorrentSpec {
    pub hash: InfoHash,
    pub name: String,
    pub piece_length: u64,
    pub files: Vec<MemFileSpec>,
}

impl MemTorrentSpec {
    pub fn single_file(hash: InfoHash, name: &str, piece_length: u64, data: Vec<u8>) -> Self {
        Self {
            hash,
            name: name.to_string(),
            piece_length,
            files: vec![MemFileSpec {
                path: name.to_string(),
                data,
            }],
        }
    }

    pub fn total_length(&self) -> u64 {
        self.files.iter().map(|f| f.data.len() as u64).sum()
    }

    pub fn magnet(&self) -> String {
        format!("magnet:?xt=urn:btih:{}&dn={}", self.hash.hex(), self.name)
    }

    pub fn to_info(&self) -> TorrentInfo {
        TorrentInfo {
            name: self.name.clone(),
            piece_length: self.piece_length,
            total_length: self.total_length(),
            files: self
                .files
                .iter()
                .map(|f| TorrentFileInfo {
                    path: f.path.clone(),
                    length: f.data.len() as u64,
                })
                .collect(),
        }
    }

    pub async fn write_metainfo(&self, path: &Path) -> SwarmResult<()> {
        let raw = serde_json::to_vec_pretty(self)
            .map_err(|e| SwarmError::Internal(format!("encoding metainfo: {}", e)))?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, raw).await?;
        Ok(())
    }

    pub async fn read_metainfo(path: &Path) -> SwarmResult<Self> {
        let raw = tokio::fs::read(path).await?;
        serde_json::from_slice(&raw).map_err(|e| {
            SwarmError::InvalidParam(format!("bad metainfo file {}: {}", path.display(), e))
        })
    }
}

#[derive(Clone)]
pub struct MemoryEngineOptions {
    pub info_delay: Duration,
    pub read_delay: Duration,
    /// Simulate a swarm that never delivers: readers park forever and only
    /// the caller's deadline ends the read.
    pub stall_reads: bool,
    pub cache: Option<Arc<PieceCache>>,
}

impl Default for MemoryEngineOptions {
    fn default() -> Self {
        Self {
            info_delay: Duration::ZERO,
            read_delay: Duration::ZERO,
            stall_reads: false,
            cache: None,
        }
    }
}

impl MemoryEngineOptions {
    pub fn with_info_delay(mut self, d: Duration) -> Self {
        self.info_delay = d;
        self
    }

    pub fn with_read_delay(mut self, d: Duration) -> Self {
        self.read_delay = d;
        self
    }

    pub fn with_stall_reads(mut self, stall: bool) -> Self {
        self.stall_reads = stall;
        self
    }

    pub fn with_cache(mut self, cache: Arc<PieceCache>) -> Self {
        self.cache = Some(cache);
        self
    }
}

pub struct MemoryEngine {
    options: MemoryEngineOptions,
    torrents: Mutex<HashMap<InfoHash, Arc<MemTorrent>>>,
    /// Content the engine knows how to serve once a matching hash is added.
    blueprints: Mutex<HashMap<InfoHash, Arc<MemTorrentSpec>>>,
}

impl MemoryEngine {
    pub fn new(options: MemoryEngineOptions) -> Self {
        Self {
            options,
            torrents: Mutex::new(HashMap::new()),
            blueprints: Mutex::new(HashMap::new()),
        }
    }

    /// Make `spec` resolvable by magnet or hash.
    pub fn register(&self, spec: MemTorrentSpec) {
        self.blueprints
            .lock()
            .unwrap()
            .insert(spec.hash, Arc::new(spec));
    }

    /// Direct accessor for the concrete handle, used by tests to drive the
    /// simulated swarm (peers, upload counters).
    pub fn mem_handle(&self, hash: &InfoHash) -> Option<Arc<MemTorrent>> {
        self.torrents.lock().unwrap().get(hash).cloned()
    }

    fn add_by_hash(&self, hash: InfoHash) -> Arc<MemTorrent> {
        let spec = self.blueprints.lock().unwrap().get(&hash).cloned();
        let mut torrents = self.torrents.lock().unwrap();
        if let Some(existing) = torrents.get(&hash) {
            // Re-adding with a now-known metadata source completes the
            // pending info wait.
            if existing.info().is_none() {
                if let Some(spec) = spec {
                    existing.deliver_info(spec);
                }
            }
            return existing.clone();
        }
        let torrent = MemTorrent::launch(hash, spec, &self.options);
        torrents.insert(hash, torrent.clone());
        torrent
    }
}

#[async_trait]
impl TorrentEngine for MemoryEngine {
    async fn add_magnet(&self, uri: &str) -> SwarmResult<Arc<dyn TorrentHandle>> {
        let magnet = MagnetLink::parse(uri)?;
        Ok(self.add_by_hash(magnet.info_hash))
    }

    async fn add_metainfo_file(&self, path: &Path) -> SwarmResult<Arc<dyn TorrentHandle>> {
        let spec = MemTorrentSpec::read_metainfo(path).await?;
        let hash = spec.hash;
        self.register(spec);
        Ok(self.add_by_hash(hash))
    }

    async fn get(&self, hash: &InfoHash) -> Option<Arc<dyn TorrentHandle>> {
        self.torrents
            .lock()
            .unwrap()
            .get(hash)
            .cloned()
            .map(|t| t as Arc<dyn TorrentHandle>)
    }

    async fn drop_torrent(&self, hash: &InfoHash) -> SwarmResult<()> {
        self.torrents.lock().unwrap().remove(hash);
        Ok(())
    }
}

pub struct MemTorrent {
    hash: InfoHash,
    spec: Mutex<Option<Arc<MemTorrentSpec>>>,
    info_tx: watch::Sender<bool>,
    info_rx: watch::Receiver<bool>,
    bytes_read: Arc<AtomicU64>,
    bytes_written: AtomicU64,
    peers: AtomicUsize,
    seeders: AtomicUsize,
    read_delay: Duration,
    stall_reads: bool,
    cache: Option<Arc<PieceCache>>,
}

impl MemTorrent {
    fn launch(
        hash: InfoHash,
        spec: Option<Arc<MemTorrentSpec>>,
        options: &MemoryEngineOptions,
    ) -> Arc<Self> {
        let (info_tx, info_rx) = watch::channel(false);
        let torrent = Arc::new(Self {
            hash,
            spec: Mutex::new(None),
            info_tx,
            info_rx,
            bytes_read: Arc::new(AtomicU64::new(0)),
            bytes_written: AtomicU64::new(0),
            peers: AtomicUsize::new(0),
            seeders: AtomicUsize::new(0),
            read_delay: options.read_delay,
            stall_reads: options.stall_reads,
            cache: options.cache.clone(),
        });

        if let Some(spec) = spec {
            if options.info_delay.is_zero() {
                torrent.deliver_info(spec);
            } else {
                let delayed = torrent.clone();
                let delay = options.info_delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    delayed.deliver_info(spec);
                });
            }
        }
        torrent
    }

    /// Simulate the swarm delivering metadata.
    pub fn deliver_info(&self, spec: Arc<MemTorrentSpec>) {
        *self.spec.lock().unwrap() = Some(spec);
        let _ = self.info_tx.send(true);
    }

    pub fn set_swarm(&self, peers: usize, seeders: usize) {
        self.peers.store(peers, Ordering::SeqCst);
        self.seeders.store(seeders, Ordering::SeqCst);
    }

    pub fn add_uploaded(&self, n: u64) {
        self.bytes_written.fetch_add(n, Ordering::SeqCst);
    }

    fn file_start(spec: &MemTorrentSpec, file_index: usize) -> u64 {
        spec.files[..file_index]
            .iter()
            .map(|f| f.data.len() as u64)
            .sum()
    }

    fn piece_runs(&self) -> Vec<PieceRun> {
        let spec = match self.spec.lock().unwrap().clone() {
            Some(s) => s,
            None => return Vec::new(),
        };
        let total = spec.total_length();
        if total == 0 || spec.piece_length == 0 {
            return Vec::new();
        }
        let pieces = ((total + spec.piece_length - 1) / spec.piece_length) as u32;
        let mut runs: Vec<PieceRun> = Vec::new();
        for index in 0..pieces {
            let status = match &self.cache {
                Some(cache) if cache.contains(&self.hash, index) => PieceStatus::Complete,
                _ => PieceStatus::Waiting,
            };
            match runs.last_mut() {
                Some(run) if run.status == status => run.num_pieces += 1,
                _ => runs.push(PieceRun {
                    status,
                    num_pieces: 1,
                }),
            }
        }
        runs
    }
}

#[async_trait]
impl TorrentHandle for MemTorrent {
    fn info_hash(&self) -> InfoHash {
        self.hash
    }

    fn name(&self) -> String {
        match self.spec.lock().unwrap().as_ref() {
            Some(spec) => spec.name.clone(),
            None => self.hash.hex(),
        }
    }

    fn info(&self) -> Option<TorrentInfo> {
        self.spec.lock().unwrap().as_ref().map(|s| s.to_info())
    }

    async fn wait_info(&self) -> SwarmResult<()> {
        let mut rx = self.info_rx.clone();
        while !*rx.borrow() {
            rx.changed()
                .await
                .map_err(|_| SwarmError::InvalidState("torrent dropped".to_string()))?;
        }
        Ok(())
    }

    async fn new_reader(&self, file_index: usize) -> SwarmResult<BlobReader> {
        if self.stall_reads {
            return Ok(Box::pin(StalledReader::default()));
        }
        let spec = self
            .spec
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| SwarmError::InvalidState(format!("{}: no metadata yet", self.hash)))?;
        let file = spec.files.get(file_index).ok_or_else(|| {
            SwarmError::InvalidParam(format!("{}: no file #{}", self.hash, file_index))
        })?;
        Ok(Box::pin(MemReader {
            data: Arc::new(file.data.clone()),
            pos: 0,
            pending_seek: None,
            delay: None,
            read_delay: self.read_delay,
            hash: self.hash,
            piece_length: spec.piece_length,
            file_offset: Self::file_start(&spec, file_index),
            spec,
            bytes_read: self.bytes_read.clone(),
            cache: self.cache.clone(),
        }))
    }

    fn stats(&self) -> EngineStats {
        EngineStats {
            bytes_read: self.bytes_read.load(Ordering::SeqCst),
            bytes_written: self.bytes_written.load(Ordering::SeqCst),
            total_peers: self.peers.load(Ordering::SeqCst),
            connected_seeders: self.seeders.load(Ordering::SeqCst),
            piece_runs: self.piece_runs(),
        }
    }
}

/// Reader that never produces data, standing in for a swarm with no
/// reachable peers.
#[derive(Default)]
struct StalledReader {
    pos: u64,
}

impl AsyncRead for StalledReader {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Poll::Pending
    }
}

impl AsyncSeek for StalledReader {
    fn start_seek(mut self: Pin<&mut Self>, position: SeekFrom) -> std::io::Result<()> {
        if let SeekFrom::Start(p) = position {
            self.pos = p;
        }
        Ok(())
    }

    fn poll_complete(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<u64>> {
        Poll::Ready(Ok(self.pos))
    }
}

struct MemReader {
    data: Arc<Vec<u8>>,
    pos: u64,
    pending_seek: Option<u64>,
    delay: Option<Pin<Box<tokio::time::Sleep>>>,
    read_delay: Duration,
    hash: InfoHash,
    piece_length: u64,
    file_offset: u64,
    spec: Arc<MemTorrentSpec>,
    bytes_read: Arc<AtomicU64>,
    cache: Option<Arc<PieceCache>>,
}

impl MemReader {
    fn record_read(&self, n: usize) {
        self.bytes_read.fetch_add(n as u64, Ordering::SeqCst);
    }

    /// Populate the shared cache with the pieces this read touched.
    fn cache_touched_pieces(&self, start: u64, len: usize) {
        let cache = match &self.cache {
            Some(c) => c.clone(),
            None => return,
        };
        if self.piece_length == 0 || len == 0 {
            return;
        }
        let global_start = self.file_offset + start;
        let global_end = global_start + len as u64;
        let first = (global_start / self.piece_length) as u32;
        let last = ((global_end - 1) / self.piece_length) as u32;
        let spec = self.spec.clone();
        let hash = self.hash;
        tokio::spawn(async move {
            for index in first..=last {
                if cache.contains(&hash, index) {
                    continue;
                }
                if let Some(bytes) = piece_bytes(&spec, index) {
                    if let Err(e) = cache.put(&hash, index, &bytes).await {
                        debug!("cache write for piece {} of {} failed: {}", index, hash, e);
                    }
                }
            }
        });
    }
}

fn piece_bytes(spec: &MemTorrentSpec, index: u32) -> Option<Vec<u8>> {
    let total = spec.total_length();
    let start = index as u64 * spec.piece_length;
    if start >= total {
        return None;
    }
    let end = (start + spec.piece_length).min(total);
    let mut out = Vec::with_capacity((end - start) as usize);
    let mut offset = 0u64;
    for file in &spec.files {
        let flen = file.data.len() as u64;
        let fstart = offset;
        let fend = offset + flen;
        offset = fend;
        if fend <= start || fstart >= end {
            continue;
        }
        let from = start.max(fstart) - fstart;
        let to = end.min(fend) - fstart;
        out.extend_from_slice(&file.data[from as usize..to as usize]);
    }
    Some(out)
}

impl AsyncRead for MemReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.read_delay.is_zero() {
            if self.delay.is_none() {
                let d = self.read_delay;
                self.delay = Some(Box::pin(tokio::time::sleep(d)));
            }
            if let Some(sleep) = self.delay.as_mut() {
                match sleep.as_mut().poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(()) => self.delay = None,
                }
            }
        }

        let len = self.data.len() as u64;
        if self.pos >= len {
            return Poll::Ready(Ok(()));
        }
        let start = self.pos as usize;
        let n = buf.remaining().min(len as usize - start);
        buf.put_slice(&self.data[start..start + n]);
        self.record_read(n);
        self.cache_touched_pieces(self.pos, n);
        self.pos += n as u64;
        Poll::Ready(Ok(()))
    }
}

impl AsyncSeek for MemReader {
    fn start_seek(mut self: Pin<&mut Self>, position: SeekFrom) -> std::io::Result<()> {
        let len = self.data.len() as i128;
        let target = match position {
            SeekFrom::Start(p) => p as i128,
            SeekFrom::Current(d) => self.pos as i128 + d as i128,
            SeekFrom::End(d) => len + d as i128,
        };
        if target < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start",
            ));
        }
        self.pending_seek = Some(target as u64);
        Ok(())
    }

    fn poll_complete(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<u64>> {
        if let Some(target) = self.pending_seek.take() {
            self.pos = target;
        }
        Poll::Ready(Ok(self.pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncSeekExt};

    fn hash(b: u8) -> InfoHash {
        InfoHash::new([b; 20])
    }

    #[tokio::test]
    async fn test_add_magnet_and_read() {
        let engine = MemoryEngine::new(MemoryEngineOptions::default());
        let spec = MemTorrentSpec::single_file(hash(1), "bigbuck.mkv", 4096, vec![7u8; 8192]);
        let magnet = spec.magnet();
        engine.register(spec);

        let t = engine.add_magnet(&magnet).await.unwrap();
        t.wait_info().await.unwrap();
        let info = t.info().unwrap();
        assert_eq!(info.name, "bigbuck.mkv");
        assert_eq!(info.total_length, 8192);

        let mut reader = t.new_reader(0).await.unwrap();
        reader.seek(SeekFrom::Start(100)).await.unwrap();
        let mut buf = [0u8; 16];
        let n = reader.read(&mut buf).await.unwrap();
        assert!(n > 0);
        assert_eq!(buf[0], 7);
        assert!(t.stats().bytes_read >= n as u64);
    }

    #[tokio::test]
    async fn test_metainfo_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("a.torrent");
        let spec = MemTorrentSpec::single_file(hash(2), "a.bin", 1024, vec![1, 2, 3]);
        spec.write_metainfo(&path).await.unwrap();

        let engine = MemoryEngine::new(MemoryEngineOptions::default());
        let t = engine.add_metainfo_file(&path).await.unwrap();
        t.wait_info().await.unwrap();
        assert_eq!(t.info().unwrap().total_length, 3);
        assert_eq!(t.info_hash(), hash(2));
    }

    #[tokio::test]
    async fn test_unknown_magnet_has_no_info() {
        let engine = MemoryEngine::new(MemoryEngineOptions::default());
        let uri = format!("magnet:?xt=urn:btih:{}", hash(9).hex());
        let t = engine.add_magnet(&uri).await.unwrap();
        assert!(t.info().is_none());
        assert_eq!(t.name(), hash(9).hex());

        let waited =
            tokio::time::timeout(Duration::from_millis(50), t.wait_info()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_stalled_reader_never_delivers() {
        let engine = MemoryEngine::new(
            MemoryEngineOptions::default().with_stall_reads(true),
        );
        let spec = MemTorrentSpec::single_file(hash(3), "x", 1024, vec![0u8; 16]);
        let magnet = spec.magnet();
        engine.register(spec);
        let t = engine.add_magnet(&magnet).await.unwrap();
        t.wait_info().await.unwrap();

        let mut reader = t.new_reader(0).await.unwrap();
        let mut buf = [0u8; 4];
        let read = tokio::time::timeout(Duration::from_millis(50), reader.read(&mut buf)).await;
        assert!(read.is_err());
    }

    #[tokio::test]
    async fn test_piece_cache_write_through() {
        let dir = tempfile::TempDir::new().unwrap();
        let cache = Arc::new(
            PieceCache::open(dir.path().to_path_buf(), 1 << 20)
                .await
                .unwrap(),
        );
        let engine = MemoryEngine::new(
            MemoryEngineOptions::default().with_cache(cache.clone()),
        );
        let spec = MemTorrentSpec::single_file(hash(4), "x", 8, (0u8..64).collect());
        let magnet = spec.magnet();
        engine.register(spec);
        let t = engine.add_magnet(&magnet).await.unwrap();
        t.wait_info().await.unwrap();

        let mut reader = t.new_reader(0).await.unwrap();
        let mut buf = [0u8; 8];
        reader.read(&mut buf).await.unwrap();

        // The cache fill is asynchronous; give it a moment.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.contains(&hash(4), 0));
        assert_eq!(cache.get(&hash(4), 0).await.unwrap().unwrap().len(), 8);
    }
}
