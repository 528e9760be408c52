//! `librqbit`-backed engine. The session owns piece storage rooted at the
//! shared cache directory; file data is served through librqbit's seekable
//! file streams.

use crate::engine::{
    BlobReader, EngineStats, TorrentEngine, TorrentFileInfo, TorrentHandle, TorrentInfo,
};
use crate::info_hash::InfoHash;
use async_trait::async_trait;
use librqbit::{AddTorrent, AddTorrentOptions, ManagedTorrent, Session, SessionOptions};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use swarm_vfs::{SwarmError, SwarmResult};
use tokio::sync::RwLock;

pub struct RqbitEngine {
    session: Arc<Session>,
    handles: RwLock<HashMap<InfoHash, Arc<RqbitTorrent>>>,
}

impl RqbitEngine {
    /// Start a session storing data under `storage_root` (the piece-cache
    /// directory; on hosts where the shared cache cannot back the engine,
    /// librqbit's plain file storage in the same root is the fallback).
    pub async fn new(storage_root: &Path) -> SwarmResult<Self> {
        tokio::fs::create_dir_all(storage_root).await?;
        let opts = SessionOptions {
            disable_dht: false,
            disable_dht_persistence: false,
            dht_config: None,
            persistence: None,
            ..Default::default()
        };
        let session = Session::new_with_opts(PathBuf::from(storage_root), opts)
            .await
            .map_err(|e| {
                warn!("starting torrent session failed: {}", e);
                SwarmError::Internal(format!("starting torrent session: {}", e))
            })?;
        Ok(Self {
            session,
            handles: RwLock::new(HashMap::new()),
        })
    }

    async fn add(&self, add: AddTorrent<'_>) -> SwarmResult<Arc<dyn TorrentHandle>> {
        let opts = AddTorrentOptions {
            overwrite: true,
            ..Default::default()
        };
        let response = self
            .session
            .add_torrent(add, Some(opts))
            .await
            .map_err(|e| SwarmError::InvalidParam(format!("adding torrent: {}", e)))?;
        let handle = response
            .into_handle()
            .ok_or_else(|| SwarmError::InvalidState("torrent was not added".to_string()))?;

        let hash = InfoHash::new(handle.info_hash().0);
        let wrapped = Arc::new(RqbitTorrent { handle, hash });
        self.handles.write().await.insert(hash, wrapped.clone());
        Ok(wrapped)
    }
}

#[async_trait]
impl TorrentEngine for RqbitEngine {
    async fn add_magnet(&self, uri: &str) -> SwarmResult<Arc<dyn TorrentHandle>> {
        self.add(AddTorrent::from_url(uri)).await
    }

    async fn add_metainfo_file(&self, path: &Path) -> SwarmResult<Arc<dyn TorrentHandle>> {
        let raw = tokio::fs::read(path).await?;
        self.add(AddTorrent::from_bytes(raw)).await
    }

    async fn get(&self, hash: &InfoHash) -> Option<Arc<dyn TorrentHandle>> {
        self.handles
            .read()
            .await
            .get(hash)
            .cloned()
            .map(|t| t as Arc<dyn TorrentHandle>)
    }

    async fn drop_torrent(&self, hash: &InfoHash) -> SwarmResult<()> {
        let removed = self.handles.write().await.remove(hash);
        if let Some(torrent) = removed {
            self.session
                .delete(torrent.handle.id().into(), false)
                .await
                .map_err(|e| {
                    warn!("dropping torrent {} failed: {}", hash, e);
                    SwarmError::Internal(format!("dropping torrent {}: {}", hash, e))
                })?;
        }
        Ok(())
    }
}

struct RqbitTorrent {
    handle: Arc<ManagedTorrent>,
    hash: InfoHash,
}

#[async_trait]
impl TorrentHandle for RqbitTorrent {
    fn info_hash(&self) -> InfoHash {
        self.hash
    }

    fn name(&self) -> String {
        self.handle.name().unwrap_or_else(|| self.hash.hex())
    }

    fn info(&self) -> Option<TorrentInfo> {
        let metadata = self.handle.metadata.load_full()?;
        let info = &metadata.info;
        let files: Vec<TorrentFileInfo> = metadata
            .file_infos
            .iter()
            .map(|f| TorrentFileInfo {
                path: f.relative_filename.to_string_lossy().replace('\\', "/"),
                length: f.len,
            })
            .collect();
        let total: u64 = files.iter().map(|f| f.length).sum();
        Some(TorrentInfo {
            name: info
                .name
                .as_ref()
                .map(|n| String::from_utf8_lossy(n.as_ref()).to_string())
                .unwrap_or_else(|| self.hash.hex()),
            piece_length: info.piece_length as u64,
            total_length: total,
            files,
        })
    }

    async fn wait_info(&self) -> SwarmResult<()> {
        self.handle
            .wait_until_initialized()
            .await
            .map_err(|e| SwarmError::Internal(format!("waiting for torrent info: {}", e)))
    }

    async fn new_reader(&self, file_index: usize) -> SwarmResult<BlobReader> {
        let stream = self
            .handle
            .clone()
            .stream(file_index)
            .map_err(|e| SwarmError::IoError(format!("opening torrent stream: {}", e)))?;
        Ok(Box::pin(stream))
    }

    fn stats(&self) -> EngineStats {
        let stats = self.handle.stats();
        let mut out = EngineStats {
            bytes_written: stats.uploaded_bytes,
            bytes_read: stats.progress_bytes,
            ..Default::default()
        };
        if let Some(live) = stats.live {
            out.bytes_read = live.snapshot.fetched_bytes;
            out.total_peers = live.snapshot.peer_stats.seen as usize;
            out.connected_seeders = live.snapshot.peer_stats.live as usize;
        }
        // librqbit exposes no run-length piece states; detail views fall
        // back to the cached summary's runs.
        out
    }
}
