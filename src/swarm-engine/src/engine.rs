use crate::info_hash::InfoHash;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use swarm_vfs::SwarmResult;
use tokio::io::{AsyncRead, AsyncSeek};

/// Sequential engine reader: seek + read, cancelled by dropping the read
/// future (callers arm a deadline around every read).
pub trait ReadSeek: AsyncRead + AsyncSeek + Unpin + Send {}
impl<T: AsyncRead + AsyncSeek + Unpin + Send> ReadSeek for T {}

pub type BlobReader = Pin<Box<dyn ReadSeek>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFileInfo {
    /// Path relative to the torrent, forward-slash joined.
    pub path: String,
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentInfo {
    pub name: String,
    pub piece_length: u64,
    pub total_length: u64,
    pub files: Vec<TorrentFileInfo>,
}

impl TorrentInfo {
    pub fn total_file_length(&self) -> u64 {
        let sum: u64 = self.files.iter().map(|f| f.length).sum();
        if sum == 0 {
            self.total_length
        } else {
            sum
        }
    }
}

/// Piece state as shown in detail listings; serialized with the single
/// letter codes the UI understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PieceStatus {
    #[serde(rename = "H")]
    Checking,
    #[serde(rename = "P")]
    Partial,
    #[serde(rename = "C")]
    Complete,
    #[serde(rename = "W")]
    Waiting,
    #[serde(rename = "?")]
    Error,
}

/// Run-length encoded span of pieces sharing one status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceRun {
    pub status: PieceStatus,
    #[serde(rename = "numPieces")]
    pub num_pieces: usize,
}

/// Cumulative counters read from the engine. Deltas are computed by the
/// stats aggregator.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub total_peers: usize,
    pub connected_seeders: usize,
    pub piece_runs: Vec<PieceRun>,
}

/// One torrent as seen by the engine. Metadata may lag behind the add;
/// `info` stays None until the swarm delivers it.
#[async_trait]
pub trait TorrentHandle: Send + Sync {
    fn info_hash(&self) -> InfoHash;

    /// Display name; falls back to the hex hash before metadata arrives.
    fn name(&self) -> String;

    fn info(&self) -> Option<TorrentInfo>;

    /// Resolves once metadata is available. Callers wrap this in their own
    /// deadline.
    async fn wait_info(&self) -> SwarmResult<()>;

    /// Open one more sequential reader over the given file. Each reader is
    /// independent; concurrent use of a single reader is not allowed.
    async fn new_reader(&self, file_index: usize) -> SwarmResult<BlobReader>;

    fn stats(&self) -> EngineStats;
}

/// The engine contract the filesystem layers consume. The torrent protocol
/// itself lives behind this seam.
#[async_trait]
pub trait TorrentEngine: Send + Sync {
    async fn add_magnet(&self, uri: &str) -> SwarmResult<Arc<dyn TorrentHandle>>;

    async fn add_metainfo_file(&self, path: &Path) -> SwarmResult<Arc<dyn TorrentHandle>>;

    async fn get(&self, hash: &InfoHash) -> Option<Arc<dyn TorrentHandle>>;

    /// Drop the torrent and release its resources. Unknown hashes are a
    /// no-op.
    async fn drop_torrent(&self, hash: &InfoHash) -> SwarmResult<()>;
}
