use crate::reader_pool::{ReaderOpener, ReaderPool, ReaderPoolConfig};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use swarm_engine::{InfoHash, TorrentHandle};
use swarm_vfs::{
    clean_path, join_path, DirEntry, DirHandle, EntryTree, Filesystem, FsNode, ReadCursor,
    SwarmError, SwarmResult, TreeRef,
};
use tokio::sync::RwLock;

/// Runtime-tunable read parameters, applied to handles opened afterwards.
#[derive(Debug, Clone, Copy)]
pub struct TorrentFsTuning {
    pub read_timeout: Duration,
    pub pool_size: usize,
    pub readahead_bytes: u64,
}

impl Default for TorrentFsTuning {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(120),
            pool_size: 4,
            readahead_bytes: 2 * 1024 * 1024,
        }
    }
}

#[derive(Clone)]
struct FileSlot {
    opener: ReaderOpener,
    length: u64,
}

struct TorrentFsState {
    torrents: HashMap<InfoHash, Arc<dyn TorrentHandle>>,
    registered: HashSet<InfoHash>,
    tree: EntryTree<FileSlot>,
    /// Set when the torrent set changed and the tree needs a sweep; stays
    /// set while any torrent is still waiting for metadata.
    dirty: bool,
    tuning: TorrentFsTuning,
}

/// Filesystem over the torrents of one route. File entries materialize
/// lazily on first access after an add: every file of every
/// metadata-complete torrent is enumerated into the entry tree, wrapped in
/// a directory named after the torrent when it has more than one file.
pub struct TorrentFs {
    state: RwLock<TorrentFsState>,
}

impl TorrentFs {
    pub fn new(tuning: TorrentFsTuning) -> Self {
        Self {
            state: RwLock::new(TorrentFsState {
                torrents: HashMap::new(),
                registered: HashSet::new(),
                tree: EntryTree::new(),
                dirty: false,
                tuning,
            }),
        }
    }

    /// Idempotent: re-adding a known torrent only marks the tree for a lazy
    /// re-sweep.
    pub async fn add_torrent(&self, torrent: Arc<dyn TorrentHandle>) {
        let mut state = self.state.write().await;
        state.torrents.insert(torrent.info_hash(), torrent);
        state.dirty = true;
    }

    /// Forget a torrent now. The tree is rebuilt from the remaining
    /// torrents on next access; handles already open keep their readers
    /// until closed.
    pub async fn remove_torrent(&self, hash: &InfoHash) {
        let mut state = self.state.write().await;
        state.torrents.remove(hash);
        state.registered.clear();
        state.tree.clear();
        state.dirty = true;
    }

    pub async fn torrent_hashes(&self) -> Vec<InfoHash> {
        self.state.read().await.torrents.keys().copied().collect()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.torrents.is_empty()
    }

    pub async fn set_tuning(&self, tuning: TorrentFsTuning) {
        self.state.write().await.tuning = tuning;
    }

    /// Sweep torrents whose metadata arrived into the entry tree.
    /// Registration is recorded per hash so repeat accesses are O(1).
    async fn ensure_registered(&self) {
        {
            let state = self.state.read().await;
            if !state.dirty {
                return;
            }
        }
        let mut state = self.state.write().await;
        if !state.dirty {
            return;
        }

        let mut pending = false;
        let torrents: Vec<(InfoHash, Arc<dyn TorrentHandle>)> = state
            .torrents
            .iter()
            .map(|(h, t)| (*h, t.clone()))
            .collect();
        for (hash, torrent) in torrents {
            if state.registered.contains(&hash) {
                continue;
            }
            let info = match torrent.info() {
                Some(info) => info,
                None => {
                    pending = true;
                    continue;
                }
            };
            let single = info.files.len() == 1;
            for (index, file) in info.files.iter().enumerate() {
                let virtual_path = if single {
                    clean_path(&info.name)
                } else {
                    join_path(&info.name, &file.path)
                };
                let opener_torrent = torrent.clone();
                let opener: ReaderOpener = Arc::new(move || {
                    let torrent = opener_torrent.clone();
                    Box::pin(async move { torrent.new_reader(index).await })
                });
                state.tree.insert(
                    &virtual_path,
                    file.length,
                    FileSlot {
                        opener,
                        length: file.length,
                    },
                );
            }
            debug!(
                "registered torrent {} ({} files) into route tree",
                hash,
                info.files.len()
            );
            state.registered.insert(hash);
        }
        state.dirty = pending;
    }
}

#[async_trait]
impl Filesystem for TorrentFs {
    async fn open(&self, path: &str) -> SwarmResult<Arc<dyn FsNode>> {
        self.ensure_registered().await;
        let state = self.state.read().await;
        match state.tree.get(path) {
            Some(TreeRef::File { payload, .. }) => {
                let config = ReaderPoolConfig {
                    pool_size: state.tuning.pool_size,
                    read_timeout: state.tuning.read_timeout,
                    readahead_bytes: state.tuning.readahead_bytes,
                };
                Ok(Arc::new(TorrentFileNode {
                    pool: ReaderPool::new(payload.opener.clone(), payload.length, config),
                    length: payload.length,
                    cursor: ReadCursor::new(),
                }))
            }
            Some(TreeRef::Dir { size }) => Ok(Arc::new(DirHandle::new(size))),
            None => Err(SwarmError::NotFound(clean_path(path))),
        }
    }

    async fn read_dir(&self, path: &str) -> SwarmResult<BTreeMap<String, DirEntry>> {
        self.ensure_registered().await;
        let state = self.state.read().await;
        state
            .tree
            .list(path)
            .ok_or_else(|| SwarmError::NotFound(clean_path(path)))
    }
}

/// Open file handle backed by a lazily-created reader pool.
struct TorrentFileNode {
    pool: ReaderPool,
    length: u64,
    cursor: ReadCursor,
}

#[async_trait]
impl FsNode for TorrentFileNode {
    fn size(&self) -> u64 {
        self.length
    }

    fn is_dir(&self) -> bool {
        false
    }

    async fn read_at(&self, buf: &mut [u8], offset: u64) -> SwarmResult<usize> {
        if offset >= self.length {
            return Ok(0);
        }
        let want = buf.len().min((self.length - offset) as usize);
        self.pool.read_at(&mut buf[..want], offset).await
    }

    async fn read(&self, buf: &mut [u8]) -> SwarmResult<usize> {
        let pos = self.cursor.position();
        let n = self.read_at(buf, pos).await?;
        self.cursor.advance(n);
        Ok(n)
    }

    async fn close(&self) -> SwarmResult<()> {
        self.pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarm_engine::{
        MemFileSpec, MemTorrentSpec, MemoryEngine, MemoryEngineOptions, TorrentEngine,
    };

    fn hash(b: u8) -> InfoHash {
        InfoHash::new([b; 20])
    }

    async fn added(engine: &MemoryEngine, spec: MemTorrentSpec) -> Arc<dyn TorrentHandle> {
        let magnet = spec.magnet();
        engine.register(spec);
        let t = engine.add_magnet(&magnet).await.unwrap();
        t.wait_info().await.unwrap();
        t
    }

    fn season1(h: InfoHash) -> MemTorrentSpec {
        MemTorrentSpec {
            hash: h,
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
        }
    }

    #[tokio::test]
    async fn test_single_file_appears_at_root() {
        let engine = MemoryEngine::new(MemoryEngineOptions::default());
        let t = added(
            &engine,
            MemTorrentSpec::single_file(hash(1), "bigbuck.mkv", 1024, vec![9u8; 4096]),
        )
        .await;

        let fs = TorrentFs::new(TorrentFsTuning::default());
        fs.add_torrent(t).await;

        let root = fs.read_dir("/").await.unwrap();
        assert_eq!(root.len(), 1);
        assert_eq!(root["bigbuck.mkv"], DirEntry::file(4096));

        let node = fs.open("/bigbuck.mkv").await.unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(node.read_at(&mut buf, 0).await.unwrap(), 1);
        assert_eq!(buf[0], 9);
    }

    #[tokio::test]
    async fn test_multi_file_wrapped_in_torrent_name() {
        let engine = MemoryEngine::new(MemoryEngineOptions::default());
        let t = added(&engine, season1(hash(2))).await;

        let fs = TorrentFs::new(TorrentFsTuning::default());
        fs.add_torrent(t).await;

        let root = fs.read_dir("/").await.unwrap();
        assert_eq!(root["season1"], DirEntry::dir(30));

        let season = fs.read_dir("/season1").await.unwrap();
        assert_eq!(season["e01.mkv"], DirEntry::file(10));
        assert_eq!(season["e02.mkv"], DirEntry::file(20));
    }

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let engine = MemoryEngine::new(MemoryEngineOptions::default());
        let t = added(&engine, season1(hash(3))).await;

        let fs = TorrentFs::new(TorrentFsTuning::default());
        fs.add_torrent(t.clone()).await;
        let first = fs.read_dir("/season1").await.unwrap();
        fs.add_torrent(t).await;
        let second = fs.read_dir("/season1").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(fs.read_dir("/").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_then_readd_restores_listing() {
        let engine = MemoryEngine::new(MemoryEngineOptions::default());
        let a = added(&engine, season1(hash(4))).await;
        let b = added(
            &engine,
            MemTorrentSpec::single_file(hash(5), "solo.bin", 1024, vec![0u8; 50]),
        )
        .await;

        let fs = TorrentFs::new(TorrentFsTuning::default());
        fs.add_torrent(a.clone()).await;
        fs.add_torrent(b).await;
        let before = fs.read_dir("/").await.unwrap();

        fs.remove_torrent(&hash(4)).await;
        let removed = fs.read_dir("/").await.unwrap();
        assert!(!removed.contains_key("season1"));
        assert!(removed.contains_key("solo.bin"));
        assert!(fs.open("/season1/e01.mkv").await.unwrap_err().is_not_found());

        fs.add_torrent(a).await;
        assert_eq!(fs.read_dir("/").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_open_before_metadata_is_not_found() {
        let engine = MemoryEngine::new(MemoryEngineOptions::default());
        let uri = format!("magnet:?xt=urn:btih:{}", hash(6).hex());
        let t = engine.add_magnet(&uri).await.unwrap();

        let fs = TorrentFs::new(TorrentFsTuning::default());
        fs.add_torrent(t).await;
        assert!(fs.open("/anything").await.unwrap_err().is_not_found());
        assert!(fs.read_dir("/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_root_dir_size_is_leaf_sum() {
        let engine = MemoryEngine::new(MemoryEngineOptions::default());
        let t = added(&engine, season1(hash(7))).await;
        let fs = TorrentFs::new(TorrentFsTuning::default());
        fs.add_torrent(t).await;

        let root = fs.open("/").await.unwrap();
        assert!(root.is_dir());
        assert_eq!(root.size(), 30);
    }
}
