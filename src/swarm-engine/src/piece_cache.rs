use crate::info_hash::InfoHash;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use swarm_vfs::{SwarmError, SwarmResult};
use tokio::fs;

#[derive(Debug, Clone, Copy)]
struct PieceMeta {
    len: u64,
    last_used: u64,
}

struct CacheState {
    capacity: u64,
    used: u64,
    /// Monotonic access stamp; higher means more recent.
    seq: u64,
    entries: HashMap<(InfoHash, u32), PieceMeta>,
}

impl CacheState {
    fn touch(&mut self, key: &(InfoHash, u32)) {
        self.seq += 1;
        let seq = self.seq;
        if let Some(meta) = self.entries.get_mut(key) {
            meta.last_used = seq;
        }
    }
}

/// Shared bounded piece store: `(hash, piece index)` to bytes, one file per
/// piece under a per-torrent directory. Admission is unconditional;
/// exceeding the capacity evicts least-recently-used pieces until back
/// under it.
pub struct PieceCache {
    root: PathBuf,
    state: Mutex<CacheState>,
}

impl PieceCache {
    /// Open the cache at `root`, rescanning pieces left by previous runs.
    /// Pre-existing pieces are ordered by file modification time for
    /// eviction purposes.
    pub async fn open(root: PathBuf, capacity: u64) -> SwarmResult<Self> {
        fs::create_dir_all(&root).await?;

        let mut entries = HashMap::new();
        let mut used = 0u64;
        let mut scanned: Vec<((InfoHash, u32), u64, u64)> = Vec::new();

        let mut dirs = fs::read_dir(&root).await?;
        while let Some(hash_dir) = dirs.next_entry().await? {
            if !hash_dir.file_type().await?.is_dir() {
                continue;
            }
            let hash = match InfoHash::from_hex(&hash_dir.file_name().to_string_lossy()) {
                Ok(h) => h,
                Err(_) => continue,
            };
            let mut shard1 = fs::read_dir(hash_dir.path()).await?;
            while let Some(d1) = shard1.next_entry().await? {
                if !d1.file_type().await?.is_dir() {
                    continue;
                }
                let mut shard2 = fs::read_dir(d1.path()).await?;
                while let Some(d2) = shard2.next_entry().await? {
                    if !d2.file_type().await?.is_dir() {
                        continue;
                    }
                    let mut files = fs::read_dir(d2.path()).await?;
                    while let Some(file) = files.next_entry().await? {
                        let index: u32 = match file.file_name().to_string_lossy().parse() {
                            Ok(i) => i,
                            Err(_) => continue,
                        };
                        let meta = file.metadata().await?;
                        let mtime = meta
                            .modified()
                            .ok()
                            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                            .map(|d| d.as_secs())
                            .unwrap_or(0);
                        scanned.push(((hash, index), meta.len(), mtime));
                    }
                }
            }
        }

        scanned.sort_by_key(|(_, _, mtime)| *mtime);
        let mut seq = 0u64;
        for (key, len, _) in scanned {
            seq += 1;
            used += len;
            entries.insert(key, PieceMeta {
                len,
                last_used: seq,
            });
        }
        debug!(
            "piece cache opened at {}: {} pieces, {} bytes",
            root.display(),
            entries.len(),
            used
        );

        let cache = Self {
            root,
            state: Mutex::new(CacheState {
                capacity,
                used,
                seq,
                entries,
            }),
        };
        cache.evict_to_capacity().await?;
        Ok(cache)
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    pub fn used_bytes(&self) -> u64 {
        self.state.lock().unwrap().used
    }

    pub fn capacity(&self) -> u64 {
        self.state.lock().unwrap().capacity
    }

    pub async fn set_capacity(&self, capacity: u64) -> SwarmResult<()> {
        self.state.lock().unwrap().capacity = capacity;
        self.evict_to_capacity().await
    }

    /// Pieces live under a two-level directory derived from the low hex
    /// digits of the index, so no single directory grows unbounded for
    /// torrents with tens of thousands of pieces.
    fn piece_path(&self, hash: &InfoHash, index: u32) -> PathBuf {
        let hex_str = format!("{:08x}", index);
        let len = hex_str.len();
        let dir1 = &hex_str[len - 4..len - 2];
        let dir2 = &hex_str[len - 2..len];
        self.root
            .join(hash.hex())
            .join(dir1)
            .join(dir2)
            .join(index.to_string())
    }

    /// Store one piece. Never rejected; may trigger eviction of other
    /// pieces afterwards.
    pub async fn put(&self, hash: &InfoHash, index: u32, data: &[u8]) -> SwarmResult<()> {
        let path = self.piece_path(hash, index);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, data).await.map_err(|e| {
            warn!("piece cache write failed for {}: {}", path.display(), e);
            SwarmError::IoError(e.to_string())
        })?;

        {
            let mut state = self.state.lock().unwrap();
            state.seq += 1;
            let seq = state.seq;
            let key = (*hash, index);
            if let Some(old) = state.entries.insert(
                key,
                PieceMeta {
                    len: data.len() as u64,
                    last_used: seq,
                },
            ) {
                state.used -= old.len;
            }
            state.used += data.len() as u64;
        }
        self.evict_to_capacity().await
    }

    /// Fetch one piece if present, refreshing its recency.
    pub async fn get(&self, hash: &InfoHash, index: u32) -> SwarmResult<Option<Vec<u8>>> {
        let key = (*hash, index);
        {
            let mut state = self.state.lock().unwrap();
            if !state.entries.contains_key(&key) {
                return Ok(None);
            }
            state.touch(&key);
        }
        match fs::read(self.piece_path(hash, index)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Index and disk drifted; forget the entry.
                let mut state = self.state.lock().unwrap();
                if let Some(meta) = state.entries.remove(&key) {
                    state.used -= meta.len;
                }
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn contains(&self, hash: &InfoHash, index: u32) -> bool {
        self.state
            .lock()
            .unwrap()
            .entries
            .contains_key(&(*hash, index))
    }

    /// Release every piece belonging to one torrent.
    pub async fn remove_torrent(&self, hash: &InfoHash) -> SwarmResult<()> {
        {
            let mut state = self.state.lock().unwrap();
            let keys: Vec<(InfoHash, u32)> = state
                .entries
                .keys()
                .filter(|(h, _)| h == hash)
                .copied()
                .collect();
            for key in keys {
                if let Some(meta) = state.entries.remove(&key) {
                    state.used -= meta.len;
                }
            }
        }
        match fs::remove_dir_all(self.root.join(hash.hex())).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn evict_to_capacity(&self) -> SwarmResult<()> {
        loop {
            let victim = {
                let mut state = self.state.lock().unwrap();
                if state.used <= state.capacity {
                    return Ok(());
                }
                let key = state
                    .entries
                    .iter()
                    .min_by_key(|(_, meta)| meta.last_used)
                    .map(|(k, _)| *k);
                match key {
                    Some(key) => {
                        let meta = state.entries.remove(&key).expect("victim exists");
                        state.used -= meta.len;
                        key
                    }
                    None => return Ok(()),
                }
            };
            let path = self.piece_path(&victim.0, victim.1);
            debug!("evicting cached piece {}", path.display());
            if let Err(e) = fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("piece cache eviction failed for {}: {}", path.display(), e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn hash(b: u8) -> InfoHash {
        InfoHash::new([b; 20])
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let cache = PieceCache::open(dir.path().to_path_buf(), 1024).await.unwrap();

        cache.put(&hash(1), 0, b"piece zero").await.unwrap();
        assert_eq!(
            cache.get(&hash(1), 0).await.unwrap().unwrap(),
            b"piece zero"
        );
        assert!(cache.get(&hash(1), 1).await.unwrap().is_none());
        assert_eq!(cache.used_bytes(), 10);
    }

    #[tokio::test]
    async fn test_lru_eviction_under_pressure() {
        let dir = TempDir::new().unwrap();
        let cache = PieceCache::open(dir.path().to_path_buf(), 25).await.unwrap();

        cache.put(&hash(1), 0, &[0u8; 10]).await.unwrap();
        cache.put(&hash(1), 1, &[1u8; 10]).await.unwrap();
        // Touch piece 0 so piece 1 is the eviction victim.
        cache.get(&hash(1), 0).await.unwrap();
        cache.put(&hash(1), 2, &[2u8; 10]).await.unwrap();

        assert!(cache.contains(&hash(1), 0));
        assert!(!cache.contains(&hash(1), 1));
        assert!(cache.contains(&hash(1), 2));
        assert!(cache.used_bytes() <= 25);
    }

    #[tokio::test]
    async fn test_remove_torrent_releases_everything() {
        let dir = TempDir::new().unwrap();
        let cache = PieceCache::open(dir.path().to_path_buf(), 1024).await.unwrap();

        cache.put(&hash(1), 0, &[0u8; 8]).await.unwrap();
        cache.put(&hash(2), 0, &[0u8; 8]).await.unwrap();
        cache.remove_torrent(&hash(1)).await.unwrap();

        assert!(!cache.contains(&hash(1), 0));
        assert!(cache.contains(&hash(2), 0));
        assert_eq!(cache.used_bytes(), 8);
        assert!(!dir.path().join(hash(1).hex()).exists());
    }

    #[tokio::test]
    async fn test_pieces_are_shard_dir_addressed() {
        let dir = TempDir::new().unwrap();
        let cache = PieceCache::open(dir.path().to_path_buf(), 1024).await.unwrap();

        cache.put(&hash(5), 0, b"a").await.unwrap();
        cache.put(&hash(5), 0x1234, b"b").await.unwrap();

        let root = dir.path().join(hash(5).hex());
        assert!(root.join("00").join("00").join("0").is_file());
        assert!(root.join("12").join("34").join("4660").is_file());
    }

    #[tokio::test]
    async fn test_rescan_on_open() {
        let dir = TempDir::new().unwrap();
        {
            let cache = PieceCache::open(dir.path().to_path_buf(), 1024).await.unwrap();
            cache.put(&hash(3), 7, b"persisted").await.unwrap();
        }
        let cache = PieceCache::open(dir.path().to_path_buf(), 1024).await.unwrap();
        assert_eq!(
            cache.get(&hash(3), 7).await.unwrap().unwrap(),
            b"persisted"
        );
    }
}
