//! Read-only archive viewers. A factory turns an open file node into a
//! browsable sub-filesystem; the container mounts the result on first
//! access. Entry data is pulled through the node's positional reads, so a
//! file inside an archive inside a torrent is still streamed on demand.

use crate::node::{DirEntry, DirHandle, Filesystem, FsNode, ReadCursor};
use crate::path::clean_path;
use crate::tree::{EntryTree, TreeRef};
use crate::{SwarmError, SwarmResult};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::spawn_blocking;

pub type ArchiveFactory = Arc<
    dyn Fn(Arc<dyn FsNode>) -> BoxFuture<'static, SwarmResult<Arc<dyn Filesystem>>>
        + Send
        + Sync,
>;

/// Factories for the container formats shipped by default.
pub fn builtin_factories() -> HashMap<String, ArchiveFactory> {
    let mut out: HashMap<String, ArchiveFactory> = HashMap::new();
    out.insert(
        ".zip".to_string(),
        Arc::new(|node| {
            Box::pin(async move {
                Ok(Arc::new(ZipFs::new(node).await?) as Arc<dyn Filesystem>)
            })
        }),
    );
    out.insert(
        ".tar".to_string(),
        Arc::new(|node| {
            Box::pin(async move {
                Ok(Arc::new(TarFs::new(node).await?) as Arc<dyn Filesystem>)
            })
        }),
    );
    out.insert(
        ".tar.gz".to_string(),
        Arc::new(|node| {
            Box::pin(async move {
                Ok(Arc::new(TgzFs::new(node).await?) as Arc<dyn Filesystem>)
            })
        }),
    );
    out.insert(
        ".tgz".to_string(),
        Arc::new(|node| {
            Box::pin(async move {
                Ok(Arc::new(TgzFs::new(node).await?) as Arc<dyn Filesystem>)
            })
        }),
    );
    out
}

/// Pick the factory whose suffix matches `name`, preferring the longest
/// suffix so ".tar.gz" wins over a hypothetical ".gz".
pub fn match_factory(
    factories: &HashMap<String, ArchiveFactory>,
    name: &str,
) -> Option<ArchiveFactory> {
    let lower = name.to_ascii_lowercase();
    let mut best: Option<(&String, &ArchiveFactory)> = None;
    for (suffix, f) in factories {
        if lower.ends_with(suffix.as_str()) && lower.len() > suffix.len() {
            match best {
                Some((cur, _)) if cur.len() >= suffix.len() => {}
                _ => best = Some((suffix, f)),
            }
        }
    }
    best.map(|(_, f)| f.clone())
}

/// Blocking `Read + Seek` adapter over an async node. Only used from
/// `spawn_blocking` threads; each read parks on the runtime handle.
struct NodeCursor {
    node: Arc<dyn FsNode>,
    len: u64,
    pos: u64,
    rt: Handle,
}

impl NodeCursor {
    fn new(node: Arc<dyn FsNode>, rt: Handle) -> Self {
        let len = node.size();
        Self {
            node,
            len,
            pos: 0,
            rt,
        }
    }
}

impl Read for NodeCursor {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let node = self.node.clone();
        let pos = self.pos;
        let n = self
            .rt
            .block_on(async { node.read_at(buf, pos).await })
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for NodeCursor {
    fn seek(&mut self, from: SeekFrom) -> std::io::Result<u64> {
        let target = match from {
            SeekFrom::Start(o) => o as i128,
            SeekFrom::Current(d) => self.pos as i128 + d as i128,
            SeekFrom::End(d) => self.len as i128 + d as i128,
        };
        if target < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}

struct ArchiveSource {
    node: Arc<dyn FsNode>,
    rt: Handle,
}

fn join_err(e: tokio::task::JoinError) -> SwarmError {
    SwarmError::Internal(format!("archive worker failed: {}", e))
}

// ---------- zip ----------

/// Read-only view over a zip archive.
pub struct ZipFs {
    src: Arc<ArchiveSource>,
    tree: EntryTree<usize>,
}

impl ZipFs {
    pub async fn new(node: Arc<dyn FsNode>) -> SwarmResult<Self> {
        let rt = Handle::current();
        let src = Arc::new(ArchiveSource {
            node,
            rt: rt.clone(),
        });
        let scan_src = src.clone();
        let entries = spawn_blocking(move || -> SwarmResult<Vec<(String, u64, bool, usize)>> {
            let cursor = NodeCursor::new(scan_src.node.clone(), scan_src.rt.clone());
            let mut za = zip::ZipArchive::new(cursor)
                .map_err(|e| SwarmError::InvalidParam(format!("bad zip archive: {}", e)))?;
            let mut out = Vec::with_capacity(za.len());
            for i in 0..za.len() {
                let entry = za
                    .by_index(i)
                    .map_err(|e| SwarmError::InvalidParam(format!("bad zip entry: {}", e)))?;
                out.push((entry.name().to_string(), entry.size(), entry.is_dir(), i));
            }
            Ok(out)
        })
        .await
        .map_err(join_err)??;

        let mut tree = EntryTree::new();
        for (name, size, is_dir, index) in entries {
            if is_dir {
                tree.insert_dir(&name);
            } else {
                tree.insert(&name, size, index);
            }
        }
        Ok(Self { src, tree })
    }
}

#[async_trait]
impl Filesystem for ZipFs {
    async fn open(&self, path: &str) -> SwarmResult<Arc<dyn FsNode>> {
        match self.tree.get(path) {
            Some(TreeRef::File { size, payload }) => Ok(Arc::new(ZipEntryNode {
                src: self.src.clone(),
                index: *payload,
                size,
                cursor: ReadCursor::new(),
            })),
            Some(TreeRef::Dir { size }) => Ok(Arc::new(DirHandle::new(size))),
            None => Err(SwarmError::NotFound(clean_path(path))),
        }
    }

    async fn read_dir(&self, path: &str) -> SwarmResult<BTreeMap<String, DirEntry>> {
        self.tree
            .list(path)
            .ok_or_else(|| SwarmError::NotFound(clean_path(path)))
    }
}

struct ZipEntryNode {
    src: Arc<ArchiveSource>,
    index: usize,
    size: u64,
    cursor: ReadCursor,
}

#[async_trait]
impl FsNode for ZipEntryNode {
    fn size(&self) -> u64 {
        self.size
    }

    fn is_dir(&self) -> bool {
        false
    }

    async fn read_at(&self, buf: &mut [u8], offset: u64) -> SwarmResult<usize> {
        if offset >= self.size {
            return Ok(0);
        }
        let want = buf.len().min((self.size - offset) as usize);
        let src = self.src.clone();
        let index = self.index;
        // Zip entries are streams, not random-access: re-open the entry and
        // discard up to the requested offset.
        let data = spawn_blocking(move || -> SwarmResult<Vec<u8>> {
            let cursor = NodeCursor::new(src.node.clone(), src.rt.clone());
            let mut za = zip::ZipArchive::new(cursor)
                .map_err(|e| SwarmError::InvalidParam(format!("bad zip archive: {}", e)))?;
            let mut entry = za
                .by_index(index)
                .map_err(|e| SwarmError::InvalidParam(format!("bad zip entry: {}", e)))?;
            std::io::copy(&mut (&mut entry).take(offset), &mut std::io::sink())?;
            read_up_to(&mut entry, want)
        })
        .await
        .map_err(join_err)??;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    async fn read(&self, buf: &mut [u8]) -> SwarmResult<usize> {
        let pos = self.cursor.position();
        let n = self.read_at(buf, pos).await?;
        self.cursor.advance(n);
        Ok(n)
    }

    async fn close(&self) -> SwarmResult<()> {
        Ok(())
    }
}

fn read_up_to<R: Read>(r: &mut R, want: usize) -> SwarmResult<Vec<u8>> {
    let mut out = vec![0u8; want];
    let mut read = 0;
    while read < want {
        let n = r.read(&mut out[read..])?;
        if n == 0 {
            break;
        }
        read += n;
    }
    out.truncate(read);
    Ok(out)
}

// ---------- tar ----------

#[derive(Clone, Copy)]
struct TarEntryMeta {
    data_offset: u64,
}

/// Read-only view over an uncompressed tar archive. Entry payloads are
/// contiguous, so reads map straight to positional reads on the backing
/// node.
pub struct TarFs {
    node: Arc<dyn FsNode>,
    tree: EntryTree<TarEntryMeta>,
}

fn scan_tar<R: Read>(reader: R) -> SwarmResult<Vec<(String, u64, bool, u64)>> {
    let mut ar = tar::Archive::new(reader);
    let mut out = Vec::new();
    let entries = ar
        .entries()
        .map_err(|e| SwarmError::InvalidParam(format!("bad tar archive: {}", e)))?;
    for entry in entries {
        let entry =
            entry.map_err(|e| SwarmError::InvalidParam(format!("bad tar entry: {}", e)))?;
        let path = entry
            .path()
            .map_err(|e| SwarmError::InvalidParam(format!("bad tar path: {}", e)))?
            .to_string_lossy()
            .to_string();
        let is_dir = entry.header().entry_type().is_dir();
        out.push((path, entry.size(), is_dir, entry.raw_file_position()));
    }
    Ok(out)
}

impl TarFs {
    pub async fn new(node: Arc<dyn FsNode>) -> SwarmResult<Self> {
        let rt = Handle::current();
        let scan_node = node.clone();
        let entries = spawn_blocking(move || {
            let cursor = NodeCursor::new(scan_node, rt);
            scan_tar(cursor)
        })
        .await
        .map_err(join_err)??;

        let mut tree = EntryTree::new();
        for (path, size, is_dir, data_offset) in entries {
            if is_dir {
                tree.insert_dir(&path);
            } else {
                tree.insert(&path, size, TarEntryMeta { data_offset });
            }
        }
        Ok(Self { node, tree })
    }
}

#[async_trait]
impl Filesystem for TarFs {
    async fn open(&self, path: &str) -> SwarmResult<Arc<dyn FsNode>> {
        match self.tree.get(path) {
            Some(TreeRef::File { size, payload }) => Ok(Arc::new(TarEntryNode {
                node: self.node.clone(),
                meta: *payload,
                size,
                cursor: ReadCursor::new(),
            })),
            Some(TreeRef::Dir { size }) => Ok(Arc::new(DirHandle::new(size))),
            None => Err(SwarmError::NotFound(clean_path(path))),
        }
    }

    async fn read_dir(&self, path: &str) -> SwarmResult<BTreeMap<String, DirEntry>> {
        self.tree
            .list(path)
            .ok_or_else(|| SwarmError::NotFound(clean_path(path)))
    }
}

struct TarEntryNode {
    node: Arc<dyn FsNode>,
    meta: TarEntryMeta,
    size: u64,
    cursor: ReadCursor,
}

#[async_trait]
impl FsNode for TarEntryNode {
    fn size(&self) -> u64 {
        self.size
    }

    fn is_dir(&self) -> bool {
        false
    }

    async fn read_at(&self, buf: &mut [u8], offset: u64) -> SwarmResult<usize> {
        if offset >= self.size {
            return Ok(0);
        }
        let want = buf.len().min((self.size - offset) as usize);
        self.node
            .read_at(&mut buf[..want], self.meta.data_offset + offset)
            .await
    }

    async fn read(&self, buf: &mut [u8]) -> SwarmResult<usize> {
        let pos = self.cursor.position();
        let n = self.read_at(buf, pos).await?;
        self.cursor.advance(n);
        Ok(n)
    }

    async fn close(&self) -> SwarmResult<()> {
        Ok(())
    }
}

// ---------- tar.gz ----------

#[derive(Clone, Copy)]
struct TgzEntryMeta {
    /// Offset of the entry payload within the decompressed stream.
    data_offset: u64,
}

/// Read-only view over a gzip-compressed tar archive. The stream has no
/// random access, so each read decompresses from the start and discards up
/// to the target offset.
pub struct TgzFs {
    src: Arc<ArchiveSource>,
    tree: EntryTree<TgzEntryMeta>,
}

impl TgzFs {
    pub async fn new(node: Arc<dyn FsNode>) -> SwarmResult<Self> {
        let rt = Handle::current();
        let src = Arc::new(ArchiveSource {
            node,
            rt: rt.clone(),
        });
        let scan_src = src.clone();
        let entries = spawn_blocking(move || {
            let cursor = NodeCursor::new(scan_src.node.clone(), scan_src.rt.clone());
            scan_tar(flate2::read::GzDecoder::new(cursor))
        })
        .await
        .map_err(join_err)??;

        let mut tree = EntryTree::new();
        for (path, size, is_dir, data_offset) in entries {
            if is_dir {
                tree.insert_dir(&path);
            } else {
                tree.insert(&path, size, TgzEntryMeta { data_offset });
            }
        }
        Ok(Self { src, tree })
    }
}

#[async_trait]
impl Filesystem for TgzFs {
    async fn open(&self, path: &str) -> SwarmResult<Arc<dyn FsNode>> {
        match self.tree.get(path) {
            Some(TreeRef::File { size, payload }) => Ok(Arc::new(TgzEntryNode {
                src: self.src.clone(),
                meta: *payload,
                size,
                cursor: ReadCursor::new(),
            })),
            Some(TreeRef::Dir { size }) => Ok(Arc::new(DirHandle::new(size))),
            None => Err(SwarmError::NotFound(clean_path(path))),
        }
    }

    async fn read_dir(&self, path: &str) -> SwarmResult<BTreeMap<String, DirEntry>> {
        self.tree
            .list(path)
            .ok_or_else(|| SwarmError::NotFound(clean_path(path)))
    }
}

struct TgzEntryNode {
    src: Arc<ArchiveSource>,
    meta: TgzEntryMeta,
    size: u64,
    cursor: ReadCursor,
}

#[async_trait]
impl FsNode for TgzEntryNode {
    fn size(&self) -> u64 {
        self.size
    }

    fn is_dir(&self) -> bool {
        false
    }

    async fn read_at(&self, buf: &mut [u8], offset: u64) -> SwarmResult<usize> {
        if offset >= self.size {
            return Ok(0);
        }
        let want = buf.len().min((self.size - offset) as usize);
        let src = self.src.clone();
        let skip = self.meta.data_offset + offset;
        let data = spawn_blocking(move || -> SwarmResult<Vec<u8>> {
            let cursor = NodeCursor::new(src.node.clone(), src.rt.clone());
            let mut dec = flate2::read::GzDecoder::new(cursor);
            std::io::copy(&mut (&mut dec).take(skip), &mut std::io::sink())?;
            read_up_to(&mut dec, want)
        })
        .await
        .map_err(join_err)??;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    async fn read(&self, buf: &mut [u8]) -> SwarmResult<usize> {
        let pos = self.cursor.position();
        let n = self.read_at(buf, pos).await?;
        self.cursor.advance(n);
        Ok(n)
    }

    async fn close(&self) -> SwarmResult<()> {
        Ok(())
    }
}
