use crate::SwarmResult;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// One row of a directory listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry {
    pub size: u64,
    pub is_dir: bool,
}

impl DirEntry {
    pub fn file(size: u64) -> Self {
        Self {
            size,
            is_dir: false,
        }
    }

    pub fn dir(size: u64) -> Self {
        Self { size, is_dir: true }
    }
}

/// An open handle in the virtual tree. Directories are readable as zero
/// bytes; files may block on the swarm inside `read_at`.
#[async_trait]
pub trait FsNode: Send + Sync {
    fn size(&self) -> u64;
    fn is_dir(&self) -> bool;
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> SwarmResult<usize>;
    /// Sequential read advancing an internal cursor.
    async fn read(&self, buf: &mut [u8]) -> SwarmResult<usize>;
    async fn close(&self) -> SwarmResult<()>;
}

impl std::fmt::Debug for dyn FsNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsNode")
            .field("size", &self.size())
            .field("is_dir", &self.is_dir())
            .finish()
    }
}

/// The capability every composable filesystem exposes. Paths are absolute
/// within the filesystem, forward-slash separated.
#[async_trait]
pub trait Filesystem: Send + Sync {
    async fn open(&self, path: &str) -> SwarmResult<Arc<dyn FsNode>>;
    async fn read_dir(&self, path: &str) -> SwarmResult<BTreeMap<String, DirEntry>>;
}

/// Directory handle carrying an aggregate size.
pub struct DirHandle {
    size: u64,
}

impl DirHandle {
    pub fn new(size: u64) -> Self {
        Self { size }
    }
}

#[async_trait]
impl FsNode for DirHandle {
    fn size(&self) -> u64 {
        self.size
    }

    fn is_dir(&self) -> bool {
        true
    }

    async fn read_at(&self, _buf: &mut [u8], _offset: u64) -> SwarmResult<usize> {
        Ok(0)
    }

    async fn read(&self, _buf: &mut [u8]) -> SwarmResult<usize> {
        Ok(0)
    }

    async fn close(&self) -> SwarmResult<()> {
        Ok(())
    }
}

/// Placeholder file for overlay listings: carries the real size but holds
/// no data, so reads report end of file.
pub struct InfoFile {
    size: u64,
}

impl InfoFile {
    pub fn new(size: u64) -> Self {
        Self { size }
    }
}

#[async_trait]
impl FsNode for InfoFile {
    fn size(&self) -> u64 {
        self.size
    }

    fn is_dir(&self) -> bool {
        false
    }

    async fn read_at(&self, _buf: &mut [u8], _offset: u64) -> SwarmResult<usize> {
        Ok(0)
    }

    async fn read(&self, _buf: &mut [u8]) -> SwarmResult<usize> {
        Ok(0)
    }

    async fn close(&self) -> SwarmResult<()> {
        Ok(())
    }
}

/// Placeholder directory for overlay listings with an aggregate size.
pub struct InfoDir {
    size: u64,
}

impl InfoDir {
    pub fn new(size: u64) -> Self {
        Self { size }
    }
}

#[async_trait]
impl FsNode for InfoDir {
    fn size(&self) -> u64 {
        self.size
    }

    fn is_dir(&self) -> bool {
        true
    }

    async fn read_at(&self, _buf: &mut [u8], _offset: u64) -> SwarmResult<usize> {
        Ok(0)
    }

    async fn read(&self, _buf: &mut [u8]) -> SwarmResult<usize> {
        Ok(0)
    }

    async fn close(&self) -> SwarmResult<()> {
        Ok(())
    }
}

/// Shared cursor helper for nodes that implement `read` on top of
/// `read_at`.
pub struct ReadCursor {
    pos: AtomicU64,
}

impl ReadCursor {
    pub fn new() -> Self {
        Self {
            pos: AtomicU64::new(0),
        }
    }

    pub fn advance(&self, n: usize) -> u64 {
        self.pos.fetch_add(n as u64, Ordering::SeqCst)
    }

    pub fn position(&self) -> u64 {
        self.pos.load(Ordering::SeqCst)
    }
}

impl Default for ReadCursor {
    fn default() -> Self {
        Self::new()
    }
}

/// In-memory file node, used by tests and by archive viewers that fully
/// extract an entry.
pub struct MemFile {
    data: Vec<u8>,
    cursor: ReadCursor,
}

impl MemFile {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            cursor: ReadCursor::new(),
        }
    }
}

#[async_trait]
impl FsNode for MemFile {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn is_dir(&self) -> bool {
        false
    }

    async fn read_at(&self, buf: &mut [u8], offset: u64) -> SwarmResult<usize> {
        if offset >= self.data.len() as u64 {
            return Ok(0);
        }
        let start = offset as usize;
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        Ok(n)
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
