mod archive;
mod container;
mod node;
mod path;
mod tree;

pub use archive::{builtin_factories, match_factory, ArchiveFactory, TarFs, TgzFs, ZipFs};
pub use container::ContainerFs;
pub use node::{DirEntry, DirHandle, Filesystem, FsNode, InfoDir, InfoFile, MemFile, ReadCursor};
pub use path::{clean_path, file_ext, first_component, join_path, split_path};
pub use tree::{EntryTree, TreeRef};

use thiserror::Error;

#[macro_use]
extern crate log;

#[derive(Error, Debug)]
pub enum SwarmError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("read timed out: {0}")]
    Timeout(String),
    #[error("unexpected end of file: {0}")]
    UnexpectedEof(String),
    #[error("timed out waiting for torrent info: {0}")]
    InfoTimeout(String),
    #[error("invalid param: {0}")]
    InvalidParam(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("db error: {0}")]
    DbError(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl SwarmError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, SwarmError::NotFound(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, SwarmError::Timeout(_))
    }
}

pub type SwarmResult<T> = std::result::Result<T, SwarmError>;

impl From<std::io::Error> for SwarmError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => SwarmError::NotFound(err.to_string()),
            std::io::ErrorKind::UnexpectedEof => SwarmError::UnexpectedEof(err.to_string()),
            std::io::ErrorKind::TimedOut => SwarmError::Timeout(err.to_string()),
            _ => SwarmError::IoError(err.to_string()),
        }
    }
}
