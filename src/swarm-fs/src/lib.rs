mod overlay;
mod reader_pool;
mod torrent_fs;

pub use overlay::{Materializer, OverlayFs, OverlayLister};
pub use reader_pool::{ReaderOpener, ReaderPool, ReaderPoolConfig};
pub use torrent_fs::{TorrentFs, TorrentFsTuning};

#[macro_use]
extern crate log;
