mod engine;
mod info_hash;
mod magnet;
mod mem;
mod peer_id;
mod piece_cache;
mod rqbit;

pub use engine::{
    BlobReader, EngineStats, PieceRun, PieceStatus, TorrentEngine, TorrentFileInfo, TorrentHandle,
    TorrentInfo,
};
pub use info_hash::InfoHash;
pub use magnet::MagnetLink;
pub use mem::{MemFileSpec, MemTorrentSpec, MemoryEngine, MemoryEngineOptions};
pub use peer_id::load_or_create_peer_id;
pub use piece_cache::PieceCache;
pub use rqbit::RqbitEngine;

#[macro_use]
extern crate log;
