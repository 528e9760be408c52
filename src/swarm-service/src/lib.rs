mod health;
mod index_store;
mod overlay_index;
mod route_watcher;
mod service;
mod stats;
mod summary;

pub use health::{HealthConfig, HealthMonitor};
pub use index_store::IndexStore;
pub use overlay_index::build_route_index;
pub use route_watcher::{set_watch_interval, watch_interval, FolderSync, RouteWatcher};
pub use service::{Service, ServiceOptions};
pub use stats::{
    GlobalStats, RoutePageStats, RouteStats, RouteSummaryRow, Stats, TorrentStats, SAMPLING_GAP,
};
pub use summary::{FileSummary, TorrentSummary};

#[macro_use]
extern crate log;

#[cfg(test)]
mod service_tests;
