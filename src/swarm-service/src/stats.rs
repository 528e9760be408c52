use crate::summary::TorrentSummary;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use swarm_engine::{InfoHash, PieceRun, TorrentHandle};
use swarm_vfs::{SwarmError, SwarmResult};

/// Minimum gap between two engine samples for one torrent; reads inside
/// the gap return the previous deltas instead of hitting the engine.
pub const SAMPLING_GAP: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TorrentStats {
    pub name: String,
    pub hash: String,
    pub size_bytes: u64,
    pub downloaded_bytes: u64,
    pub uploaded_bytes: u64,
    pub peers: usize,
    pub seeders: usize,
    pub time_passed: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub piece_chunks: Vec<PieceRun>,
    pub total_pieces: usize,
    pub piece_size: u64,
    #[serde(skip_serializing_if = "is_zero_i64")]
    pub added_at: i64,
}

fn is_zero_i64(n: &i64) -> bool {
    *n == 0
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteStats {
    pub name: String,
    pub torrent_stats: Vec<TorrentStats>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutePageStats {
    pub name: String,
    pub page: usize,
    pub size: usize,
    pub total: usize,
    pub items: Vec<TorrentStats>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteSummaryRow {
    pub name: String,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalStats {
    pub downloaded_bytes: u64,
    pub uploaded_bytes: u64,
    pub time_passed: f64,
}

struct PrevStat {
    total_download: u64,
    download: u64,
    total_upload: u64,
    upload: u64,
    peers: usize,
    seeders: usize,
    sampled_at: Instant,
    added_at: i64,
}

impl PrevStat {
    fn fresh(added_at: i64) -> Self {
        Self {
            total_download: 0,
            download: 0,
            total_upload: 0,
            upload: 0,
            peers: 0,
            seeders: 0,
            sampled_at: Instant::now() - SAMPLING_GAP,
            added_at,
        }
    }
}

struct StatsInner {
    torrents: HashMap<InfoHash, Arc<dyn TorrentHandle>>,
    by_route: HashMap<String, HashMap<InfoHash, Arc<dyn TorrentHandle>>>,
    previous: HashMap<InfoHash, PrevStat>,
    global_time: Instant,
}

/// Rate-windowed per-torrent counters plus route/global aggregation.
pub struct Stats {
    inner: Mutex<StatsInner>,
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

impl Stats {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StatsInner {
                torrents: HashMap::new(),
                by_route: HashMap::new(),
                previous: HashMap::new(),
                global_time: Instant::now(),
            }),
        }
    }

    /// Make the route visible in listings even while it has no torrents.
    pub fn add_route(&self, route: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.by_route.entry(route.to_string()).or_default();
    }

    pub fn add(&self, route: &str, torrent: Arc<dyn TorrentHandle>) {
        let hash = torrent.info_hash();
        let mut inner = self.inner.lock().unwrap();
        inner.torrents.insert(hash, torrent.clone());
        inner
            .previous
            .entry(hash)
            .or_insert_with(|| PrevStat::fresh(unix_now()));
        inner
            .by_route
            .entry(route.to_string())
            .or_default()
            .insert(hash, torrent);
    }

    /// Seed previous totals from a persisted summary so the first live
    /// sample reports deltas against history instead of zero.
    pub fn seed_previous(&self, hash: InfoHash, summary: &TorrentSummary) {
        let mut inner = self.inner.lock().unwrap();
        inner.previous.insert(
            hash,
            PrevStat {
                total_download: summary.down_total,
                download: 0,
                total_upload: summary.up_total,
                upload: 0,
                peers: summary.peers,
                seeders: summary.seeders,
                sampled_at: Instant::now(),
                added_at: summary.added_at,
            },
        );
    }

    /// The route keeps existing with an empty torrent set; only
    /// `remove_route` hides it.
    pub fn del(&self, route: &str, hash: &InfoHash) {
        let mut inner = self.inner.lock().unwrap();
        inner.torrents.remove(hash);
        inner.previous.remove(hash);
        if let Some(set) = inner.by_route.get_mut(route) {
            set.remove(hash);
        }
    }

    pub fn remove_route(&self, route: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.by_route.remove(route);
    }

    pub fn route_of(&self, hash: &InfoHash) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .by_route
            .iter()
            .find(|(_, set)| set.contains_key(hash))
            .map(|(route, _)| route.clone())
    }

    pub fn has_route(&self, route: &str) -> bool {
        self.inner.lock().unwrap().by_route.contains_key(route)
    }

    pub fn hashes_for_route(&self, route: &str) -> Vec<InfoHash> {
        let inner = self.inner.lock().unwrap();
        inner
            .by_route
            .get(route)
            .map(|set| set.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Previous cumulative totals, used by the snapshot writer.
    pub fn previous_totals(&self, hash: &InfoHash) -> Option<(u64, u64, usize, usize, i64)> {
        let inner = self.inner.lock().unwrap();
        inner.previous.get(hash).map(|p| {
            (
                p.total_download,
                p.total_upload,
                p.peers,
                p.seeders,
                p.added_at,
            )
        })
    }

    pub fn live_torrents(&self) -> Vec<(String, InfoHash, Arc<dyn TorrentHandle>)> {
        let inner = self.inner.lock().unwrap();
        let mut out = Vec::new();
        for (route, set) in &inner.by_route {
            for (hash, torrent) in set {
                out.push((route.clone(), *hash, torrent.clone()));
            }
        }
        out
    }

    /// Detail stats for one torrent, including the run-length piece state.
    pub fn stat(&self, hash: &InfoHash) -> SwarmResult<TorrentStats> {
        let mut inner = self.inner.lock().unwrap();
        let torrent = inner
            .torrents
            .get(hash)
            .cloned()
            .ok_or_else(|| SwarmError::NotFound(format!("torrent {}", hash)))?;
        Ok(Self::compute(&mut inner, Instant::now(), &torrent, true))
    }

    /// Per-route listing without per-piece state arrays.
    pub fn routes_stats(&self) -> Vec<RouteStats> {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let routes: Vec<(String, Vec<Arc<dyn TorrentHandle>>)> = inner
            .by_route
            .iter()
            .map(|(r, set)| (r.clone(), set.values().cloned().collect()))
            .collect();

        let mut out = Vec::new();
        for (name, torrents) in routes {
            let mut rows: Vec<TorrentStats> = torrents
                .iter()
                .map(|t| Self::compute(&mut inner, now, t, false))
                .collect();
            rows.sort_by(|a, b| a.name.cmp(&b.name));
            out.push(RouteStats {
                name,
                torrent_stats: rows,
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn route_summaries(&self) -> Vec<RouteSummaryRow> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<RouteSummaryRow> = inner
            .by_route
            .iter()
            .map(|(name, set)| RouteSummaryRow {
                name: name.clone(),
                total: set.len(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Full live row set for one route, non-chunked, sorted by name.
    pub fn route_rows(&self, route: &str) -> Vec<TorrentStats> {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let torrents: Vec<Arc<dyn TorrentHandle>> = inner
            .by_route
            .get(route)
            .map(|set| set.values().cloned().collect())
            .unwrap_or_default();
        let mut rows: Vec<TorrentStats> = torrents
            .iter()
            .map(|t| Self::compute(&mut inner, now, t, false))
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }

    pub fn route_stats_page(&self, route: &str, page: usize, size: usize) -> RoutePageStats {
        let size = if size == 0 { 25 } else { size };
        let page = page.max(1);
        paginate(route, self.route_rows(route), page, size)
    }

    pub fn global_stats(&self) -> GlobalStats {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let torrents: Vec<Arc<dyn TorrentHandle>> = inner.torrents.values().cloned().collect();

        let mut down = 0u64;
        let mut up = 0u64;
        for t in &torrents {
            let row = Self::compute(&mut inner, now, t, false);
            down += row.downloaded_bytes;
            up += row.uploaded_bytes;
        }
        let time_passed = now.duration_since(inner.global_time).as_secs_f64();
        inner.global_time = now;
        GlobalStats {
            downloaded_bytes: down,
            uploaded_bytes: up,
            time_passed,
        }
    }

    /// Per-torrent deltas with the sampling gap: a sample within the gap
    /// returns the cached deltas to avoid hammering the engine.
    fn compute(
        inner: &mut StatsInner,
        now: Instant,
        torrent: &Arc<dyn TorrentHandle>,
        chunks: bool,
    ) -> TorrentStats {
        let hash = torrent.info_hash();
        let mut row = TorrentStats {
            hash: hash.hex(),
            name: torrent.name(),
            ..Default::default()
        };

        let prev = match inner.previous.get(&hash) {
            Some(p) => p,
            None => return row,
        };
        row.time_passed = now.duration_since(prev.sampled_at).as_secs_f64();
        row.added_at = prev.added_at;

        if now.duration_since(prev.sampled_at) < SAMPLING_GAP {
            row.downloaded_bytes = prev.download;
            row.uploaded_bytes = prev.upload;
            row.peers = prev.peers;
            row.seeders = prev.seeders;
        } else {
            let engine = torrent.stats();
            let added_at = prev.added_at;
            let download = engine.bytes_read.saturating_sub(prev.total_download);
            let upload = engine.bytes_written.saturating_sub(prev.total_upload);
            inner.previous.insert(
                hash,
                PrevStat {
                    total_download: engine.bytes_read,
                    download,
                    total_upload: engine.bytes_written,
                    upload,
                    peers: engine.total_peers,
                    seeders: engine.connected_seeders,
                    sampled_at: now,
                    added_at,
                },
            );
            row.downloaded_bytes = download;
            row.uploaded_bytes = upload;
            row.peers = engine.total_peers;
            row.seeders = engine.connected_seeders;
        }

        if chunks {
            let engine = torrent.stats();
            row.total_pieces = engine.piece_runs.iter().map(|r| r.num_pieces).sum();
            row.piece_chunks = engine.piece_runs;
        }
        if let Some(info) = torrent.info() {
            row.piece_size = info.piece_length;
            row.size_bytes = info.total_file_length();
        }
        row
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn paginate(
    route: &str,
    rows: Vec<TorrentStats>,
    page: usize,
    size: usize,
) -> RoutePageStats {
    let total = rows.len();
    let start = ((page - 1) * size).min(total);
    let end = (start + size).min(total);
    RoutePageStats {
        name: route.to_string(),
        page,
        size,
        total,
        items: rows[start..end].to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarm_engine::{MemTorrentSpec, MemoryEngine, MemoryEngineOptions, TorrentEngine};

    fn hash(b: u8) -> InfoHash {
        InfoHash::new([b; 20])
    }

    async fn live_torrent(engine: &MemoryEngine, b: u8, name: &str) -> Arc<dyn TorrentHandle> {
        let spec = MemTorrentSpec::single_file(hash(b), name, 1024, vec![0u8; 2048]);
        let magnet = spec.magnet();
        engine.register(spec);
        let t = engine.add_magnet(&magnet).await.unwrap();
        t.wait_info().await.unwrap();
        t
    }

    #[tokio::test]
    async fn test_deltas_between_samples() {
        let engine = MemoryEngine::new(MemoryEngineOptions::default());
        let t = live_torrent(&engine, 1, "a").await;
        let stats = Stats::new();
        stats.add("movies", t.clone());

        let mem = engine.mem_handle(&hash(1)).unwrap();
        mem.set_swarm(4, 2);
        mem.add_uploaded(500);

        let row = stats.stat(&hash(1)).unwrap();
        assert_eq!(row.uploaded_bytes, 500);
        assert_eq!(row.peers, 4);
        assert_eq!(row.seeders, 2);
        assert_eq!(row.size_bytes, 2048);

        // Inside the gap the cached deltas come back without resampling.
        mem.add_uploaded(9999);
        let row2 = stats.stat(&hash(1)).unwrap();
        assert_eq!(row2.uploaded_bytes, 500);

        tokio::time::sleep(SAMPLING_GAP + Duration::from_millis(20)).await;
        let row3 = stats.stat(&hash(1)).unwrap();
        assert_eq!(row3.uploaded_bytes, 9999);
    }

    #[tokio::test]
    async fn test_listing_variants() {
        let engine = MemoryEngine::new(MemoryEngineOptions::default());
        let a = live_torrent(&engine, 1, "alpha").await;
        let b = live_torrent(&engine, 2, "beta").await;
        let stats = Stats::new();
        stats.add("movies", a);
        stats.add("movies", b);
        stats.add_route("empty");

        let routes = stats.routes_stats();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].name, "empty");
        let movies = &routes[1];
        assert_eq!(movies.torrent_stats.len(), 2);
        assert_eq!(movies.torrent_stats[0].name, "alpha");
        // Broad listings omit the piece arrays.
        assert!(movies.torrent_stats[0].piece_chunks.is_empty());

        let page = stats.route_stats_page("movies", 1, 1);
        assert_eq!(page.total, 2);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].name, "alpha");
        let page2 = stats.route_stats_page("movies", 2, 1);
        assert_eq!(page2.items[0].name, "beta");

        let summaries = stats.route_summaries();
        assert_eq!(summaries[0].total, 0);
        assert_eq!(summaries[1].total, 2);
    }

    #[tokio::test]
    async fn test_del_keeps_route_visible() {
        let engine = MemoryEngine::new(MemoryEngineOptions::default());
        let t = live_torrent(&engine, 3, "solo").await;
        let stats = Stats::new();
        stats.add("music", t);
        stats.del("music", &hash(3));

        assert!(stats.has_route("music"));
        assert!(stats.stat(&hash(3)).is_err());
        assert_eq!(stats.route_summaries()[0].total, 0);

        stats.remove_route("music");
        assert!(!stats.has_route("music"));
    }

    #[tokio::test]
    async fn test_chunked_detail_has_runs() {
        let engine = MemoryEngine::new(MemoryEngineOptions::default());
        let t = live_torrent(&engine, 4, "runny").await;
        let stats = Stats::new();
        stats.add("movies", t);

        let row = stats.stat(&hash(4)).unwrap();
        assert_eq!(row.total_pieces, 2);
        assert!(!row.piece_chunks.is_empty());
    }
}
