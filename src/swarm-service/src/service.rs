use crate::index_store::IndexStore;
use crate::overlay_index::build_route_index;
use crate::route_watcher::{FolderSync, RouteWatcher};
use crate::stats::{paginate, RoutePageStats, RouteStats, Stats, TorrentStats};
use crate::summary::{FileSummary, TorrentSummary};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use swarm_engine::{InfoHash, PieceCache, TorrentEngine, TorrentHandle};
use swarm_fs::{Materializer, OverlayFs, OverlayLister, TorrentFs, TorrentFsTuning};
use swarm_vfs::{first_component, ContainerFs, EntryTree, Filesystem, SwarmError, SwarmResult};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// Root for the index store, the UI-managed routes tree and the peer
    /// identifier.
    pub metadata_root: PathBuf,
    pub add_timeout: Duration,
    pub read_timeout: Duration,
    /// When set, an add whose metadata is late succeeds anyway and the
    /// wait continues in the background.
    pub continue_on_add_timeout: bool,
    pub reader_pool_size: usize,
    pub readahead_bytes: u64,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            metadata_root: PathBuf::from("./swarmfs-data/metadata"),
            add_timeout: Duration::from_secs(60),
            read_timeout: Duration::from_secs(120),
            continue_on_add_timeout: false,
            reader_pool_size: 4,
            readahead_bytes: 2 * 1024 * 1024,
        }
    }
}

struct ServiceState {
    route_fs: HashMap<String, Arc<TorrentFs>>,
    path_to_hash: HashMap<PathBuf, InfoHash>,
    watchers: HashMap<String, RouteWatcher>,
    cached: HashMap<InfoHash, TorrentSummary>,
    overlay_index: HashMap<String, Arc<EntryTree<()>>>,
    tuning: TorrentFsTuning,
}

/// Orchestrator tying routes together: engine, index store, per-route
/// filesystems, container mounts, stats, watchers and summary persistence.
/// The single state mutex is held only to snapshot or update maps, never
/// across I/O.
pub struct Service {
    engine: Arc<dyn TorrentEngine>,
    db: Arc<IndexStore>,
    stats: Arc<Stats>,
    cache: Arc<PieceCache>,
    container: Arc<ContainerFs>,
    options: ServiceOptions,
    state: Mutex<ServiceState>,
    client_api_enabled: AtomicBool,
    snapshot_cancel: Mutex<Option<CancellationToken>>,
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn validate_route(route: &str) -> SwarmResult<()> {
    if route.is_empty() || route.contains('/') || route.contains('\\') {
        return Err(SwarmError::InvalidParam(format!(
            "bad route name {:?}",
            route
        )));
    }
    Ok(())
}

impl Service {
    pub fn new(
        engine: Arc<dyn TorrentEngine>,
        db: Arc<IndexStore>,
        stats: Arc<Stats>,
        cache: Arc<PieceCache>,
        container: Arc<ContainerFs>,
        options: ServiceOptions,
    ) -> Arc<Self> {
        let tuning = TorrentFsTuning {
            read_timeout: options.read_timeout,
            pool_size: options.reader_pool_size,
            readahead_bytes: options.readahead_bytes,
        };
        Arc::new(Self {
            engine,
            db,
            stats,
            cache,
            container,
            options,
            state: Mutex::new(ServiceState {
                route_fs: HashMap::new(),
                path_to_hash: HashMap::new(),
                watchers: HashMap::new(),
                cached: HashMap::new(),
                overlay_index: HashMap::new(),
                tuning,
            }),
            client_api_enabled: AtomicBool::new(false),
            snapshot_cancel: Mutex::new(None),
        })
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    pub fn container(&self) -> &Arc<ContainerFs> {
        &self.container
    }

    pub fn routes_root(&self) -> PathBuf {
        self.options.metadata_root.join("routes")
    }

    pub fn route_folder(&self, route: &str) -> PathBuf {
        self.routes_root().join(route)
    }

    /// Global toggle for the client-compatible management API.
    pub fn set_client_api_enabled(&self, enabled: bool) {
        self.client_api_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn client_api_enabled(&self) -> bool {
        self.client_api_enabled.load(Ordering::SeqCst)
    }

    // ----- startup -----

    /// Populate the summary cache and stats history from the index store.
    /// Runs before any network activity.
    pub fn load_meta_from_db(&self) {
        let metas = match self.db.get_all_meta() {
            Ok(m) => m,
            Err(e) => {
                warn!("loading cached summaries failed: {}", e);
                return;
            }
        };
        let mut routes = HashSet::new();
        let mut state = self.state.lock().unwrap();
        for (hex, raw) in metas {
            let mut summary = match TorrentSummary::decode(&raw) {
                Some(s) => s,
                None => continue,
            };
            if summary.hash.is_empty() {
                summary.hash = hex.clone();
            }
            let hash = match InfoHash::from_hex(&summary.hash) {
                Ok(h) => h,
                Err(_) => continue,
            };
            self.stats.seed_previous(hash, &summary);
            routes.insert(summary.route.clone());
            state.cached.insert(hash, summary);
        }
        for route in routes {
            Self::rebuild_overlay_index_locked(&mut state, &route);
        }
        info!("loaded {} cached summaries", state.cached.len());
    }

    /// Mount every known route (index store associations plus UI-managed
    /// folders) before any torrent is added, so front-ends see the full
    /// tree immediately.
    pub async fn pre_add_routes(self: &Arc<Self>) {
        let mut routes: HashSet<String> = HashSet::new();
        if let Ok(list) = self.db.list_magnets() {
            routes.extend(list.into_keys());
        }
        if let Ok(list) = self.db.list_file_paths() {
            routes.extend(list.into_keys());
        }
        {
            let state = self.state.lock().unwrap();
            routes.extend(state.cached.values().map(|s| s.route.clone()));
        }
        if let Ok(mut entries) = std::fs::read_dir(self.routes_root()) {
            while let Some(Ok(entry)) = entries.next() {
                if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    routes.insert(entry.file_name().to_string_lossy().to_string());
                }
            }
        }
        for route in routes {
            if let Err(e) = self.ensure_route(&route).await {
                warn!("pre-mounting route {} failed: {}", route, e);
            }
        }
    }

    /// Add every persisted torrent to the engine. Individual failures are
    /// logged and skipped.
    pub async fn load(self: &Arc<Self>) {
        info!("adding torrents from the index store");
        match self.db.list_magnets() {
            Ok(list) => {
                for (route, magnets) in list {
                    for magnet in magnets {
                        if let Err(e) = self.add_magnet_local(&route, &magnet).await {
                            warn!("loading magnet into route {} failed: {}", route, e);
                        }
                    }
                }
            }
            Err(e) => warn!("listing magnets failed: {}", e),
        }
        match self.db.list_file_paths() {
            Ok(list) => {
                for (route, paths) in list {
                    for path in paths {
                        if let Err(e) = self.add_file_local(&route, &path).await {
                            warn!(
                                "loading metainfo {} into route {} failed: {}",
                                path.display(),
                                route,
                                e
                            );
                        }
                    }
                }
            }
            Err(e) => warn!("listing metainfo paths failed: {}", e),
        }
    }

    /// Start watchers for every UI-managed route folder.
    pub async fn start_ui_watchers(self: &Arc<Self>) {
        let root = self.routes_root();
        let entries = match std::fs::read_dir(&root) {
            Ok(e) => e,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let route = entry.file_name().to_string_lossy().to_string();
            if let Err(e) = self.start_watcher(&route).await {
                warn!("starting watcher for route {} failed: {}", route, e);
            }
        }
    }

    // ----- routes -----

    fn rebuild_overlay_index_locked(state: &mut ServiceState, route: &str) {
        let index = build_route_index(state.cached.values().filter(|s| s.route == route));
        state.overlay_index.insert(route.to_string(), Arc::new(index));
    }

    fn make_lister(self: &Arc<Self>, route: &str) -> OverlayLister {
        let weak: Weak<Service> = Arc::downgrade(self);
        let route = route.to_string();
        Arc::new(move |path| {
            let service = weak
                .upgrade()
                .ok_or_else(|| SwarmError::InvalidState("service stopped".to_string()))?;
            let state = service.state.lock().unwrap();
            Ok(state
                .overlay_index
                .get(&route)
                .and_then(|index| index.list(path))
                .unwrap_or_default())
        })
    }

    fn make_materializer(self: &Arc<Self>, route: &str) -> Materializer {
        let weak: Weak<Service> = Arc::downgrade(self);
        let route = route.to_string();
        Arc::new(move |path: String| {
            let weak = weak.clone();
            let route = route.clone();
            Box::pin(async move {
                match weak.upgrade() {
                    Some(service) => service.materialize(&route, &path).await,
                    None => Ok(()),
                }
            })
        })
    }

    /// Create the route filesystem and mount it (wrapped in its overlay)
    /// if this route is new. Idempotent.
    pub async fn ensure_route(self: &Arc<Self>, route: &str) -> SwarmResult<Arc<TorrentFs>> {
        validate_route(route)?;
        self.stats.add_route(route);

        let (fs, created) = {
            let mut state = self.state.lock().unwrap();
            match state.route_fs.get(route) {
                Some(fs) => (fs.clone(), false),
                None => {
                    let fs = Arc::new(TorrentFs::new(state.tuning));
                    state.route_fs.insert(route.to_string(), fs.clone());
                    if !state.overlay_index.contains_key(route) {
                        Self::rebuild_overlay_index_locked(&mut state, route);
                    }
                    (fs, true)
                }
            }
        };

        if created {
            let overlay: Arc<dyn Filesystem> = Arc::new(OverlayFs::with_materializer(
                fs.clone(),
                self.make_lister(route),
                self.make_materializer(route),
            ));
            self.container.mount(overlay, &format!("/{}", route)).await?;
            debug!("route {} mounted", route);
        }
        Ok(fs)
    }

    async fn start_watcher(self: &Arc<Self>, route: &str) -> SwarmResult<()> {
        let folder = self.route_folder(route);
        {
            let state = self.state.lock().unwrap();
            if state.watchers.contains_key(route) {
                return Ok(());
            }
        }
        let sync: Arc<dyn FolderSync> = Arc::new(ServiceSyncHandle {
            service: Arc::downgrade(self),
        });
        let watcher = RouteWatcher::start(sync, route, &folder).await?;
        self.state
            .lock()
            .unwrap()
            .watchers
            .insert(route.to_string(), watcher);
        Ok(())
    }

    /// Create a route explicitly: mount it, create its UI-managed folder
    /// and start watching it.
    pub async fn create_route(self: &Arc<Self>, route: &str) -> SwarmResult<()> {
        self.ensure_route(route).await?;
        tokio::fs::create_dir_all(self.route_folder(route)).await?;
        self.start_watcher(route).await
    }

    /// Delete a route and everything associated with it: torrents from
    /// engine, index, cache and stats, the mount, and the UI folder.
    pub async fn delete_route(self: &Arc<Self>, route: &str) -> SwarmResult<()> {
        validate_route(route)?;

        if let Some(watcher) = self.state.lock().unwrap().watchers.remove(route) {
            watcher.close();
        }

        let mut hashes: HashSet<InfoHash> =
            self.stats.hashes_for_route(route).into_iter().collect();
        if let Ok(list) = self.db.magnets_for_route(route) {
            hashes.extend(list.into_iter().map(|(h, _)| h));
        }
        if let Ok(list) = self.db.files_for_route(route) {
            hashes.extend(list.into_iter().map(|(h, _)| h));
        }
        {
            let state = self.state.lock().unwrap();
            hashes.extend(
                state
                    .cached
                    .iter()
                    .filter(|(_, s)| s.route == route)
                    .map(|(h, _)| *h),
            );
        }
        for hash in hashes {
            if let Err(e) = self.remove_from_hash(route, &hash).await {
                warn!(
                    "removing torrent {} while deleting route {}: {}",
                    hash, route, e
                );
            }
        }

        match tokio::fs::remove_dir_all(self.route_folder(route)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        self.stats.remove_route(route);
        self.container.unmount(&format!("/{}", route)).await?;
        {
            let mut state = self.state.lock().unwrap();
            state.route_fs.remove(route);
            state.overlay_index.remove(route);
        }
        info!("route {} deleted", route);
        Ok(())
    }

    // ----- adds -----

    /// Add a magnet to a route: the association is durable in the index
    /// store before the engine mutation becomes observable.
    pub async fn add_magnet(self: &Arc<Self>, route: &str, uri: &str) -> SwarmResult<InfoHash> {
        validate_route(route)?;
        self.db.add_magnet(route, uri)?;
        self.add_magnet_local(route, uri).await
    }

    /// Engine-and-runtime half of a magnet add; no index store write.
    pub async fn add_magnet_local(
        self: &Arc<Self>,
        route: &str,
        uri: &str,
    ) -> SwarmResult<InfoHash> {
        self.ensure_route(route).await?;
        let handle = self.engine.add_magnet(uri).await?;
        self.register_torrent(route, handle).await
    }

    /// Add a metainfo file to a route and track the file association.
    /// Returns the torrent hash.
    pub async fn add_torrent_path(
        self: &Arc<Self>,
        route: &str,
        path: &Path,
    ) -> SwarmResult<InfoHash> {
        let hash = self.add_file_local(route, path).await?;
        if let Err(e) = self.db.add_file(route, &hash, path) {
            warn!(
                "persisting metainfo association {} failed: {}",
                path.display(),
                e
            );
        }
        Ok(hash)
    }

    async fn add_file_local(self: &Arc<Self>, route: &str, path: &Path) -> SwarmResult<InfoHash> {
        self.ensure_route(route).await?;
        let handle = self.engine.add_metainfo_file(path).await?;
        let hash = self.register_torrent(route, handle).await?;
        self.state
            .lock()
            .unwrap()
            .path_to_hash
            .insert(path.to_path_buf(), hash);
        Ok(hash)
    }

    async fn register_torrent(
        self: &Arc<Self>,
        route: &str,
        handle: Arc<dyn TorrentHandle>,
    ) -> SwarmResult<InfoHash> {
        let hash = handle.info_hash();

        if handle.info().is_none() {
            if self.options.continue_on_add_timeout {
                let waiter = handle.clone();
                let add_timeout = self.options.add_timeout;
                tokio::spawn(async move {
                    match timeout(add_timeout, waiter.wait_info()).await {
                        Ok(Ok(())) => {
                            info!("obtained torrent info for {}", waiter.info_hash())
                        }
                        _ => warn!(
                            "timeout getting torrent info for {} (non-blocking mode)",
                            waiter.info_hash()
                        ),
                    }
                });
            } else {
                info!("getting torrent info for {}", hash);
                match timeout(self.options.add_timeout, handle.wait_info()).await {
                    Ok(Ok(())) => info!("obtained torrent info for {}", hash),
                    Ok(Err(e)) => return Err(e),
                    Err(_) => {
                        warn!("timeout getting torrent info for {}", hash);
                        return Err(SwarmError::InfoTimeout(hash.hex()));
                    }
                }
            }
        }

        // Stats first so listings reflect the add at once; file entries
        // materialize lazily in the route filesystem.
        self.stats.add(route, handle.clone());
        let fs = {
            let state = self.state.lock().unwrap();
            state.route_fs.get(route).cloned()
        }
        .ok_or_else(|| SwarmError::InvalidState(format!("route {} has no filesystem", route)))?;
        fs.add_torrent(handle.clone()).await;
        info!("torrent {} added to route {}", handle.name(), route);

        let persister = self.clone();
        let persist_route = route.to_string();
        tokio::spawn(async move {
            persister.persist_meta(&persist_route, handle).await;
        });
        Ok(hash)
    }

    // ----- removes -----

    /// Remove a torrent and its index entry; all runtime state goes with
    /// it.
    pub async fn remove_from_hash(
        self: &Arc<Self>,
        route: &str,
        hash: &InfoHash,
    ) -> SwarmResult<()> {
        self.db.remove(route, hash)?;
        self.cleanup_torrent(route, hash).await
    }

    /// Remove a torrent from runtime structures and engine without
    /// touching the magnet association. Used for file-sourced torrents
    /// reconciled by watchers.
    pub async fn remove_from_hash_local(
        self: &Arc<Self>,
        route: &str,
        hash: &InfoHash,
    ) -> SwarmResult<()> {
        self.cleanup_torrent(route, hash).await
    }

    async fn cleanup_torrent(self: &Arc<Self>, route: &str, hash: &InfoHash) -> SwarmResult<()> {
        self.stats.del(route, hash);

        let fs = {
            let state = self.state.lock().unwrap();
            state.route_fs.get(route).cloned()
        };
        if let Some(fs) = fs {
            fs.remove_torrent(hash).await;
        }

        if let Err(e) = self.db.remove_file(route, hash) {
            warn!("removing file association for {}: {}", hash, e);
        }
        if let Err(e) = self.db.delete_meta(hash) {
            warn!("removing cached summary for {}: {}", hash, e);
        }
        {
            let mut state = self.state.lock().unwrap();
            state.cached.remove(hash);
            state.path_to_hash.retain(|_, h| h != hash);
            Self::rebuild_overlay_index_locked(&mut state, route);
        }
        if let Err(e) = self.cache.remove_torrent(hash).await {
            warn!("releasing cached pieces for {}: {}", hash, e);
        }
        if let Err(e) = self.engine.drop_torrent(hash).await {
            warn!("dropping torrent {} from engine: {}", hash, e);
        }
        Ok(())
    }

    /// Remove a torrent known only by its metainfo path, if tracked.
    pub async fn maybe_remove_by_path(self: &Arc<Self>, route: &str, path: &Path) -> bool {
        let hash = {
            let state = self.state.lock().unwrap();
            state.path_to_hash.get(path).copied()
        };
        let hash = match hash {
            Some(h) => h,
            None => return false,
        };
        if let Err(e) = self.remove_from_hash_local(route, &hash).await {
            warn!(
                "removing torrent by path {} failed: {}",
                path.display(),
                e
            );
            return false;
        }
        self.state.lock().unwrap().path_to_hash.remove(path);
        true
    }

    // ----- summaries -----

    fn build_summary(&self, route: &str, handle: &Arc<dyn TorrentHandle>) -> Option<TorrentSummary> {
        let info = handle.info()?;
        let hash = handle.info_hash();
        let engine_stats = handle.stats();
        let (down, up, peers, seeders, added_at) = self
            .stats
            .previous_totals(&hash)
            .unwrap_or((0, 0, 0, 0, unix_now()));
        let total_pieces = engine_stats.piece_runs.iter().map(|r| r.num_pieces).sum();
        Some(TorrentSummary {
            hash: hash.hex(),
            route: route.to_string(),
            name: info.name.clone(),
            size_bytes: info.total_file_length(),
            piece_bytes: info.piece_length,
            added_at,
            peers,
            seeders,
            down_total: down,
            up_total: up,
            files: TorrentSummary::files_from_info(&info),
            piece_chunks: engine_stats.piece_runs,
            total_pieces,
        })
    }

    fn store_summary(&self, hash: InfoHash, summary: TorrentSummary) {
        if let Err(e) = self.db.set_meta(&hash, &summary.encode()) {
            warn!("persisting summary for {}: {}", hash, e);
        }
        let route = summary.route.clone();
        let mut state = self.state.lock().unwrap();
        state.cached.insert(hash, summary);
        Self::rebuild_overlay_index_locked(&mut state, &route);
    }

    /// Wait for metadata (bounded) and persist the torrent's summary.
    async fn persist_meta(self: &Arc<Self>, route: &str, handle: Arc<dyn TorrentHandle>) {
        if handle.info().is_none()
            && timeout(self.options.add_timeout, handle.wait_info())
                .await
                .is_err()
        {
            return;
        }
        if let Some(summary) = self.build_summary(route, &handle) {
            self.store_summary(handle.info_hash(), summary);
        }
    }

    /// Snapshot every live torrent into the index store.
    pub async fn dump_state(self: &Arc<Self>) {
        for (route, hash, handle) in self.stats.live_torrents() {
            let summary = match self.build_summary(&route, &handle) {
                Some(s) => s,
                None => {
                    let state = self.state.lock().unwrap();
                    match state.cached.get(&hash) {
                        Some(cached) => cached.clone(),
                        None => continue,
                    }
                }
            };
            self.store_summary(hash, summary);
        }
    }

    /// Start the periodic summary snapshotter.
    pub fn start_meta_persistence(self: &Arc<Self>) {
        let cancel = CancellationToken::new();
        {
            let mut slot = self.snapshot_cancel.lock().unwrap();
            if let Some(old) = slot.take() {
                old.cancel();
            }
            *slot = Some(cancel.clone());
        }
        let service = self.clone();
        tokio::spawn(async move {
            loop {
                service.dump_state().await;
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(SNAPSHOT_INTERVAL) => {}
                }
            }
        });
    }

    /// Stop the snapshotter and flush one final snapshot.
    pub async fn stop_meta_persistence(self: &Arc<Self>) {
        let cancel = self.snapshot_cancel.lock().unwrap().take();
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        self.dump_state().await;
    }

    // ----- materialization -----

    /// Make the base filesystem able to serve `rel_path` under `route`:
    /// find the torrent whose name matches the first component, re-add its
    /// source, fall back to sweeping every known source for the route, and
    /// nudge an open.
    async fn materialize(self: &Arc<Self>, route: &str, rel_path: &str) -> SwarmResult<()> {
        let fs = {
            let state = self.state.lock().unwrap();
            state.route_fs.get(route).cloned()
        };
        let fs = match fs {
            Some(fs) => fs,
            None => return Ok(()),
        };
        if fs.open(rel_path).await.is_ok() {
            return Ok(());
        }

        let segment = first_component(rel_path).to_string();
        let target = {
            let state = self.state.lock().unwrap();
            state
                .cached
                .iter()
                .find(|(_, s)| s.route == route && s.name == segment)
                .map(|(h, _)| *h)
        };
        let magnets = self.db.magnets_for_route(route).unwrap_or_default();
        let files = self.db.files_for_route(route).unwrap_or_default();

        let mut done = false;
        if let Some(hash) = target {
            if let Some((_, path)) = files.iter().find(|(h, _)| *h == hash) {
                done = self.add_file_local(route, path).await.is_ok();
            }
            if !done {
                if let Some((_, magnet)) = magnets.iter().find(|(h, _)| *h == hash) {
                    done = self.add_magnet_local(route, magnet).await.is_ok();
                }
            }
        }
        if !done {
            for (_, magnet) in &magnets {
                if self.add_magnet_local(route, magnet).await.is_ok() {
                    break;
                }
            }
            for (_, path) in &files {
                if self.add_file_local(route, path).await.is_ok() {
                    break;
                }
            }
        }

        let _ = fs.open(rel_path).await;
        Ok(())
    }

    // ----- queries -----

    /// File list for a hash: live engine first, cached summary as
    /// fallback.
    pub async fn files_for_hash(&self, hash: &InfoHash) -> SwarmResult<Vec<FileSummary>> {
        if let Some(handle) = self.engine.get(hash).await {
            if handle.info().is_none() {
                let _ = timeout(Duration::from_secs(2), handle.wait_info()).await;
            }
            if let Some(info) = handle.info() {
                return Ok(TorrentSummary::files_from_info(&info));
            }
        }
        let state = self.state.lock().unwrap();
        state
            .cached
            .get(hash)
            .map(|s| s.files.clone())
            .ok_or_else(|| SwarmError::NotFound(format!("torrent {}", hash)))
    }

    fn stats_from_summary(summary: &TorrentSummary) -> TorrentStats {
        TorrentStats {
            name: summary.name.clone(),
            hash: summary.hash.clone(),
            size_bytes: summary.size_bytes,
            piece_size: summary.piece_bytes,
            peers: summary.peers,
            seeders: summary.seeders,
            added_at: summary.added_at,
            time_passed: 1.0,
            ..Default::default()
        }
    }

    /// Route listings synthesized purely from cached summaries, for the
    /// window before the engine has loaded anything.
    pub fn cached_routes_stats(&self) -> Vec<RouteStats> {
        let state = self.state.lock().unwrap();
        let mut by_route: HashMap<String, Vec<TorrentStats>> = HashMap::new();
        for summary in state.cached.values() {
            by_route
                .entry(summary.route.clone())
                .or_default()
                .push(Self::stats_from_summary(summary));
        }
        let mut out: Vec<RouteStats> = by_route
            .into_iter()
            .map(|(name, mut rows)| {
                rows.sort_by(|a, b| a.name.cmp(&b.name));
                RouteStats {
                    name,
                    torrent_stats: rows,
                }
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn cached_stat(&self, hash: &InfoHash) -> Option<TorrentStats> {
        let state = self.state.lock().unwrap();
        state.cached.get(hash).map(Self::stats_from_summary)
    }

    /// Paginated union of live and cached torrents for a route, sorted by
    /// name. Live entries win; cached-only rows fill the gaps until the
    /// engine catches up.
    pub fn merged_route_page(&self, route: &str, page: usize, size: usize) -> RoutePageStats {
        let size = if size == 0 { 25 } else { size };
        let page = page.max(1);

        let mut rows = self.stats.route_rows(route);
        let live: HashSet<String> = rows.iter().map(|r| r.hash.clone()).collect();
        {
            let state = self.state.lock().unwrap();
            for summary in state.cached.values() {
                if summary.route != route || live.contains(&summary.hash) {
                    continue;
                }
                rows.push(Self::stats_from_summary(summary));
            }
        }
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        paginate(route, rows, page, size)
    }

    // ----- tuning -----

    /// Update reader pool size and readahead window; applies to handles
    /// opened from now on across every route filesystem.
    pub async fn apply_tuning(&self, pool_size: usize, readahead_bytes: u64) {
        let (tuning, filesystems) = {
            let mut state = self.state.lock().unwrap();
            state.tuning.pool_size = pool_size.max(1);
            state.tuning.readahead_bytes = readahead_bytes;
            (
                state.tuning,
                state.route_fs.values().cloned().collect::<Vec<_>>(),
            )
        };
        for fs in filesystems {
            fs.set_tuning(tuning).await;
        }
    }

    // ----- folder reconciliation -----

    fn collect_metainfo_files(folder: &Path) -> Vec<PathBuf> {
        let mut out = Vec::new();
        let mut stack = vec![folder.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let entries = match std::fs::read_dir(&dir) {
                Ok(e) => e,
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if path.extension().map(|e| e == "torrent").unwrap_or(false) {
                    out.push(path);
                }
            }
        }
        out
    }

    /// Reconcile the metainfo files on disk with the runtime state of the
    /// route: new files are added, torrents whose file disappeared are
    /// unloaded.
    pub async fn sync_route_folder(self: &Arc<Self>, route: &str, folder: &Path) -> SwarmResult<()> {
        let scan_folder = folder.to_path_buf();
        let disk: HashSet<PathBuf> =
            tokio::task::spawn_blocking(move || Self::collect_metainfo_files(&scan_folder))
                .await
                .map_err(|e| SwarmError::Internal(e.to_string()))?
                .into_iter()
                .collect();

        let current: HashMap<PathBuf, InfoHash> = {
            let state = self.state.lock().unwrap();
            state
                .path_to_hash
                .iter()
                .filter(|(p, _)| p.starts_with(folder))
                .map(|(p, h)| (p.clone(), *h))
                .collect()
        };

        for path in &disk {
            if current.contains_key(path) {
                continue;
            }
            match self.add_torrent_path(route, path).await {
                Ok(hash) => info!(
                    "metainfo file {} added to route {} as {}",
                    path.display(),
                    route,
                    hash
                ),
                Err(e) => error!(
                    "adding metainfo file {} to route {} failed: {}",
                    path.display(),
                    route,
                    e
                ),
            }
        }

        for (path, hash) in current {
            if disk.contains(&path) {
                continue;
            }
            match self.remove_from_hash_local(route, &hash).await {
                Ok(()) => {
                    self.state.lock().unwrap().path_to_hash.remove(&path);
                    info!(
                        "metainfo file {} gone, torrent {} removed from route {}",
                        path.display(),
                        hash,
                        route
                    );
                }
                Err(e) => error!(
                    "removing torrent {} after metainfo file {} vanished: {}",
                    hash,
                    path.display(),
                    e
                ),
            }
        }
        Ok(())
    }
}

/// Weak adapter handed to watchers so they never keep the service alive.
struct ServiceSyncHandle {
    service: Weak<Service>,
}

#[async_trait]
impl FolderSync for ServiceSyncHandle {
    async fn sync_route_folder(&self, route: &str, folder: &Path) -> SwarmResult<()> {
        match self.service.upgrade() {
            Some(service) => service.sync_route_folder(route, folder).await,
            None => Ok(()),
        }
    }
}
