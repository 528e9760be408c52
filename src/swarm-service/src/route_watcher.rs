use async_trait::async_trait;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use swarm_vfs::{SwarmError, SwarmResult};
use tokio_util::sync::CancellationToken;

/// Debounce interval for folder reconciliation, adjustable at runtime and
/// shared by every watcher.
static WATCH_INTERVAL_SECS: AtomicU64 = AtomicU64::new(5);

pub fn watch_interval() -> Duration {
    Duration::from_secs(WATCH_INTERVAL_SECS.load(Ordering::SeqCst))
}

pub fn set_watch_interval(secs: u64) {
    if secs == 0 {
        return;
    }
    WATCH_INTERVAL_SECS.store(secs, Ordering::SeqCst);
}

/// The slice of the route service a watcher drives.
#[async_trait]
pub trait FolderSync: Send + Sync {
    /// Reconcile the metainfo files under `folder` with the runtime state
    /// of `route`: add files that appeared, drop torrents whose file went
    /// away.
    async fn sync_route_folder(&self, route: &str, folder: &Path) -> SwarmResult<()>;
}

/// Watches one route's folder tree for metainfo changes. Filesystem events
/// only bump a counter; a periodic task reconciles when the counter is
/// non-zero and then subtracts what it saw, tolerating concurrent bumps.
pub struct RouteWatcher {
    route: String,
    folder: PathBuf,
    cancel: CancellationToken,
    /// Held so the native subscription stays alive until stop.
    _watcher: RecommendedWatcher,
}

impl RouteWatcher {
    pub async fn start(
        sync: Arc<dyn FolderSync>,
        route: &str,
        folder: &Path,
    ) -> SwarmResult<Self> {
        tokio::fs::create_dir_all(folder).await?;

        let events = Arc::new(AtomicU64::new(0));
        let counter = events.clone();
        let event_route = route.to_string();
        let mut watcher = notify::recommended_watcher(
            move |result: Result<notify::Event, notify::Error>| match result {
                Ok(_) => {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => {
                    error!("watcher error on route {}: {}", event_route, e);
                }
            },
        )
        .map_err(|e| SwarmError::Internal(format!("creating watcher: {}", e)))?;
        // Recursive mode covers every current sub-directory and picks up
        // newly created ones as well.
        watcher
            .watch(folder, RecursiveMode::Recursive)
            .map_err(|e| SwarmError::Internal(format!("watching {}: {}", folder.display(), e)))?;

        if let Err(e) = sync.sync_route_folder(route, folder).await {
            error!(
                "initial folder sync failed for route {} at {}: {}",
                route,
                folder.display(),
                e
            );
        }

        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let loop_route = route.to_string();
        let loop_folder = folder.to_path_buf();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = loop_cancel.cancelled() => return,
                    _ = tokio::time::sleep(watch_interval()) => {}
                }
                let seen = events.load(Ordering::SeqCst);
                if seen == 0 {
                    continue;
                }
                if let Err(e) = sync.sync_route_folder(&loop_route, &loop_folder).await {
                    error!(
                        "folder sync failed for route {} at {}: {}",
                        loop_route,
                        loop_folder.display(),
                        e
                    );
                }
                events.fetch_sub(seen, Ordering::SeqCst);
            }
        });

        info!(
            "route watcher started for {} at {}",
            route,
            folder.display()
        );
        Ok(Self {
            route: route.to_string(),
            folder: folder.to_path_buf(),
            cancel,
            _watcher: watcher,
        })
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// Stop the debounce loop; dropping the watcher releases the native
    /// subscription.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for RouteWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
