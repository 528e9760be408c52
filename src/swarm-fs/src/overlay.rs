use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use swarm_vfs::{
    clean_path, split_path, DirEntry, Filesystem, FsNode, InfoDir, InfoFile, SwarmError,
    SwarmResult,
};

/// Produces the cached (placeholder) listing for one directory of the
/// route. Built from persisted summaries by the route service.
pub type OverlayLister =
    Arc<dyn Fn(&str) -> SwarmResult<BTreeMap<String, DirEntry>> + Send + Sync>;

/// Asked to make the base able to serve `path`, typically by re-adding the
/// torrent whose name matches the first component.
pub type Materializer =
    Arc<dyn Fn(String) -> BoxFuture<'static, SwarmResult<()>> + Send + Sync>;

const OPEN_RETRIES: usize = 5;
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Merges cached directory listings over a live base filesystem. Listings
/// union with base entries winning; open misses with a cached entry nudge
/// the materializer and fall back to a zero-byte placeholder, keeping the
/// tree browsable before the engine has anything.
pub struct OverlayFs {
    base: Arc<dyn Filesystem>,
    lister: Option<OverlayLister>,
    materializer: Option<Materializer>,
}

impl OverlayFs {
    pub fn new(base: Arc<dyn Filesystem>, lister: OverlayLister) -> Self {
        Self {
            base,
            lister: Some(lister),
            materializer: None,
        }
    }

    pub fn with_materializer(
        base: Arc<dyn Filesystem>,
        lister: OverlayLister,
        materializer: Materializer,
    ) -> Self {
        Self {
            base,
            lister: Some(lister),
            materializer: Some(materializer),
        }
    }

    async fn open_base(&self, path: &str) -> SwarmResult<Arc<dyn FsNode>> {
        match AssertUnwindSafe(self.base.open(path)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(SwarmError::InvalidParam(format!(
                "filesystem panicked opening {}",
                path
            ))),
        }
    }
}

#[async_trait]
impl Filesystem for OverlayFs {
    async fn open(&self, path: &str) -> SwarmResult<Arc<dyn FsNode>> {
        let path = clean_path(path);
        let base_err = match self.open_base(&path).await {
            Ok(node) => return Ok(node),
            Err(e) if e.is_not_found() => e,
            Err(e) => return Err(e),
        };

        let lister = match &self.lister {
            Some(l) => l,
            None => return Err(base_err),
        };
        let (dir, name) = split_path(&path);
        let entries = match lister(&dir) {
            Ok(entries) => entries,
            Err(_) => return Err(base_err),
        };
        let placeholder = match entries.get(&name) {
            Some(entry) => *entry,
            None => return Err(base_err),
        };

        if let Some(materializer) = &self.materializer {
            let materializer = materializer.clone();
            let target = path.clone();
            tokio::spawn(async move {
                if let Err(e) = materializer(target.clone()).await {
                    debug!("materializing {} failed: {}", target, e);
                }
            });
            for _ in 0..OPEN_RETRIES {
                tokio::time::sleep(OPEN_RETRY_DELAY).await;
                if let Ok(node) = self.open_base(&path).await {
                    return Ok(node);
                }
            }
        }

        if placeholder.is_dir {
            Ok(Arc::new(InfoDir::new(placeholder.size)))
        } else {
            Ok(Arc::new(InfoFile::new(placeholder.size)))
        }
    }

    async fn read_dir(&self, path: &str) -> SwarmResult<BTreeMap<String, DirEntry>> {
        let path = clean_path(path);
        let mut entries = match self.base.read_dir(&path).await {
            Ok(entries) => entries,
            Err(e) if e.is_not_found() => BTreeMap::new(),
            Err(e) => return Err(e),
        };
        if let Some(lister) = &self.lister {
            if let Ok(cached) = lister(&path) {
                for (name, entry) in cached {
                    entries.entry(name).or_insert(entry);
                }
            }
        }
        Ok(entries)
    }
}
