use crate::archive::{match_factory, ArchiveFactory};
use crate::node::{DirEntry, DirHandle, Filesystem, FsNode};
use crate::path::{clean_path, join_path, split_path};
use crate::tree::{EntryTree, TreeRef};
use crate::{SwarmError, SwarmResult};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

struct ContainerState {
    mounts: HashMap<String, Arc<dyn Filesystem>>,
    /// Mount prefixes sorted longest-first so the first prefix match is the
    /// longest one.
    ordered: Vec<String>,
    /// Parent directories of all mounts.
    tree: EntryTree<()>,
}

impl ContainerState {
    fn refresh_ordered(&mut self) {
        self.ordered = self.mounts.keys().cloned().collect();
        self.ordered.sort_by(|a, b| b.len().cmp(&a.len()));
    }

    fn lookup(&self, path: &str) -> Option<(String, Arc<dyn Filesystem>)> {
        for prefix in &self.ordered {
            let matches = path == prefix
                || path.starts_with(&format!("{}/", prefix))
                || prefix == "/";
            if matches {
                return Some((prefix.clone(), self.mounts[prefix].clone()));
            }
        }
        None
    }
}

/// Mount table over absolute virtual paths. Sub-filesystems are mounted at
/// directory prefixes and selected by longest prefix; files with known
/// archive extensions are expanded on open into nested sub-filesystems.
pub struct ContainerFs {
    state: RwLock<ContainerState>,
    factories: HashMap<String, ArchiveFactory>,
}

impl ContainerFs {
    pub fn new(factories: HashMap<String, ArchiveFactory>) -> Self {
        let mut state = ContainerState {
            mounts: HashMap::new(),
            ordered: Vec::new(),
            tree: EntryTree::new(),
        };
        state.refresh_ordered();
        Self {
            state: RwLock::new(state),
            factories,
        }
    }

    /// Mount a sub-filesystem at `prefix`. Idempotent: an existing mount at
    /// the same prefix is left untouched. Fails with already-exists if the
    /// prefix is occupied by a non-directory.
    pub async fn mount(&self, fs: Arc<dyn Filesystem>, prefix: &str) -> SwarmResult<()> {
        let prefix = clean_path(prefix);
        let mut state = self.state.write().await;
        if state.mounts.contains_key(&prefix) {
            return Ok(());
        }
        if let Some(TreeRef::File { .. }) = state.tree.get(&prefix) {
            return Err(SwarmError::AlreadyExists(prefix));
        }
        state.mounts.insert(prefix.clone(), fs);
        state.refresh_ordered();
        state.tree.insert_dir(&prefix);
        Ok(())
    }

    /// Remove the mount at `prefix` along with any archive mounts nested
    /// beneath it, and drop its entry from the parent listing.
    pub async fn unmount(&self, prefix: &str) -> SwarmResult<()> {
        let prefix = clean_path(prefix);
        let mut state = self.state.write().await;
        state.mounts.remove(&prefix);
        let nested: Vec<String> = state
            .mounts
            .keys()
            .filter(|p| p.starts_with(&format!("{}/", prefix)))
            .cloned()
            .collect();
        for p in nested {
            state.mounts.remove(&p);
        }
        state.refresh_ordered();
        let (parent, name) = split_path(&prefix);
        state.tree.remove_child(&parent, &name);
        Ok(())
    }

    pub async fn mount_prefixes(&self) -> Vec<String> {
        self.state.read().await.ordered.clone()
    }

    /// Expand the first archive component found along `rest` into a mounted
    /// sub-filesystem and return it with the remaining inner path.
    async fn expand_archive(
        &self,
        mount_prefix: &str,
        fs: &Arc<dyn Filesystem>,
        rest: &str,
    ) -> SwarmResult<Option<(Arc<dyn Filesystem>, String)>> {
        let rest = clean_path(rest);
        let comps: Vec<&str> = rest.trim_start_matches('/').split('/').collect();
        let mut consumed = String::new();
        for (i, comp) in comps.iter().enumerate() {
            consumed = format!("{}/{}", consumed, comp);
            let factory = match match_factory(&self.factories, comp) {
                Some(f) => f,
                None => continue,
            };
            let node = match fs.open(&consumed).await {
                Ok(n) => n,
                Err(e) if e.is_not_found() => return Ok(None),
                Err(e) => return Err(e),
            };
            if node.is_dir() {
                continue;
            }
            let virt = join_path(mount_prefix, &consumed);
            debug!("expanding archive at {}", virt);
            let afs = factory(node).await?;
            {
                let mut state = self.state.write().await;
                state.mounts.entry(virt.clone()).or_insert_with(|| afs.clone());
                state.refresh_ordered();
            }
            let inner = if i + 1 < comps.len() {
                format!("/{}", comps[i + 1..].join("/"))
            } else {
                "/".to_string()
            };
            return Ok(Some((afs, inner)));
        }
        Ok(None)
    }
}

#[async_trait]
impl Filesystem for ContainerFs {
    async fn open(&self, path: &str) -> SwarmResult<Arc<dyn FsNode>> {
        let path = clean_path(path);
        let found = {
            let state = self.state.read().await;
            state.lookup(&path)
        };

        if let Some((prefix, fs)) = found {
            if path == prefix {
                return Ok(Arc::new(DirHandle::new(0)));
            }
            let rest = clean_path(&path[prefix.len()..]);
            match fs.open(&rest).await {
                Ok(node) => {
                    // A file with an archive extension opens as a browsable
                    // directory; the sub-filesystem is mounted on first use.
                    let (_, name) = split_path(&rest);
                    if !node.is_dir() && match_factory(&self.factories, &name).is_some() {
                        let size = node.size();
                        if self.expand_archive(&prefix, &fs, &rest).await?.is_some() {
                            return Ok(Arc::new(DirHandle::new(size)));
                        }
                    }
                    Ok(node)
                }
                Err(e) if e.is_not_found() => {
                    match self.expand_archive(&prefix, &fs, &rest).await? {
                        Some((afs, inner)) => afs.open(&inner).await,
                        None => Err(e),
                    }
                }
                Err(e) => Err(e),
            }
        } else {
            let state = self.state.read().await;
            match state.tree.get(&path) {
                Some(TreeRef::Dir { size }) => Ok(Arc::new(DirHandle::new(size))),
                _ => Err(SwarmError::NotFound(path)),
            }
        }
    }

    async fn read_dir(&self, path: &str) -> SwarmResult<BTreeMap<String, DirEntry>> {
        let path = clean_path(path);
        let found = {
            let state = self.state.read().await;
            state.lookup(&path)
        };

        if let Some((prefix, fs)) = found {
            let rest = if path == prefix {
                "/".to_string()
            } else {
                clean_path(&path[prefix.len()..])
            };
            match fs.read_dir(&rest).await {
                Ok(entries) => Ok(entries),
                Err(e) if e.is_not_found() && rest != "/" => {
                    match self.expand_archive(&prefix, &fs, &rest).await? {
                        Some((afs, inner)) => afs.read_dir(&inner).await,
                        None => Err(e),
                    }
                }
                Err(e) => Err(e),
            }
        } else {
            let state = self.state.read().await;
            state
                .tree
                .list(&path)
                .ok_or(SwarmError::NotFound(path))
        }
    }
}
