use crate::node::DirEntry;
use crate::path::{clean_path, split_path};
use std::collections::{BTreeMap, HashMap};

/// Reference into an [`EntryTree`] lookup.
pub enum TreeRef<'a, T> {
    File { size: u64, payload: &'a T },
    Dir { size: u64 },
}

/// Path-indexed tree of file entries with ancestor size aggregation.
///
/// Leaf files carry a payload; directories are implicit and their size is
/// the sum of the leaf sizes beneath them. Listing rows are kept current as
/// entries are inserted, so `list` is O(1) per directory.
pub struct EntryTree<T> {
    files: HashMap<String, (u64, T)>,
    dirs: HashMap<String, u64>,
    children: HashMap<String, BTreeMap<String, DirEntry>>,
}

impl<T> EntryTree<T> {
    pub fn new() -> Self {
        let mut dirs = HashMap::new();
        dirs.insert("/".to_string(), 0);
        let mut children = HashMap::new();
        children.insert("/".to_string(), BTreeMap::new());
        Self {
            files: HashMap::new(),
            dirs,
            children,
        }
    }

    pub fn clear(&mut self) {
        self.files.clear();
        self.dirs.clear();
        self.children.clear();
        self.dirs.insert("/".to_string(), 0);
        self.children.insert("/".to_string(), BTreeMap::new());
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.dirs.len() == 1
    }

    /// Insert a leaf file. Parent directories are created as needed and the
    /// file size is propagated to every ancestor, including "/".
    /// Re-inserting an existing path is a no-op.
    pub fn insert(&mut self, path: &str, size: u64, payload: T) {
        let path = clean_path(path);
        if path == "/" || self.files.contains_key(&path) {
            return;
        }
        // A directory with the same name wins; keep listings consistent.
        if self.dirs.contains_key(&path) {
            return;
        }

        let (parent, name) = split_path(&path);
        self.ensure_dir(&parent);
        self.children
            .get_mut(&parent)
            .expect("parent directory exists")
            .insert(name, DirEntry::file(size));
        self.files.insert(path.clone(), (size, payload));
        self.bump_ancestors(&parent, size);
    }

    /// Insert an (empty) directory entry without any files beneath it.
    pub fn insert_dir(&mut self, path: &str) {
        let path = clean_path(path);
        self.ensure_dir(&path);
    }

    pub fn get(&self, path: &str) -> Option<TreeRef<'_, T>> {
        let path = clean_path(path);
        if let Some((size, payload)) = self.files.get(&path) {
            return Some(TreeRef::File {
                size: *size,
                payload,
            });
        }
        self.dirs.get(&path).map(|size| TreeRef::Dir { size: *size })
    }

    pub fn contains(&self, path: &str) -> bool {
        let path = clean_path(path);
        self.files.contains_key(&path) || self.dirs.contains_key(&path)
    }

    /// Listing of one directory, or None if the path is not a directory.
    pub fn list(&self, path: &str) -> Option<BTreeMap<String, DirEntry>> {
        let path = clean_path(path);
        self.children.get(&path).cloned()
    }

    /// Remove a direct child entry of `parent` from its listing. Used by
    /// the container when unmounting; sizes of ancestors are left as-is for
    /// plain dir entries (mounted sub-filesystems contribute no size here).
    pub fn remove_child(&mut self, parent: &str, name: &str) {
        let parent = clean_path(parent);
        if let Some(ch) = self.children.get_mut(&parent) {
            ch.remove(name);
        }
    }

    fn ensure_dir(&mut self, path: &str) {
        if self.dirs.contains_key(path) {
            return;
        }
        self.dirs.insert(path.to_string(), 0);
        self.children.entry(path.to_string()).or_default();
        if path != "/" {
            let (parent, name) = split_path(path);
            self.ensure_dir(&parent);
            self.children
                .get_mut(&parent)
                .expect("parent directory exists")
                .insert(name, DirEntry::dir(0));
        }
    }

    /// Add `size` to `start` and every ancestor directory, refreshing the
    /// cached listing rows on the way up.
    fn bump_ancestors(&mut self, start: &str, size: u64) {
        let mut cur = start.to_string();
        loop {
            if let Some(s) = self.dirs.get_mut(&cur) {
                *s += size;
            }
            if cur != "/" {
                let (parent, name) = split_path(&cur);
                let total = *self.dirs.get(&cur).unwrap_or(&0);
                if let Some(ch) = self.children.get_mut(&parent) {
                    ch.insert(name, DirEntry::dir(total));
                }
                cur = parent;
            } else {
                break;
            }
        }
    }
}

impl<T> Default for EntryTree<T> {
    fn default() -> Self {
        Self::new()
    }
}
