use crate::summary::TorrentSummary;
use swarm_vfs::{clean_path, join_path, EntryTree};

/// Build the placeholder tree for one route from its cached summaries.
/// Every file listed in a summary becomes a zero-byte placeholder with the
/// real size, wrapped in the torrent-name directory exactly like the live
/// filesystem lays entries out, so the cached and live listings line up
/// name for name.
pub fn build_route_index<'a>(
    summaries: impl Iterator<Item = &'a TorrentSummary>,
) -> EntryTree<()> {
    let mut tree = EntryTree::new();
    for summary in summaries {
        if summary.name.is_empty() {
            continue;
        }
        match summary.files.as_slice() {
            [] => {
                // No file list survived; show the torrent root with the
                // best known aggregate size.
                if summary.size_bytes > 0 {
                    tree.insert(&clean_path(&summary.name), summary.size_bytes, ());
                } else {
                    tree.insert_dir(&clean_path(&summary.name));
                }
            }
            [single] => {
                tree.insert(&clean_path(&summary.name), single.length, ());
            }
            files => {
                for file in files {
                    tree.insert(&join_path(&summary.name, &file.path), file.length, ());
                }
            }
        }
    }
    tree
}
