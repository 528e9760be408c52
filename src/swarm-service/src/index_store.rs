use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use swarm_engine::{InfoHash, MagnetLink};
use swarm_vfs::{SwarmError, SwarmResult};

const ROUTE_ROOT: &str = "/route/";
const FILE_ROOT: &str = "/file/";
const META_ROOT: &str = "/meta/";

/// Embedded ordered key-value store holding route/torrent associations and
/// cached summaries. Single `kv` table, three key prefixes:
///
///   /route/<hex-hash>/<route>  -> magnet uri
///   /file/<hex-hash>/<route>   -> metainfo file path
///   /meta/<hex-hash>           -> serialized summary
///
/// Every mutation is committed (and with synchronous=FULL, durable) before
/// returning.
pub struct IndexStore {
    conn: Mutex<Connection>,
}

impl IndexStore {
    pub fn open(path: &Path) -> SwarmResult<Self> {
        debug!("opening index store at {}", path.display());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SwarmError::IoError(e.to_string()))?;
        }
        let conn = Connection::open(path).map_err(|e| {
            warn!("opening index store failed: {}", e);
            SwarmError::DbError(e.to_string())
        })?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| SwarmError::DbError(e.to_string()))?;
        conn.pragma_update(None, "synchronous", "FULL")
            .map_err(|e| SwarmError::DbError(e.to_string()))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL
            )",
            [],
        )
        .map_err(|e| {
            warn!("creating kv table failed: {}", e);
            SwarmError::DbError(e.to_string())
        })?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn put(&self, key: &str, value: &[u8]) -> SwarmResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
            params![key, value],
        )
        .map_err(|e| {
            warn!("index store put {} failed: {}", key, e);
            SwarmError::DbError(e.to_string())
        })?;
        Ok(())
    }

    fn delete(&self, key: &str) -> SwarmResult<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute("DELETE FROM kv WHERE key = ?1", params![key])
            .map_err(|e| {
                warn!("index store delete {} failed: {}", key, e);
                SwarmError::DbError(e.to_string())
            })?;
        Ok(changed > 0)
    }

    fn scan_prefix(&self, prefix: &str) -> SwarmResult<Vec<(String, Vec<u8>)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT key, value FROM kv WHERE key LIKE ?1 || '%' ORDER BY key")
            .map_err(|e| SwarmError::DbError(e.to_string()))?;
        let rows = stmt
            .query_map(params![prefix], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
            })
            .map_err(|e| SwarmError::DbError(e.to_string()))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| SwarmError::DbError(e.to_string()))?);
        }
        Ok(out)
    }

    /// Parse "<prefix><hash>/<route>" into its parts; keys that do not fit
    /// are skipped by callers.
    fn split_assoc_key(prefix: &str, key: &str) -> Option<(InfoHash, String)> {
        let rest = key.strip_prefix(prefix)?;
        let (hash_hex, route) = rest.split_once('/')?;
        let hash = InfoHash::from_hex(hash_hex).ok()?;
        if route.is_empty() {
            return None;
        }
        Some((hash, route.to_string()))
    }

    /// Persist a magnet association. The hash is parsed out of the magnet;
    /// an unparsable magnet aborts the write.
    pub fn add_magnet(&self, route: &str, magnet: &str) -> SwarmResult<InfoHash> {
        let link = MagnetLink::parse(magnet)?;
        let key = format!("{}{}/{}", ROUTE_ROOT, link.info_hash.hex(), route);
        self.put(&key, magnet.as_bytes())?;
        Ok(link.info_hash)
    }

    /// Delete a magnet association. A missing key still counts as removed
    /// so repeated removals stay idempotent for the UI.
    pub fn remove(&self, route: &str, hash: &InfoHash) -> SwarmResult<bool> {
        let key = format!("{}{}/{}", ROUTE_ROOT, hash.hex(), route);
        self.delete(&key)?;
        Ok(true)
    }

    pub fn add_file(&self, route: &str, hash: &InfoHash, file_path: &Path) -> SwarmResult<()> {
        let key = format!("{}{}/{}", FILE_ROOT, hash.hex(), route);
        self.put(&key, file_path.to_string_lossy().as_bytes())
    }

    pub fn remove_file(&self, route: &str, hash: &InfoHash) -> SwarmResult<()> {
        let key = format!("{}{}/{}", FILE_ROOT, hash.hex(), route);
        self.delete(&key)?;
        Ok(())
    }

    /// route -> magnet uris.
    pub fn list_magnets(&self) -> SwarmResult<HashMap<String, Vec<String>>> {
        let mut out: HashMap<String, Vec<String>> = HashMap::new();
        for (key, value) in self.scan_prefix(ROUTE_ROOT)? {
            if let Some((_, route)) = Self::split_assoc_key(ROUTE_ROOT, &key) {
                out.entry(route)
                    .or_default()
                    .push(String::from_utf8_lossy(&value).to_string());
            }
        }
        Ok(out)
    }

    /// route -> metainfo file paths.
    pub fn list_file_paths(&self) -> SwarmResult<HashMap<String, Vec<PathBuf>>> {
        let mut out: HashMap<String, Vec<PathBuf>> = HashMap::new();
        for (key, value) in self.scan_prefix(FILE_ROOT)? {
            if let Some((_, route)) = Self::split_assoc_key(FILE_ROOT, &key) {
                out.entry(route)
                    .or_default()
                    .push(PathBuf::from(String::from_utf8_lossy(&value).to_string()));
            }
        }
        Ok(out)
    }

    /// route -> hashes, parsed from magnet keys alone.
    pub fn list_magnet_hashes_by_route(&self) -> SwarmResult<HashMap<String, Vec<InfoHash>>> {
        let mut out: HashMap<String, Vec<InfoHash>> = HashMap::new();
        for (key, _) in self.scan_prefix(ROUTE_ROOT)? {
            if let Some((hash, route)) = Self::split_assoc_key(ROUTE_ROOT, &key) {
                out.entry(route).or_default().push(hash);
            }
        }
        Ok(out)
    }

    /// route -> hashes, parsed from file keys alone.
    pub fn list_file_hashes_by_route(&self) -> SwarmResult<HashMap<String, Vec<InfoHash>>> {
        let mut out: HashMap<String, Vec<InfoHash>> = HashMap::new();
        for (key, _) in self.scan_prefix(FILE_ROOT)? {
            if let Some((hash, route)) = Self::split_assoc_key(FILE_ROOT, &key) {
                out.entry(route).or_default().push(hash);
            }
        }
        Ok(out)
    }

    /// (hash, magnet) pairs associated with one route.
    pub fn magnets_for_route(&self, route: &str) -> SwarmResult<Vec<(InfoHash, String)>> {
        let mut out = Vec::new();
        for (key, value) in self.scan_prefix(ROUTE_ROOT)? {
            if let Some((hash, r)) = Self::split_assoc_key(ROUTE_ROOT, &key) {
                if r == route {
                    out.push((hash, String::from_utf8_lossy(&value).to_string()));
                }
            }
        }
        Ok(out)
    }

    /// (hash, metainfo path) pairs associated with one route.
    pub fn files_for_route(&self, route: &str) -> SwarmResult<Vec<(InfoHash, PathBuf)>> {
        let mut out = Vec::new();
        for (key, value) in self.scan_prefix(FILE_ROOT)? {
            if let Some((hash, r)) = Self::split_assoc_key(FILE_ROOT, &key) {
                if r == route {
                    out.push((
                        hash,
                        PathBuf::from(String::from_utf8_lossy(&value).to_string()),
                    ));
                }
            }
        }
        Ok(out)
    }

    pub fn set_meta(&self, hash: &InfoHash, meta: &[u8]) -> SwarmResult<()> {
        self.put(&format!("{}{}", META_ROOT, hash.hex()), meta)
    }

    pub fn get_meta(&self, hash: &InfoHash) -> SwarmResult<Option<Vec<u8>>> {
        let key = format!("{}{}", META_ROOT, hash.hex());
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT value FROM kv WHERE key = ?1")
            .map_err(|e| SwarmError::DbError(e.to_string()))?;
        match stmt.query_row(params![key], |row| row.get::<_, Vec<u8>>(0)) {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => {
                warn!("index store get_meta {} failed: {}", hash, e);
                Err(SwarmError::DbError(e.to_string()))
            }
        }
    }

    /// hex hash -> raw summary bytes.
    pub fn get_all_meta(&self) -> SwarmResult<HashMap<String, Vec<u8>>> {
        let mut out = HashMap::new();
        for (key, value) in self.scan_prefix(META_ROOT)? {
            if let Some(hash) = key.strip_prefix(META_ROOT) {
                out.insert(hash.to_string(), value);
            }
        }
        Ok(out)
    }

    pub fn delete_meta(&self, hash: &InfoHash) -> SwarmResult<()> {
        self.delete(&format!("{}{}", META_ROOT, hash.hex()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const HEX_HASH: &str = "00112233445566778899aabbccddeeff00112233";

    fn store() -> (TempDir, IndexStore) {
        let dir = TempDir::new().unwrap();
        let db = IndexStore::open(&dir.path().join("magnetdb")).unwrap();
        (dir, db)
    }

    fn magnet() -> String {
        format!("magnet:?xt=urn:btih:{}&dn=thing", HEX_HASH)
    }

    #[test]
    fn test_magnet_round_trip() {
        let (_dir, db) = store();
        let hash = db.add_magnet("movies", &magnet()).unwrap();
        assert_eq!(hash.hex(), HEX_HASH);

        let listed = db.list_magnets().unwrap();
        assert_eq!(listed["movies"], vec![magnet()]);

        let hashes = db.list_magnet_hashes_by_route().unwrap();
        assert_eq!(hashes["movies"], vec![hash]);

        assert!(db.remove("movies", &hash).unwrap());
        assert!(db.list_magnets().unwrap().is_empty());
        // Removing again still reports success.
        assert!(db.remove("movies", &hash).unwrap());
    }

    #[test]
    fn test_bad_magnet_aborts_write() {
        let (_dir, db) = store();
        assert!(db.add_magnet("movies", "magnet:?dn=nohash").is_err());
        assert!(db.list_magnets().unwrap().is_empty());
    }

    #[test]
    fn test_file_associations() {
        let (_dir, db) = store();
        let hash = InfoHash::from_hex(HEX_HASH).unwrap();
        db.add_file("tv", &hash, Path::new("/data/a.torrent")).unwrap();

        let listed = db.list_file_paths().unwrap();
        assert_eq!(listed["tv"], vec![PathBuf::from("/data/a.torrent")]);
        assert_eq!(
            db.files_for_route("tv").unwrap(),
            vec![(hash, PathBuf::from("/data/a.torrent"))]
        );
        assert_eq!(db.list_file_hashes_by_route().unwrap()["tv"], vec![hash]);

        db.remove_file("tv", &hash).unwrap();
        assert!(db.list_file_paths().unwrap().is_empty());
    }

    #[test]
    fn test_meta_round_trip() {
        let (_dir, db) = store();
        let hash = InfoHash::from_hex(HEX_HASH).unwrap();
        db.set_meta(&hash, br#"{"name":"x"}"#).unwrap();
        assert_eq!(
            db.get_meta(&hash).unwrap().unwrap(),
            br#"{"name":"x"}"#.to_vec()
        );
        let all = db.get_all_meta().unwrap();
        assert_eq!(all.len(), 1);
        assert!(all.contains_key(HEX_HASH));

        db.delete_meta(&hash).unwrap();
        assert!(db.get_meta(&hash).unwrap().is_none());
    }

    #[test]
    fn test_same_hash_on_two_routes() {
        let (_dir, db) = store();
        db.add_magnet("a", &magnet()).unwrap();
        db.add_magnet("b", &magnet()).unwrap();
        let hashes = db.list_magnet_hashes_by_route().unwrap();
        assert_eq!(hashes.len(), 2);

        let hash = InfoHash::from_hex(HEX_HASH).unwrap();
        db.remove("a", &hash).unwrap();
        let listed = db.list_magnets().unwrap();
        assert!(!listed.contains_key("a"));
        assert!(listed.contains_key("b"));
    }

    #[test]
    fn test_reopen_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("magnetdb");
        {
            let db = IndexStore::open(&path).unwrap();
            db.add_magnet("movies", &magnet()).unwrap();
        }
        let db = IndexStore::open(&path).unwrap();
        assert_eq!(db.list_magnets().unwrap()["movies"], vec![magnet()]);
    }
}
