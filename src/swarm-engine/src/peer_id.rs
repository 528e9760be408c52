use rand::RngCore;
use std::path::Path;
use swarm_vfs::{SwarmError, SwarmResult};
use tokio::fs;

/// Load the persistent 20-byte peer identifier from `path`, generating and
/// storing a fresh one on first start.
pub async fn load_or_create_peer_id(path: &Path) -> SwarmResult<[u8; 20]> {
    match fs::read(path).await {
        Ok(raw) if raw.len() == 20 => {
            let mut id = [0u8; 20];
            id.copy_from_slice(&raw);
            return Ok(id);
        }
        Ok(raw) => {
            warn!(
                "peer id file {} has unexpected length {}, regenerating",
                path.display(),
                raw.len()
            );
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(SwarmError::IoError(format!(
                "reading peer id {}: {}",
                path.display(),
                e
            )))
        }
    }

    let mut id = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut id);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(path, id).await.map_err(|e| {
        SwarmError::IoError(format!("writing peer id {}: {}", path.display(), e))
    })?;
    info!("generated new peer id at {}", path.display());
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_peer_id_created_once_and_reused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ID");

        let first = load_or_create_peer_id(&path).await.unwrap();
        let second = load_or_create_peer_id(&path).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(std::fs::read(&path).unwrap().len(), 20);
    }

    #[tokio::test]
    async fn test_peer_id_replaces_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ID");
        std::fs::write(&path, b"short").unwrap();

        let id = load_or_create_peer_id(&path).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), id);
    }
}
