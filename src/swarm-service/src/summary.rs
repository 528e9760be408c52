use serde::{Deserialize, Serialize};
use swarm_engine::{PieceRun, TorrentInfo};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSummary {
    pub path: String,
    pub length: u64,
}

/// Cached per-torrent state persisted under `/meta/<hash>`. Read at startup
/// before any network activity so listings and stats have something to
/// show; refreshed on info-ready, every snapshot tick, and at shutdown.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TorrentSummary {
    pub hash: String,
    pub route: String,
    pub name: String,
    pub size_bytes: u64,
    pub piece_bytes: u64,
    /// Seconds since the epoch.
    pub added_at: i64,
    pub peers: usize,
    pub seeders: usize,
    pub down_total: u64,
    pub up_total: u64,
    pub files: Vec<FileSummary>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub piece_chunks: Vec<PieceRun>,
    #[serde(skip_serializing_if = "is_zero")]
    pub total_pieces: usize,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

impl TorrentSummary {
    pub fn files_from_info(info: &TorrentInfo) -> Vec<FileSummary> {
        info.files
            .iter()
            .map(|f| FileSummary {
                path: f.path.clone(),
                length: f.length,
            })
            .collect()
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("summary serializes")
    }

    pub fn decode(raw: &[u8]) -> Option<Self> {
        serde_json::from_slice(raw).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarm_engine::PieceStatus;

    #[test]
    fn test_summary_json_field_names() {
        let summary = TorrentSummary {
            hash: "ff".repeat(20),
            route: "movies".to_string(),
            name: "bigbuck.mkv".to_string(),
            size_bytes: 4194304,
            piece_bytes: 262144,
            added_at: 1700000000,
            peers: 3,
            seeders: 2,
            down_total: 100,
            up_total: 50,
            files: vec![FileSummary {
                path: "bigbuck.mkv".to_string(),
                length: 4194304,
            }],
            piece_chunks: vec![PieceRun {
                status: PieceStatus::Complete,
                num_pieces: 16,
            }],
            total_pieces: 16,
        };
        let json: serde_json::Value =
            serde_json::from_slice(&summary.encode()).unwrap();
        assert_eq!(json["sizeBytes"], 4194304);
        assert_eq!(json["pieceBytes"], 262144);
        assert_eq!(json["addedAt"], 1700000000);
        assert_eq!(json["downTotal"], 100);
        assert_eq!(json["upTotal"], 50);
        assert_eq!(json["files"][0]["path"], "bigbuck.mkv");
        assert_eq!(json["files"][0]["length"], 4194304);
        assert_eq!(json["pieceChunks"][0]["status"], "C");
        assert_eq!(json["pieceChunks"][0]["numPieces"], 16);
        assert_eq!(json["totalPieces"], 16);

        let back = TorrentSummary::decode(&summary.encode()).unwrap();
        assert_eq!(back.files, summary.files);
        assert_eq!(back.total_pieces, 16);
    }

    #[test]
    fn test_optional_fields_omitted() {
        let summary = TorrentSummary::default();
        let json: serde_json::Value =
            serde_json::from_slice(&summary.encode()).unwrap();
        assert!(json.get("pieceChunks").is_none());
        assert!(json.get("totalPieces").is_none());
    }
}
