use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use swarm_service::HealthConfig;
use swarm_vfs::{SwarmError, SwarmResult};

pub const DEFAULT_CONFIG_PATH: &str = "./swarmfs-data/config/swarmfs.json";

fn default_metadata_root() -> PathBuf {
    PathBuf::from("./swarmfs-data/metadata")
}

fn default_cache_capacity_mib() -> u64 {
    2048
}

fn default_read_timeout_secs() -> u64 {
    120
}

fn default_add_timeout_secs() -> u64 {
    60
}

fn default_reader_pool_size() -> usize {
    4
}

fn default_readahead_mib() -> u64 {
    2
}

fn default_watch_interval_secs() -> u64 {
    5
}

fn default_engine() -> String {
    "rqbit".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HealthSection {
    pub enabled: bool,
    pub interval_minutes: u64,
    pub grace_minutes: u64,
    pub min_seeders: usize,
}

impl HealthSection {
    pub fn to_config(&self) -> HealthConfig {
        let defaults = HealthConfig::default();
        HealthConfig {
            enabled: self.enabled,
            interval: if self.interval_minutes == 0 {
                defaults.interval
            } else {
                Duration::from_secs(self.interval_minutes * 60)
            },
            grace: if self.grace_minutes == 0 {
                defaults.grace
            } else {
                Duration::from_secs(self.grace_minutes * 60)
            },
            min_seeders: if self.min_seeders == 0 {
                defaults.min_seeders
            } else {
                self.min_seeders
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub metadata_root: PathBuf,
    pub cache_capacity_mib: u64,
    pub read_timeout_secs: u64,
    pub add_timeout_secs: u64,
    pub continue_on_add_timeout: bool,
    pub reader_pool_size: usize,
    pub readahead_mib: u64,
    pub watch_interval_secs: u64,
    /// "rqbit" for the real engine, "memory" for local serving.
    pub engine: String,
    pub client_api_enabled: bool,
    pub health: HealthSection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            metadata_root: default_metadata_root(),
            cache_capacity_mib: default_cache_capacity_mib(),
            read_timeout_secs: default_read_timeout_secs(),
            add_timeout_secs: default_add_timeout_secs(),
            continue_on_add_timeout: false,
            reader_pool_size: default_reader_pool_size(),
            readahead_mib: default_readahead_mib(),
            watch_interval_secs: default_watch_interval_secs(),
            engine: default_engine(),
            client_api_enabled: false,
            health: HealthSection::default(),
        }
    }
}

impl Config {
    /// Load the config file, writing a default one on first start.
    pub fn load_or_create(path: &Path) -> SwarmResult<Self> {
        if !path.exists() {
            let config = Self::default();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| SwarmError::IoError(e.to_string()))?;
            }
            let raw = serde_json::to_string_pretty(&config)
                .map_err(|e| SwarmError::Internal(e.to_string()))?;
            std::fs::write(path, raw).map_err(|e| SwarmError::IoError(e.to_string()))?;
            return Ok(config);
        }
        let raw =
            std::fs::read_to_string(path).map_err(|e| SwarmError::IoError(e.to_string()))?;
        serde_json::from_str(&raw).map_err(|e| {
            SwarmError::InvalidParam(format!("bad config {}: {}", path.display(), e))
        })
    }

    pub fn cache_capacity_bytes(&self) -> u64 {
        self.cache_capacity_mib * 1024 * 1024
    }

    pub fn readahead_bytes(&self) -> u64 {
        self.readahead_mib * 1024 * 1024
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn add_timeout(&self) -> Duration {
        Duration::from_secs(self.add_timeout_secs)
    }
}
