use crate::service::Service;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use swarm_engine::InfoHash;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub grace: Duration,
    pub min_seeders: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(60 * 60),
            grace: Duration::from_secs(30 * 60),
            min_seeders: 2,
        }
    }
}

/// Periodically samples per-route stats and removes torrents whose seeder
/// count stays below the configured minimum. Fresh torrents get a grace
/// period before they are judged.
pub struct HealthMonitor {
    cancel: CancellationToken,
}

impl HealthMonitor {
    pub fn start(service: Arc<Service>, mut config: HealthConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        if config.interval < Duration::from_secs(60 * 60) {
            config.interval = Duration::from_secs(60 * 60);
        }
        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                Self::check_once(&service, &config).await;
                tokio::select! {
                    _ = loop_cancel.cancelled() => return,
                    _ = tokio::time::sleep(config.interval) => {}
                }
            }
        });
        Some(Self { cancel })
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    async fn check_once(service: &Arc<Service>, config: &HealthConfig) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        for route in service.stats().routes_stats() {
            for row in route.torrent_stats {
                if row.added_at > 0 && (now - row.added_at) < config.grace.as_secs() as i64 {
                    continue;
                }
                if row.seeders >= config.min_seeders {
                    continue;
                }
                let hash = match InfoHash::from_hex(&row.hash) {
                    Ok(h) => h,
                    Err(_) => continue,
                };
                warn!(
                    "torrent {} on route {} is unhealthy ({} seeders), removing",
                    row.hash, route.name, row.seeders
                );
                if let Err(e) = service.remove_from_hash(&route.name, &hash).await {
                    warn!(
                        "removing unhealthy torrent {} from route {}: {}",
                        row.hash, route.name, e
                    );
                }
            }
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
