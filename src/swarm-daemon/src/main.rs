mod config;

use config::{Config, DEFAULT_CONFIG_PATH};
use log::{error, info};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use swarm_engine::{
    load_or_create_peer_id, MemoryEngine, MemoryEngineOptions, PieceCache, RqbitEngine,
    TorrentEngine,
};
use swarm_service::{
    set_watch_interval, HealthMonitor, IndexStore, Service, ServiceOptions, Stats,
};
use swarm_vfs::{builtin_factories, ContainerFs, SwarmError, SwarmResult};

struct RunOptions {
    config_path: PathBuf,
}

fn usage() -> String {
    format!(
        "usage: swarmfs [--config <path>]\n\
         default:\n\
         --config {}",
        DEFAULT_CONFIG_PATH
    )
}

fn parse_args() -> Result<RunOptions, String> {
    let args = env::args().skip(1).collect::<Vec<String>>();
    let mut config_path = PathBuf::from(DEFAULT_CONFIG_PATH);

    let mut i = 0usize;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => return Err(usage()),
            "--config" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --config".to_string())?;
                config_path = PathBuf::from(value);
            }
            other => {
                return Err(format!("unknown argument: {}\n{}", other, usage()));
            }
        }
        i += 1;
    }

    Ok(RunOptions { config_path })
}

async fn run(options: RunOptions) -> SwarmResult<()> {
    let conf = Config::load_or_create(&options.config_path)?;
    set_watch_interval(conf.watch_interval_secs);

    tokio::fs::create_dir_all(&conf.metadata_root).await?;
    tokio::fs::create_dir_all(conf.metadata_root.join("routes")).await?;

    let peer_id = load_or_create_peer_id(&conf.metadata_root.join("ID")).await?;
    info!("peer id {}", hex::encode(peer_id));

    info!(
        "piece cache capacity set to {} MiB",
        conf.cache_capacity_mib
    );
    let cache_root = conf.metadata_root.join("cache");
    let cache = Arc::new(PieceCache::open(cache_root.clone(), conf.cache_capacity_bytes()).await?);

    let engine: Arc<dyn TorrentEngine> = match conf.engine.as_str() {
        "memory" => Arc::new(MemoryEngine::new(
            MemoryEngineOptions::default().with_cache(cache.clone()),
        )),
        "rqbit" => Arc::new(RqbitEngine::new(&cache_root).await?),
        other => {
            return Err(SwarmError::InvalidParam(format!(
                "unknown engine {:?}",
                other
            )))
        }
    };

    let db = Arc::new(IndexStore::open(&conf.metadata_root.join("magnetdb"))?);
    let stats = Arc::new(Stats::new());
    let container = Arc::new(ContainerFs::new(builtin_factories()));

    let service = Service::new(
        engine,
        db,
        stats,
        cache,
        container,
        ServiceOptions {
            metadata_root: conf.metadata_root.clone(),
            add_timeout: conf.add_timeout(),
            read_timeout: conf.read_timeout(),
            continue_on_add_timeout: conf.continue_on_add_timeout,
            reader_pool_size: conf.reader_pool_size,
            readahead_bytes: conf.readahead_bytes(),
        },
    );
    service.set_client_api_enabled(conf.client_api_enabled);

    // Cached summaries and mounts come up before any network activity so
    // the tree is browsable immediately.
    service.load_meta_from_db();
    service.pre_add_routes().await;
    service.start_meta_persistence();

    let loader = service.clone();
    tokio::spawn(async move {
        info!("loading torrents in background");
        loader.load().await;
        loader.start_ui_watchers().await;
    });

    let health = HealthMonitor::start(service.clone(), conf.health.to_config());

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| SwarmError::Internal(format!("waiting for shutdown signal: {}", e)))?;
    info!("shutting down");
    if let Some(health) = health {
        health.stop();
    }
    service.stop_meta_persistence().await;
    info!("final summary snapshot written, exiting");
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let options = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{}", msg);
            std::process::exit(1);
        }
    };

    if let Err(err) = run(options).await {
        error!("swarmfs failed to start: {}", err);
        std::process::exit(1);
    }
}
