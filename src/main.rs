use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

use ad_tunnel::config::Config;
use ad_tunnel::engine::{
    http_client, system_memory_limit, Blockade, DefaultSourceResolver, FilterManager, HttpCatalog,
    MatchStrategy, RulesetStore,
};
use ad_tunnel::events::EventBus;
use ad_tunnel::init::{init_persistence, setup_logging};
use ad_tunnel::logger::{MemoryLogSink, RequestLogger};
use ad_tunnel::session::{Session, SessionSettings};
use ad_tunnel::stats::StatsCollector;
use ad_tunnel::tunnel::device::open_tun;
use ad_tunnel::tunnel::ProtectedSockets;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load Config
    let config_path = std::env::args().nth(1).unwrap_or("config.toml".to_string());
    let config_exists = std::path::Path::new(&config_path).exists();
    let config = if config_exists {
        Config::load(&config_path).await?
    } else {
        Config::default()
    };

    // 2. Setup Logging
    setup_logging(&config);
    info!("Starting ad-tunnel...");
    if !config_exists {
        info!("Config file not found, using defaults.");
    }

    // 3. Persistence, events and stats
    let persistence = init_persistence(&config)?;
    let events = EventBus::new();
    let stats = StatsCollector::new();
    if config.stats.enable {
        stats.spawn_logger(config.stats.log_interval_seconds);
    }

    // 4. Request log
    let requests = MemoryLogSink::restore(config.logging.request_log_capacity, &*persistence);
    let logger = RequestLogger::start(&config.logging, &events, Some(requests.clone()));
    info!("Request logging to {} sinks", logger.sink_count());

    // 5. Filters
    let client = http_client()?;
    let blockade = Arc::new(Blockade::new(
        RulesetStore::new(persistence.clone()),
        MatchStrategy::Wildcard,
        system_memory_limit(),
        events.clone(),
    ));
    let manager = FilterManager::new(
        persistence.clone(),
        blockade,
        Arc::new(DefaultSourceResolver::new(client.clone())),
        Arc::new(HttpCatalog::new(client)),
        events.clone(),
    );

    // 6. Session
    let session = Session::new(
        manager,
        persistence,
        events,
        stats,
        requests,
        SessionSettings {
            servers: config.dns.servers.clone(),
            mtu: config.device.mtu,
            tunnel: config.tunnel.clone(),
            blocka: config.blocka.clone(),
            sockets: ProtectedSockets::default(),
        },
    )
    .spawn();

    if !config.filters.repo_url.is_empty() {
        session.set_url(config.filters.repo_url.clone()).await?;
    }
    if !session.sync().await? {
        warn!("No filters active, all queries will be forwarded");
    }

    // 7. Device
    let device = open_tun(&config.device.name)
        .with_context(|| format!("Failed to open TUN device {}", config.device.name))?;
    let layout = session.start(Arc::new(device)).await?;
    info!("Configure {} with:", config.device.name);
    for address in &layout.addresses {
        info!("  address {}", address);
    }
    for route in &layout.routes {
        info!("  route {}", route);
    }
    for server in &layout.dns_servers {
        info!("  dns {}", server);
    }

    // 8. Periodic filter sync
    let sync_interval = Duration::from_secs(config.filters.sync_interval_hours.max(1) * 3600);
    let sync_session = session.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sync_interval);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;
            info!("Scheduled filter sync...");
            if let Err(e) = sync_session.sync().await {
                error!("Scheduled sync failed: {:#}", e);
                break;
            }
        }
    });

    // 9. Graceful Shutdown
    signal::ctrl_c().await?;
    info!("Shutdown signal received.");
    session.stop().await?;

    Ok(())
}
