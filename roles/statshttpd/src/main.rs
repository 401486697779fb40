use std::sync::Arc;

use msg_log::hub::{run_tcp_ingest, Framing};
use msg_log::LogHub;
use pool_redis::PoolRedis;
use sharelog::SHARE_SIZE;
use tokio::net::TcpListener;
use tracing::{error, info};

mod api;
mod config;
mod db_flush;
mod events;
mod redis_flush;
mod server;

use config::Config;
use server::StatsServer;

const SHARELOG_TOPIC: &str = "sharelog";
const COMMON_EVENTS_TOPIC: &str = "common_events";

// Start roughly one hour of traffic back: with 100,000 online workers
// submitting every 10 seconds, an hour is 36,000,000 shares.
const SHARELOG_TAIL_N: usize = 36_000_000;
const COMMON_EVENTS_TAIL_N: usize = 100_000;

/// Messages retained per topic for late subscribers.
const TOPIC_RETENTION: usize = 1_000_000;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_args()?;
    info!("Starting statshttpd");
    info!("Share ingest: {}", config.sharelog_listen_address);
    info!("Events ingest: {}", config.events_listen_address);
    info!("HTTP server: {}", config.httpd_listen_address);

    // external stores; a failed ping here is fatal
    let db = match &config.mysql_url {
        Some(url) => {
            let pool = pool_db::connect(url).await?;
            pool_db::check_server(&pool).await?;
            Some(pool)
        }
        None => None,
    };

    let mut redis_group = Vec::new();
    let mut redis_events = None;
    if let Some(url) = &config.redis_url {
        for i in 0..config.redis_concurrency {
            let redis = PoolRedis::new(url).await?;
            if let Err(e) = redis.ping().await {
                error!("redis {} in flush group ping failure: {}", i, e);
                return Err(e.into());
            }
            redis_group.push(redis);
        }
        let events_redis = PoolRedis::new(url).await?;
        events_redis.ping().await?;
        redis_events = Some(events_redis);
    }

    let hub = LogHub::new(TOPIC_RETENTION);
    hub.create_topic(SHARELOG_TOPIC);
    hub.create_topic(COMMON_EVENTS_TOPIC);

    let sharelog_listener = TcpListener::bind(&config.sharelog_listen_address).await?;
    tokio::spawn(run_tcp_ingest(
        sharelog_listener,
        hub.clone(),
        SHARELOG_TOPIC.to_string(),
        Framing::FixedWidth(SHARE_SIZE),
    ));

    let events_listener = TcpListener::bind(&config.events_listen_address).await?;
    tokio::spawn(run_tcp_ingest(
        events_listener,
        hub.clone(),
        COMMON_EVENTS_TOPIC.to_string(),
        Framing::Lines,
    ));

    let share_consumer = hub.subscribe_tail(SHARELOG_TOPIC, SHARELOG_TAIL_N)?;
    let events_consumer = hub.subscribe_tail(COMMON_EVENTS_TOPIC, COMMON_EVENTS_TAIL_N)?;

    let httpd_address = config.httpd_listen_address.clone();
    let server = Arc::new(StatsServer::new(config, db, redis_group, redis_events));

    let consume_server = server.clone();
    tokio::spawn(async move {
        if let Err(e) = consume_server.run_consume(share_consumer).await {
            error!("share consume loop failed: {}", e);
        }
    });

    let events_server = server.clone();
    tokio::spawn(events::run_consume(events_server, events_consumer));

    let shutdown = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            shutdown.stop();
        }
    });

    if let Err(e) = api::run_http_server(httpd_address, server).await {
        error!("HTTP server error: {}", e);
        return Err(e);
    }
    Ok(())
}
