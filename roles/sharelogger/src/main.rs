use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use msg_log::hub::{run_tcp_ingest, Framing};
use msg_log::LogHub;
use sharelog::SHARE_SIZE;
use tokio::net::TcpListener;
use tracing::{error, info};

mod config;
mod writer;

use config::Config;
use writer::ShareLogWriter;

const SHARELOG_TOPIC: &str = "sharelog";

/// Retained messages: enough to replay a short producer outage.
const SHARELOG_RETENTION: usize = 1_000_000;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_args()?;
    info!("Starting sharelogger");
    info!("Share ingest: {}", config.sharelog_listen_address);
    info!("Data dir: {}", config.data_dir);

    std::fs::create_dir_all(&config.data_dir)?;

    let hub = LogHub::new(SHARELOG_RETENTION);
    hub.create_topic(SHARELOG_TOPIC);

    let listener = TcpListener::bind(&config.sharelog_listen_address).await?;
    let ingest_hub = hub.clone();
    tokio::spawn(run_tcp_ingest(
        listener,
        ingest_hub,
        SHARELOG_TOPIC.to_string(),
        Framing::FixedWidth(SHARE_SIZE),
    ));

    let consumer = hub.subscribe_group(SHARELOG_TOPIC, &config.consumer_group)?;
    let writer = ShareLogWriter::new(&config.data_dir);
    let running = Arc::new(AtomicBool::new(true));

    let stopper = running.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            stopper.store(false, Ordering::Relaxed);
        }
    });

    if let Err(e) = writer.run(consumer, running).await {
        error!("sharelog writer failed: {}", e);
        return Err(e.into());
    }
    Ok(())
}
